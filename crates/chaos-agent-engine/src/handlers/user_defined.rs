use chaos_agent_core::ExperimentError;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fault::{run_shell, Fault, HandlerEnv};

/// Arbitrary shell commands supplied by the operator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserDefinedAttack {
    pub attack_cmd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recover_cmd: String,
}

impl UserDefinedAttack {
    #[must_use]
    pub fn new(attack_cmd: impl Into<String>, recover_cmd: impl Into<String>) -> Self {
        Self {
            attack_cmd: attack_cmd.into(),
            recover_cmd: recover_cmd.into(),
        }
    }
}

impl Fault for UserDefinedAttack {
    fn action(&self) -> &'static str {
        "run"
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        if self.attack_cmd.trim().is_empty() {
            return Err(ExperimentError::BadConfig(
                "attack_cmd MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        run_shell(&self.attack_cmd, env.cancel)?;
        info!(uid = %env.uid, "user-defined attack command finished");
        Ok(())
    }

    fn revert(&self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        if self.recover_cmd.trim().is_empty() {
            return Ok(());
        }
        run_shell(&self.recover_cmd, env.cancel)?;
        info!(uid = %env.uid, "user-defined recover command finished");
        Ok(())
    }
}
