use chaos_agent_core::ExperimentError;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fault::{run_command, Fault, HandlerEnv};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum JvmAction {
    Gc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JvmAttack {
    pub action: JvmAction,
    pub pid: i32,
}

impl Fault for JvmAttack {
    fn action(&self) -> &'static str {
        match self.action {
            JvmAction::Gc => "gc",
        }
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        if self.pid <= 0 {
            return Err(ExperimentError::BadConfig(format!(
                "pid MUST be positive, got {}",
                self.pid
            )));
        }
        Ok(())
    }

    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        run_command(
            "jcmd",
            &[self.pid.to_string(), "GC.run".to_string()],
            env.cancel,
        )?;
        info!(pid = self.pid, "triggered JVM garbage collection");
        Ok(())
    }

    fn revert(&self, _env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        Err(ExperimentError::NonRecoverable(
            "a JVM garbage collection cannot be undone".to_string(),
        ))
    }
}
