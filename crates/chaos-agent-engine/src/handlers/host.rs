use chaos_agent_core::ExperimentError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fault::{run_command, Fault, HandlerEnv};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum HostAction {
    Shutdown,
    Reboot,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HostAttack {
    pub action: HostAction,
    /// Log the command instead of running it.
    #[serde(default)]
    pub dry_run: bool,
}

impl HostAttack {
    fn command(&self) -> (&'static str, Vec<String>) {
        match self.action {
            HostAction::Shutdown => ("shutdown", vec!["-h".to_string(), "now".to_string()]),
            HostAction::Reboot => ("reboot", Vec::new()),
        }
    }
}

impl Fault for HostAttack {
    fn action(&self) -> &'static str {
        match self.action {
            HostAction::Shutdown => "shutdown",
            HostAction::Reboot => "reboot",
        }
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        Ok(())
    }

    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let (program, args) = self.command();
        if self.dry_run {
            info!(program, ?args, "dry run, host left untouched");
            return Ok(());
        }
        warn!(program, "taking the host down");
        run_command(program, &args, env.cancel).map(|_| ())
    }

    fn revert(&self, _env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        Err(ExperimentError::NonRecoverable(format!(
            "host {} cannot be undone",
            self.action()
        )))
    }
}
