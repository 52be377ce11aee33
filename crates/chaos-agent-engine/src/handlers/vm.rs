use chaos_agent_core::ExperimentError;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fault::{run_command, Fault, HandlerEnv};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum VmAction {
    Destroy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VmAttack {
    pub action: VmAction,
    pub vm_name: String,
}

impl Fault for VmAttack {
    fn action(&self) -> &'static str {
        match self.action {
            VmAction::Destroy => "destroy",
        }
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        if self.vm_name.trim().is_empty() {
            return Err(ExperimentError::BadConfig(
                "vm_name MUST be set".to_string(),
            ));
        }
        Ok(())
    }

    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        run_command(
            "virsh",
            &["destroy".to_string(), self.vm_name.clone()],
            env.cancel,
        )?;
        info!(vm = %self.vm_name, "destroyed virtual machine");
        Ok(())
    }

    fn revert(&self, _env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        Err(ExperimentError::NonRecoverable(format!(
            "virtual machine {} was destroyed and cannot be restored",
            self.vm_name
        )))
    }
}
