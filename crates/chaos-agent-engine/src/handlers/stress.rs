use std::fs;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use chaos_agent_core::ExperimentError;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fault::{Fault, HandlerEnv};

const STARTUP_PROBE: Duration = Duration::from_millis(200);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum StressAction {
    Cpu,
    Mem,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StressAttack {
    pub action: StressAction,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default)]
    pub load: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Leader of the stress-ng process group spawned by the last apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stress_ng_pid: Option<i32>,
}

fn default_workers() -> u32 {
    1
}

impl StressAttack {
    #[must_use]
    pub fn new(action: StressAction) -> Self {
        Self {
            action,
            workers: default_workers(),
            load: 0,
            size: String::new(),
            options: Vec::new(),
            stress_ng_pid: None,
        }
    }

    pub(crate) fn stress_ng_args(&self) -> Vec<String> {
        let mut args = match self.action {
            StressAction::Cpu => vec![
                "--cpu".to_string(),
                self.workers.to_string(),
                "--cpu-load".to_string(),
                self.load.to_string(),
            ],
            StressAction::Mem => {
                let size = if self.size.trim().is_empty() {
                    "256M"
                } else {
                    self.size.trim()
                };
                vec![
                    "--vm".to_string(),
                    self.workers.to_string(),
                    "--vm-bytes".to_string(),
                    size.to_string(),
                    "--vm-keep".to_string(),
                ]
            }
        };
        args.extend(self.options.iter().cloned());
        args
    }
}

impl Fault for StressAttack {
    fn action(&self) -> &'static str {
        match self.action {
            StressAction::Cpu => "cpu",
            StressAction::Mem => "mem",
        }
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        if self.workers == 0 {
            return Err(ExperimentError::BadConfig(
                "workers MUST be at least 1".to_string(),
            ));
        }
        if self.action == StressAction::Cpu && !(1..=100).contains(&self.load) {
            return Err(ExperimentError::BadConfig(format!(
                "load MUST be within [1, 100], got {}",
                self.load
            )));
        }
        Ok(())
    }

    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let mut child = Command::new("stress-ng")
            .args(self.stress_ng_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|err| ExperimentError::Transient(format!("failed to spawn stress-ng: {err}")))?;

        let pid = i32::try_from(child.id())
            .map_err(|_| ExperimentError::Internal(format!("pid {} out of range", child.id())))?;
        self.stress_ng_pid = Some(pid);

        let _ = env.cancel.wait_timeout(STARTUP_PROBE);
        match child.try_wait() {
            Ok(Some(status)) => Err(ExperimentError::Transient(format!(
                "stress-ng exited right after start: {status}"
            ))),
            Ok(None) => {
                info!(pid, action = self.action(), "stress-ng started");
                Ok(())
            }
            Err(err) => Err(ExperimentError::Transient(format!(
                "failed to probe stress-ng: {err}"
            ))),
        }
    }

    fn revert(&self, _env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let Some(pid) = self.stress_ng_pid else {
            return Ok(());
        };
        if !is_stress_ng(pid) {
            warn!(pid, "stress-ng is no longer running");
            return Ok(());
        }

        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => {
                return Err(ExperimentError::Transient(format!(
                    "failed to kill stress-ng group {pid}: {errno}"
                )))
            }
        }
        reap(pid);
        info!(pid, "stress-ng stopped");
        Ok(())
    }
}

fn is_stress_ng(pid: i32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|comm| comm.trim_end().starts_with("stress-ng"))
        .unwrap_or(false)
}

// Only children of this process can be reaped; anything else is left to
// its own parent.
fn reap(pid: i32) {
    let deadline = Instant::now() + REAP_TIMEOUT;
    while Instant::now() < deadline {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(10)),
            Ok(_) | Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_arguments() {
        let mut attack = StressAttack::new(StressAction::Cpu);
        attack.workers = 2;
        attack.load = 10;
        attack.options = vec!["--timeout".to_string(), "60".to_string()];
        assert_eq!(
            attack.stress_ng_args(),
            vec!["--cpu", "2", "--cpu-load", "10", "--timeout", "60"]
        );
    }

    #[test]
    fn mem_defaults_size() {
        let attack = StressAttack::new(StressAction::Mem);
        assert_eq!(
            attack.stress_ng_args(),
            vec!["--vm", "1", "--vm-bytes", "256M", "--vm-keep"]
        );
        assert!(attack.validate().is_ok());
    }

    #[test]
    fn cpu_load_is_bounded() {
        let mut attack = StressAttack::new(StressAction::Cpu);
        assert!(attack.validate().is_err());
        attack.load = 101;
        assert!(attack.validate().is_err());
        attack.load = 100;
        assert!(attack.validate().is_ok());
        attack.workers = 0;
        assert!(attack.validate().is_err());
    }

    #[test]
    fn revert_without_pid_is_a_no_op() {
        let reverted = crate::fault::tests_support::with_env(|env| {
            StressAttack::new(StressAction::Cpu).revert(env)
        });
        assert!(reverted.is_ok());
    }
}
