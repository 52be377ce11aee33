use std::fs;
use std::path::Path;

use chaos_agent_core::ExperimentError;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fault::{run_shell, Fault, HandlerEnv};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessAction {
    Kill,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProcessAttack {
    pub action: ProcessAction,
    /// A PID or a command name.
    pub process: String,
    #[serde(default = "default_signal")]
    pub signal: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recover_cmd: String,
    /// PIDs signalled by the last apply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pids: Vec<i32>,
}

fn default_signal() -> i32 {
    Signal::SIGKILL as i32
}

impl ProcessAttack {
    #[must_use]
    pub fn new(action: ProcessAction, process: impl Into<String>) -> Self {
        Self {
            action,
            process: process.into(),
            signal: default_signal(),
            recover_cmd: String::new(),
            pids: Vec::new(),
        }
    }

    fn apply_signal(&self) -> Result<Signal, ExperimentError> {
        match self.action {
            ProcessAction::Stop => Ok(Signal::SIGSTOP),
            ProcessAction::Kill => Signal::try_from(self.signal).map_err(|_| {
                ExperimentError::BadConfig(format!("signal {} is not a valid signal", self.signal))
            }),
        }
    }
}

impl Fault for ProcessAttack {
    fn action(&self) -> &'static str {
        match self.action {
            ProcessAction::Kill => "kill",
            ProcessAction::Stop => "stop",
        }
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        let process = self.process.trim();
        if process.is_empty() {
            return Err(ExperimentError::BadConfig(
                "process MUST name a PID or a command".to_string(),
            ));
        }
        if let Ok(pid) = process.parse::<i64>() {
            if pid <= 0 || pid > i64::from(i32::MAX) {
                return Err(ExperimentError::BadConfig(format!(
                    "process PID MUST be positive, got {pid}"
                )));
            }
        }
        self.apply_signal().map(|_| ())
    }

    fn apply(&mut self, _env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let signal = self.apply_signal()?;
        let targets = resolve_targets(self.process.trim())?;
        if targets.is_empty() {
            return Err(ExperimentError::Transient(format!(
                "no process matches {:?}",
                self.process
            )));
        }
        self.pids.clone_from(&targets);

        for pid in targets {
            kill(Pid::from_raw(pid), signal).map_err(|errno| {
                ExperimentError::Transient(format!("failed to send {signal} to {pid}: {errno}"))
            })?;
            info!(pid, %signal, "signalled process");
        }
        Ok(())
    }

    fn revert(&self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        match self.action {
            ProcessAction::Stop => {
                for &pid in &self.pids {
                    match kill(Pid::from_raw(pid), Signal::SIGCONT) {
                        Ok(()) => info!(pid, "resumed process"),
                        Err(Errno::ESRCH) => warn!(pid, "process is gone, nothing to resume"),
                        Err(errno) => {
                            return Err(ExperimentError::Transient(format!(
                                "failed to resume {pid}: {errno}"
                            )))
                        }
                    }
                }
                Ok(())
            }
            ProcessAction::Kill if self.recover_cmd.trim().is_empty() => Ok(()),
            ProcessAction::Kill => run_shell(&self.recover_cmd, env.cancel).map(|_| ()),
        }
    }
}

fn resolve_targets(process: &str) -> Result<Vec<i32>, ExperimentError> {
    if let Ok(pid) = process.parse::<i32>() {
        return Ok(match kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => vec![pid],
            Err(_) => Vec::new(),
        });
    }
    find_pids_by_name(Path::new("/proc"), process)
}

/// Scans a procfs root for processes whose `comm` or first argv entry
/// matches `name`. The calling process is never returned.
pub(crate) fn find_pids_by_name(proc_root: &Path, name: &str) -> Result<Vec<i32>, ExperimentError> {
    let own = i32::try_from(std::process::id()).unwrap_or(0);
    let entries = fs::read_dir(proc_root).map_err(|err| {
        ExperimentError::Transient(format!("failed to list {}: {err}", proc_root.display()))
    })?;

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|raw| raw.parse::<i32>().ok()) else {
            continue;
        };
        if pid == own {
            continue;
        }
        let comm = fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
        let cmdline = fs::read(entry.path().join("cmdline")).unwrap_or_default();
        let argv0 = cmdline
            .split(|byte| *byte == 0)
            .next()
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default();
        let argv0_base = Path::new(&argv0)
            .file_name()
            .and_then(|base| base.to_str())
            .unwrap_or_default();

        if comm.trim_end() == name || argv0_base == name {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn validate_rejects_bad_targets_and_signals() {
        assert!(ProcessAttack::new(ProcessAction::Stop, " ").validate().is_err());
        assert!(ProcessAttack::new(ProcessAction::Stop, "-4").validate().is_err());
        let mut attack = ProcessAttack::new(ProcessAction::Kill, "nginx");
        attack.signal = 4242;
        assert!(attack.validate().is_err());
        attack.signal = 15;
        assert!(attack.validate().is_ok());
    }

    #[test]
    fn name_scan_matches_comm_and_argv0() {
        let root = must_ok(tempfile::tempdir());
        for (pid, comm, argv0) in [
            ("101", "redis-server\n", "/usr/bin/redis-server"),
            ("102", "bash\n", "/usr/local/bin/worker"),
            ("103", "bash\n", "bash"),
        ] {
            let dir = root.path().join(pid);
            must_ok(fs::create_dir(&dir));
            must_ok(fs::write(dir.join("comm"), comm));
            must_ok(fs::write(dir.join("cmdline"), format!("{argv0}\0--flag\0")));
        }
        must_ok(fs::create_dir(root.path().join("self")));

        assert_eq!(must_ok(find_pids_by_name(root.path(), "redis-server")), vec![101]);
        assert_eq!(must_ok(find_pids_by_name(root.path(), "worker")), vec![102]);
        assert_eq!(must_ok(find_pids_by_name(root.path(), "bash")), vec![102, 103]);
        assert!(must_ok(find_pids_by_name(root.path(), "postgres")).is_empty());
    }

    #[test]
    fn recover_data_round_trips_pids() {
        let mut attack = ProcessAttack::new(ProcessAction::Stop, "1234");
        attack.pids = vec![1234];
        let encoded = must_ok(serde_json::to_string(&attack));
        let decoded: ProcessAttack = must_ok(serde_json::from_str(&encoded));
        assert_eq!(decoded, attack);
    }
}
