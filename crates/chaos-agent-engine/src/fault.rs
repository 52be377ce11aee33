use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chaos_agent_core::{
    ExperimentError, ExperimentFilter, ExperimentRecord, ExperimentStore, Uid,
};
use tracing::debug;

use crate::cancel::Cancellation;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Read-only window onto the experiment history, handed to handlers that
/// need to look at sibling experiments.
pub trait ExperimentView: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn experiments(&self, filter: &ExperimentFilter)
        -> Result<Vec<ExperimentRecord>, ExperimentError>;
}

pub struct StoreView<'a>(pub &'a dyn ExperimentStore);

impl ExperimentView for StoreView<'_> {
    fn experiments(
        &self,
        filter: &ExperimentFilter,
    ) -> Result<Vec<ExperimentRecord>, ExperimentError> {
        self.0
            .list(filter)
            .map_err(|err| ExperimentError::from_anyhow(&err))
    }
}

pub struct HandlerEnv<'a> {
    pub uid: Uid,
    pub view: &'a dyn ExperimentView,
    pub cancel: &'a Cancellation,
}

/// Contract every fault family implements.
///
/// `apply` may stash recovery data in `self`; the engine serializes the
/// config after every call. `revert` must work from that serialized form
/// alone, in a different process if need be.
pub trait Fault {
    fn action(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn validate(&self) -> Result<(), ExperimentError>;

    #[allow(clippy::missing_errors_doc)]
    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError>;

    #[allow(clippy::missing_errors_doc)]
    fn revert(&self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError>;

    /// Called by the scheduler when a bounded run ends.
    #[allow(clippy::missing_errors_doc)]
    fn end_run(&self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        self.revert(env)
    }
}

/// Output of a finished child process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program` to completion, killing it if `cancel` fires first.
///
/// A non-zero exit is reported as [`ExperimentError::Transient`] carrying
/// the child's stderr.
pub fn run_command(
    program: &str,
    args: &[String],
    cancel: &Cancellation,
) -> Result<CommandOutput, ExperimentError> {
    debug!(program, ?args, "spawning command");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| ExperimentError::Transient(format!("failed to spawn {program}: {err}")))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                return Err(ExperimentError::Transient(format!(
                    "failed to wait for {program}: {err}"
                )))
            }
        }
        if cancel.wait_timeout(CHILD_POLL_INTERVAL) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExperimentError::Transient(format!("{program} was cancelled")));
        }
    };

    let output = CommandOutput {
        stdout: stdout.map(join_drain).unwrap_or_default(),
        stderr: stderr.map(join_drain).unwrap_or_default(),
    };

    if status.success() {
        Ok(output)
    } else {
        Err(ExperimentError::Transient(format!(
            "{program} exited with {status}: {}",
            output.stderr.trim()
        )))
    }
}

/// Runs a shell snippet through `sh -c`.
pub fn run_shell(script: &str, cancel: &Cancellation) -> Result<CommandOutput, ExperimentError> {
    run_command("sh", &["-c".to_string(), script.to_string()], cancel)
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        let _ = tx.send(String::from_utf8_lossy(&buffer).into_owned());
    });
    rx
}

// A backgrounded grandchild can keep the pipe open long after the child
// exits, so the drain is only awaited briefly.
fn join_drain(rx: mpsc::Receiver<String>) -> String {
    rx.recv_timeout(DRAIN_GRACE).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A view with no sibling experiments.
    pub(crate) struct EmptyView;

    impl ExperimentView for EmptyView {
        fn experiments(
            &self,
            _filter: &ExperimentFilter,
        ) -> Result<Vec<ExperimentRecord>, ExperimentError> {
            Ok(Vec::new())
        }
    }

    /// Runs `body` with an environment backed by [`EmptyView`].
    pub(crate) fn with_env<T>(body: impl FnOnce(&HandlerEnv<'_>) -> T) -> T {
        let cancel = Cancellation::new();
        let env = HandlerEnv {
            uid: Uid::new(),
            view: &EmptyView,
            cancel: &cancel,
        };
        body(&env)
    }
}
