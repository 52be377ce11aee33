use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chaos_agent_core::{
    format_duration, now_utc, parse_duration, ExperimentError, ExperimentFilter, ExperimentRecord,
    ExperimentRun, ExperimentStatus, ExperimentStore, LaunchMode, RunStatus, Uid,
};
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelReason, Cancellation};
use crate::config::FaultConfig;
use crate::fault::{HandlerEnv, StoreView};
use crate::registry;
use crate::scheduler::{Job, RunVerdict, Scheduler};

fn store_error(err: &anyhow::Error) -> ExperimentError {
    ExperimentError::from_anyhow(err)
}

/// Lifecycle engine: runs experiments, recovers them and answers queries.
///
/// Cloning is cheap; clones share the store and the scheduler.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn ExperimentStore>,
    scheduler: Scheduler,
}

impl Engine {
    #[must_use]
    pub fn new(store: Arc<dyn ExperimentStore>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                scheduler: Scheduler::new(),
            }),
        }
    }

    fn store(&self) -> &dyn ExperimentStore {
        &*self.inner.store
    }

    /// Validates, records and runs an experiment. One-shot experiments are
    /// applied before this returns; recurring ones are handed to the
    /// scheduler and the record is left `Scheduled`.
    ///
    /// # Errors
    /// [`ExperimentError::BadConfig`] when validation fails (nothing is
    /// persisted), otherwise the handler's or store's error. A record that
    /// reached `Running` always ends in a terminal or scheduled state.
    pub fn execute(
        &self,
        mut config: FaultConfig,
        launch_mode: LaunchMode,
    ) -> Result<Uid, ExperimentError> {
        let uid = *config.uid.get_or_insert_with(Uid::new);
        config.validate()?;

        let encoded = config.encode()?;
        let record = ExperimentRecord::created(
            uid,
            config.kind(),
            config.attack.action(),
            launch_mode,
            encoded.clone(),
            now_utc(),
        )
        .with_schedule(config.schedule.cron.trim(), config.schedule.duration.trim());
        record.validate()?;

        let store = self.store();
        store.put(&record).map_err(|err| store_error(&err))?;
        let started = transition(
            store,
            uid,
            ExperimentStatus::Created,
            ExperimentStatus::Running,
            "",
            &encoded,
        )
        .map_err(|err| store_error(&err))?;
        if !started {
            return Err(ExperimentError::BadState(format!(
                "experiment {uid} changed state before it started"
            )));
        }
        info!(%uid, kind = %record.kind, action = %record.action, "experiment started");

        let mut finalizer = StatusFinalizer::new(store, uid, encoded);

        if record.is_recurring() {
            if let Err(err) = self.schedule(uid, config) {
                finalizer.finish(ExperimentStatus::Error, err.to_string());
                return Err(err);
            }
            finalizer.finish(ExperimentStatus::Scheduled, String::new());
            return Ok(uid);
        }

        let cancel = Cancellation::new();
        let view = StoreView(store);
        let env = HandlerEnv {
            uid,
            view: &view,
            cancel: &cancel,
        };
        let applied = config.attack.fault_mut().apply(&env);
        finalizer.capture(&config);
        match applied {
            Ok(()) => {
                finalizer.finish(ExperimentStatus::Success, String::new());
                Ok(uid)
            }
            Err(err) => {
                finalizer.finish(ExperimentStatus::Error, err.to_string());
                Err(err)
            }
        }
    }

    /// Undoes an experiment and marks it `Destroyed`.
    ///
    /// # Errors
    /// [`ExperimentError::NotFound`] for an unknown uid,
    /// [`ExperimentError::BadState`] unless the record is `Success` or
    /// `Scheduled`, [`ExperimentError::NonRecoverable`] for fault families
    /// that cannot be undone, or the handler's error.
    pub fn recover(&self, uid: Uid) -> Result<(), ExperimentError> {
        let mut record = self.get(uid)?;
        if self.inner.scheduler.remove(uid) {
            record = self.get(uid)?;
        }

        if !record.status.is_recoverable() {
            return Err(ExperimentError::BadState(format!(
                "experiment {uid} is {}, only success or scheduled experiments can be recovered",
                record.status
            )));
        }
        if !registry::descriptor(record.kind).is_some_and(|handler| handler.recoverable) {
            return Err(ExperimentError::NonRecoverable(format!(
                "{} experiments cannot be recovered",
                record.kind
            )));
        }

        let config = FaultConfig::decode(&record.recover_command).map_err(|err| {
            ExperimentError::Internal(format!("stored config of {uid} is unreadable: {err}"))
        })?;
        let store = self.store();
        let cancel = Cancellation::new();
        let view = StoreView(store);
        config.attack.fault().revert(&HandlerEnv {
            uid,
            view: &view,
            cancel: &cancel,
        })?;

        let destroyed = transition(
            store,
            uid,
            record.status,
            ExperimentStatus::Destroyed,
            "",
            &record.recover_command,
        )
        .map_err(|err| store_error(&err))?;
        if !destroyed {
            return Err(ExperimentError::BadState(format!(
                "experiment {uid} changed state during recovery"
            )));
        }
        info!(%uid, kind = %record.kind, "experiment recovered");
        Ok(())
    }

    /// # Errors
    /// [`ExperimentError::NotFound`] for an unknown uid.
    pub fn get(&self, uid: Uid) -> Result<ExperimentRecord, ExperimentError> {
        self.store()
            .find_by_uid(uid)
            .map_err(|err| store_error(&err))?
            .ok_or_else(|| ExperimentError::NotFound(uid.to_string()))
    }

    /// # Errors
    /// Returns the store's error.
    pub fn search(&self, filter: &ExperimentFilter) -> Result<Vec<ExperimentRecord>, ExperimentError> {
        self.store()
            .list(&filter.normalized())
            .map_err(|err| store_error(&err))
    }

    /// Run history of a recurring experiment, oldest first.
    ///
    /// # Errors
    /// [`ExperimentError::NotFound`] for an unknown uid.
    pub fn runs(&self, uid: Uid) -> Result<Vec<ExperimentRun>, ExperimentError> {
        self.get(uid)?;
        self.store()
            .list_runs(uid)
            .map_err(|err| store_error(&err))
    }

    #[must_use]
    pub fn has_schedule(&self, uid: Uid) -> bool {
        self.inner.scheduler.contains(uid)
    }

    /// Re-registers every `Scheduled` experiment after a restart and returns
    /// how many were resumed. Recurring records stuck in `Running` by a crash
    /// are put back to `Scheduled` first.
    ///
    /// # Errors
    /// Returns the store's error; a record that fails to resume is logged
    /// and skipped.
    pub fn resume_scheduled(&self) -> Result<usize, ExperimentError> {
        let store = self.store();
        let stranded = store
            .list(&ExperimentFilter::by_status(ExperimentStatus::Running))
            .map_err(|err| store_error(&err))?;
        for record in stranded.iter().filter(|record| record.is_recurring()) {
            if let Err(err) = transition(
                store,
                record.uid,
                ExperimentStatus::Running,
                ExperimentStatus::Scheduled,
                "agent restarted during a run",
                &record.recover_command,
            ) {
                warn!(uid = %record.uid, error = %err, "failed to reset interrupted run");
            }
        }

        let scheduled = store
            .list(&ExperimentFilter::by_status(ExperimentStatus::Scheduled))
            .map_err(|err| store_error(&err))?;
        let mut resumed = 0;
        for record in scheduled {
            if self.has_schedule(record.uid) {
                continue;
            }
            let outcome = FaultConfig::decode(&record.recover_command)
                .and_then(|config| self.schedule(record.uid, config));
            match outcome {
                Ok(()) => resumed += 1,
                Err(err) => warn!(uid = %record.uid, error = %err, "failed to resume experiment"),
            }
        }
        info!(resumed, "scheduled experiments resumed");
        Ok(resumed)
    }

    /// Cancels every scheduled run and stops the scheduler.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }

    fn schedule(&self, uid: Uid, config: FaultConfig) -> Result<(), ExperimentError> {
        let duration = match config.schedule.duration.trim() {
            "" => None,
            raw => Some(parse_duration(raw)?),
        };
        let cron = config.schedule.cron.trim().to_string();
        let store = Arc::clone(&self.inner.store);
        let config = Mutex::new(config);
        let job: Job = Arc::new(move |cancel: &Cancellation| {
            scheduled_run(&*store, uid, &config, duration, cancel)
        });
        self.inner.scheduler.add(uid, &cron, job)
    }
}

/// Compare-and-set status write restricted to the edges of
/// [`ExperimentStatus::can_transition_to`].
fn transition(
    store: &dyn ExperimentStore,
    uid: Uid,
    from: ExperimentStatus,
    to: ExperimentStatus,
    message: &str,
    recover_command: &str,
) -> anyhow::Result<bool> {
    if !from.can_transition_to(to) {
        return Err(anyhow::anyhow!(ExperimentError::Internal(format!(
            "experiment {uid} cannot move from {from} to {to}"
        ))));
    }
    store.transition(uid, from, to, message, recover_command)
}

/// Makes the single terminal status write of an execution, including on
/// early return or panic.
struct StatusFinalizer<'a> {
    store: &'a dyn ExperimentStore,
    uid: Uid,
    recover_command: String,
    outcome: Option<(ExperimentStatus, String)>,
}

impl<'a> StatusFinalizer<'a> {
    fn new(store: &'a dyn ExperimentStore, uid: Uid, recover_command: String) -> Self {
        Self {
            store,
            uid,
            recover_command,
            outcome: None,
        }
    }

    fn capture(&mut self, config: &FaultConfig) {
        match config.encode() {
            Ok(encoded) => self.recover_command = encoded,
            Err(err) => warn!(uid = %self.uid, error = %err, "keeping pre-apply recover data"),
        }
    }

    fn finish(&mut self, status: ExperimentStatus, message: String) {
        self.outcome = Some((status, message));
    }
}

impl Drop for StatusFinalizer<'_> {
    fn drop(&mut self) {
        let (status, message) = self.outcome.take().unwrap_or_else(|| {
            (
                ExperimentStatus::Error,
                "experiment aborted before completion".to_string(),
            )
        });
        match transition(
            self.store,
            self.uid,
            ExperimentStatus::Running,
            status,
            &message,
            &self.recover_command,
        ) {
            Ok(true) => info!(uid = %self.uid, %status, "experiment finished"),
            Ok(false) => warn!(uid = %self.uid, %status, "experiment left running by someone else"),
            Err(err) => error!(uid = %self.uid, %status, error = %err, "failed to record experiment outcome"),
        }
    }
}

fn apply_with(
    store: &dyn ExperimentStore,
    uid: Uid,
    config: &mut FaultConfig,
    cancel: &Cancellation,
) -> Result<(), ExperimentError> {
    let view = StoreView(store);
    config.attack.fault_mut().apply(&HandlerEnv {
        uid,
        view: &view,
        cancel,
    })
}

/// Applies on a worker thread so a run that outlives `limit` can be
/// cancelled with [`CancelReason::DeadlineExceeded`].
fn apply_within(
    store: &dyn ExperimentStore,
    uid: Uid,
    config: &mut FaultConfig,
    limit: Duration,
    cancel: &Cancellation,
) -> Result<(), ExperimentError> {
    thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("chaos-agent-apply".to_string())
            .spawn_scoped(scope, move || {
                let result = apply_with(store, uid, config, cancel);
                let _ = done_tx.send(());
                result
            })
            .map_err(|err| ExperimentError::Internal(format!("failed to start run: {err}")))?;

        let timed_out = matches!(done_rx.recv_timeout(limit), Err(mpsc::RecvTimeoutError::Timeout));
        if timed_out {
            cancel.cancel(CancelReason::DeadlineExceeded);
        }
        let result = worker
            .join()
            .map_err(|_| ExperimentError::Internal("fault handler panicked".to_string()))?;
        if timed_out {
            return Err(ExperimentError::Transient(format!(
                "run did not finish within {}",
                format_duration(limit)
            )));
        }
        result
    })
}

/// Body of every fire of a recurring experiment.
fn scheduled_run(
    store: &dyn ExperimentStore,
    uid: Uid,
    config: &Mutex<FaultConfig>,
    duration: Option<Duration>,
    cancel: &Cancellation,
) -> RunVerdict {
    let record = match store.find_by_uid(uid) {
        Ok(Some(record)) => record,
        Ok(None) => return RunVerdict::Retire,
        Err(err) => {
            warn!(%uid, error = %err, "failed to load scheduled experiment");
            return RunVerdict::Continue;
        }
    };
    match record.status {
        ExperimentStatus::Scheduled => {}
        ExperimentStatus::Created | ExperimentStatus::Running => {
            debug!(%uid, status = %record.status, "experiment busy, skipping fire");
            return RunVerdict::Continue;
        }
        _ => return RunVerdict::Retire,
    }
    match transition(
        store,
        uid,
        ExperimentStatus::Scheduled,
        ExperimentStatus::Running,
        "",
        &record.recover_command,
    ) {
        Ok(true) => {}
        Ok(false) => return RunVerdict::Continue,
        Err(err) => {
            warn!(%uid, error = %err, "failed to start scheduled run");
            return RunVerdict::Continue;
        }
    }

    let run = ExperimentRun {
        run_uid: Uid::new(),
        experiment_uid: uid,
        status: RunStatus::Running,
        message: String::new(),
        started_at: now_utc(),
        finished_at: None,
    };
    if let Err(err) = store.put_run(&run) {
        warn!(%uid, error = %err, "failed to record run start");
    }
    debug!(%uid, run = %run.run_uid, "scheduled run started");

    let mut config = config.lock().unwrap_or_else(PoisonError::into_inner);
    let started = Instant::now();
    let applied = match duration {
        Some(limit) => apply_within(store, uid, &mut config, limit, cancel),
        None => apply_with(store, uid, &mut config, cancel),
    };

    let mut message = String::new();
    match &applied {
        Ok(()) => {
            if let Some(limit) = duration {
                let _ = cancel.wait_timeout(limit.saturating_sub(started.elapsed()));
            }
        }
        Err(err) => message = err.to_string(),
    }

    // A bounded run is ended even when apply failed or overran its window,
    // since a partial apply may have left the fault in place. A recovery
    // that removed this entry performs the revert itself.
    if cancel.reason() != Some(CancelReason::Removed) && duration.is_some() {
        let view = StoreView(store);
        let ended = config.attack.fault().end_run(&HandlerEnv {
            uid,
            view: &view,
            cancel: &Cancellation::new(),
        });
        if let Err(err) = ended {
            message = if message.is_empty() {
                format!("failed to end run: {err}")
            } else {
                format!("{message}; failed to end run: {err}")
            };
        }
    }

    let recover_command = config.encode().unwrap_or(record.recover_command);
    drop(config);

    let verdict = match transition(
        store,
        uid,
        ExperimentStatus::Running,
        ExperimentStatus::Scheduled,
        &message,
        &recover_command,
    ) {
        Ok(true) => RunVerdict::Continue,
        Ok(false) => RunVerdict::Retire,
        Err(err) => {
            warn!(%uid, error = %err, "failed to reschedule experiment");
            RunVerdict::Retire
        }
    };

    let run_status = if message.is_empty() {
        RunStatus::Success
    } else {
        warn!(%uid, run = %run.run_uid, %message, "scheduled run failed");
        RunStatus::Error
    };
    if let Err(err) = store.finish_run(run.run_uid, run_status, &message, now_utc()) {
        warn!(%uid, error = %err, "failed to record run end");
    }
    verdict
}
