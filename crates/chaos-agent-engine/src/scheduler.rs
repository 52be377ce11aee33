//! In-process cron scheduler for recurring experiments.
//!
//! One ticker thread watches the next fire time of every entry. Each fire
//! runs on its own thread; a fire is skipped while the previous run of the
//! same entry is still going.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chaos_agent_core::{ExperimentError, Uid};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cancel::{CancelReason, Cancellation};

const MAX_IDLE: Duration = Duration::from_secs(30);

/// What a run asks of its entry once it returns.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunVerdict {
    Continue,
    /// Drop the entry; no further fires.
    Retire,
}

pub type Job = Arc<dyn Fn(&Cancellation) -> RunVerdict + Send + Sync>;

/// Parses a cron expression. Classic 5-field expressions get a leading
/// seconds field of `0`; 6- and 7-field forms and `@hourly`-style macros
/// are passed through.
///
/// # Errors
/// Returns [`ExperimentError::BadConfig`] for anything the cron parser
/// rejects.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, ExperimentError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            fields => {
                return Err(ExperimentError::BadConfig(format!(
                    "cron expression MUST have 5 to 7 fields, got {fields}"
                )))
            }
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|err| {
        ExperimentError::BadConfig(format!("invalid cron expression {expression:?}: {err}"))
    })
}

struct InFlight {
    cancel: Cancellation,
    handle: JoinHandle<()>,
}

struct Entry {
    schedule: cron::Schedule,
    next_fire: Option<DateTime<Utc>>,
    job: Job,
    in_flight: Option<InFlight>,
}

#[derive(Default)]
struct State {
    entries: HashMap<Uid, Entry>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct Scheduler {
    shared: Arc<Shared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `job` to run on `cron`.
    ///
    /// # Errors
    /// Returns [`ExperimentError::BadConfig`] for a bad expression,
    /// [`ExperimentError::BadState`] when `uid` is already scheduled or the
    /// scheduler has shut down.
    pub fn add(&self, uid: Uid, cron: &str, job: Job) -> Result<(), ExperimentError> {
        let schedule = parse_cron(cron)?;
        self.ensure_ticker()?;

        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(ExperimentError::BadState("scheduler is shut down".to_string()));
        }
        if state.entries.contains_key(&uid) {
            return Err(ExperimentError::BadState(format!("experiment {uid} is already scheduled")));
        }
        let next_fire = schedule.upcoming(Utc).next();
        info!(%uid, cron, next_fire = ?next_fire, "experiment scheduled");
        state.entries.insert(
            uid,
            Entry {
                schedule,
                next_fire,
                job,
                in_flight: None,
            },
        );
        drop(state);
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Drops the entry, cancels any in-flight run with
    /// [`CancelReason::Removed`] and waits for it to return. Returns whether
    /// an entry existed.
    pub fn remove(&self, uid: Uid) -> bool {
        let entry = self.shared.lock().entries.remove(&uid);
        let Some(entry) = entry else {
            return false;
        };
        self.shared.wake.notify_all();
        if let Some(in_flight) = entry.in_flight {
            in_flight.cancel.cancel(CancelReason::Removed);
            if in_flight.handle.join().is_err() {
                warn!(%uid, "scheduled run panicked");
            }
        }
        info!(%uid, "experiment unscheduled");
        true
    }

    #[must_use]
    pub fn contains(&self, uid: Uid) -> bool {
        self.shared.lock().entries.contains_key(&uid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the ticker and cancels every in-flight run with
    /// [`CancelReason::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        let entries = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            std::mem::take(&mut state.entries)
        };
        self.shared.wake.notify_all();

        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            if ticker.join().is_err() {
                warn!("scheduler ticker panicked");
            }
        }

        for (uid, entry) in entries {
            if let Some(in_flight) = entry.in_flight {
                in_flight.cancel.cancel(CancelReason::Shutdown);
                if in_flight.handle.join().is_err() {
                    warn!(%uid, "scheduled run panicked");
                }
            }
        }
    }

    fn ensure_ticker(&self) -> Result<(), ExperimentError> {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("chaos-agent-scheduler".to_string())
            .spawn(move || run_ticker(&shared))
            .map_err(|err| ExperimentError::Internal(format!("failed to start scheduler: {err}")))?;
        *ticker = Some(handle);
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_ticker(shared: &Arc<Shared>) {
    let mut state = shared.lock();
    while !state.shutdown {
        let now = Utc::now();
        let due: Vec<Uid> = state
            .entries
            .iter_mut()
            .filter(|(_, entry)| entry.next_fire.is_some_and(|next| next <= now))
            .map(|(uid, entry)| {
                entry.next_fire = entry.schedule.after(&now).next();
                *uid
            })
            .collect();
        for uid in due {
            fire(shared, &mut state, uid);
        }

        let wait = state
            .entries
            .values()
            .filter_map(|entry| entry.next_fire)
            .min()
            .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(MAX_IDLE)
            .min(MAX_IDLE);
        state = shared
            .wake
            .wait_timeout(state, wait)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
    debug!("scheduler ticker stopped");
}

fn fire(shared: &Arc<Shared>, state: &mut State, uid: Uid) {
    let Some(entry) = state.entries.get_mut(&uid) else {
        return;
    };
    if let Some(previous) = entry.in_flight.take() {
        if !previous.handle.is_finished() {
            debug!(%uid, "previous run still active, skipping fire");
            entry.in_flight = Some(previous);
            return;
        }
        if previous.handle.join().is_err() {
            warn!(%uid, "scheduled run panicked");
        }
    }

    let cancel = Cancellation::new();
    let job = Arc::clone(&entry.job);
    let run_cancel = cancel.clone();
    let run_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name("chaos-agent-run".to_string())
        .spawn(move || {
            if job(&run_cancel) == RunVerdict::Retire {
                retire(&run_shared, uid, &run_cancel);
            }
        });
    match spawned {
        Ok(handle) => entry.in_flight = Some(InFlight { cancel, handle }),
        Err(err) => warn!(%uid, error = %err, "failed to start scheduled run"),
    }
}

/// Removes the entry only if it still belongs to the run that retired it.
fn retire(shared: &Shared, uid: Uid, token: &Cancellation) {
    let mut state = shared.lock();
    let owned = state
        .entries
        .get(&uid)
        .and_then(|entry| entry.in_flight.as_ref())
        .is_some_and(|in_flight| in_flight.cancel.same_as(token));
    if owned {
        // The handle belongs to this very thread; dropping it detaches.
        state.entries.remove(&uid);
        info!(%uid, "scheduled experiment retired");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    const EVERY_SECOND: &str = "* * * * * *";

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(25));
        }
        done()
    }

    #[test]
    fn cron_forms() {
        must_ok(parse_cron("*/5 * * * *"));
        must_ok(parse_cron("*/1 * * * * *"));
        must_ok(parse_cron("0 0 12 * * * 2030"));
        must_ok(parse_cron("@hourly"));
        assert!(matches!(parse_cron("* * *"), Err(ExperimentError::BadConfig(_))));
        assert!(matches!(parse_cron("61 * * * *"), Err(ExperimentError::BadConfig(_))));
    }

    #[test]
    fn entries_fire_repeatedly() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fires);
        let uid = Uid::new();
        must_ok(scheduler.add(
            uid,
            EVERY_SECOND,
            Arc::new(move |_cancel: &Cancellation| {
                counter.fetch_add(1, Ordering::SeqCst);
                RunVerdict::Continue
            }),
        ));

        assert!(wait_until(Duration::from_secs(5), || fires.load(Ordering::SeqCst) >= 2));
        assert!(scheduler.contains(uid));
        assert!(matches!(
            scheduler.add(uid, EVERY_SECOND, Arc::new(|_: &Cancellation| RunVerdict::Continue)),
            Err(ExperimentError::BadState(_))
        ));
    }

    #[test]
    fn overlapping_fires_are_skipped() {
        let scheduler = Scheduler::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let (job_active, job_peak, job_runs) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&runs));

        must_ok(scheduler.add(
            Uid::new(),
            EVERY_SECOND,
            Arc::new(move |cancel: &Cancellation| {
                let now = job_active.fetch_add(1, Ordering::SeqCst) + 1;
                job_peak.fetch_max(now, Ordering::SeqCst);
                job_runs.fetch_add(1, Ordering::SeqCst);
                let _ = cancel.wait_timeout(Duration::from_millis(2500));
                job_active.fetch_sub(1, Ordering::SeqCst);
                RunVerdict::Continue
            }),
        ));

        thread::sleep(Duration::from_millis(4500));
        scheduler.shutdown();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let total = runs.load(Ordering::SeqCst);
        assert!((1..=2).contains(&total), "ran {total} times");
    }

    #[test]
    fn remove_cancels_in_flight_run() {
        let scheduler = Scheduler::new();
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let uid = Uid::new();
        must_ok(scheduler.add(
            uid,
            EVERY_SECOND,
            Arc::new(move |cancel: &Cancellation| {
                let _ = cancel.wait_timeout(Duration::from_secs(30));
                *record.lock().unwrap_or_else(PoisonError::into_inner) = cancel.reason();
                RunVerdict::Continue
            }),
        ));

        thread::sleep(Duration::from_millis(1500));
        let started = Instant::now();
        assert!(scheduler.remove(uid));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            *seen.lock().unwrap_or_else(PoisonError::into_inner),
            Some(CancelReason::Removed)
        );
        assert!(!scheduler.contains(uid));
        assert!(!scheduler.remove(uid));
    }

    #[test]
    fn retired_entries_disappear() {
        let scheduler = Scheduler::new();
        let uid = Uid::new();
        must_ok(scheduler.add(uid, EVERY_SECOND, Arc::new(|_: &Cancellation| RunVerdict::Retire)));
        assert!(wait_until(Duration::from_secs(5), || !scheduler.contains(uid)));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn shutdown_cancels_runs_and_refuses_new_entries() {
        let scheduler = Scheduler::new();
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        must_ok(scheduler.add(
            Uid::new(),
            EVERY_SECOND,
            Arc::new(move |cancel: &Cancellation| {
                let _ = cancel.wait_timeout(Duration::from_secs(30));
                *record.lock().unwrap_or_else(PoisonError::into_inner) = cancel.reason();
                RunVerdict::Continue
            }),
        ));
        thread::sleep(Duration::from_millis(1500));

        scheduler.shutdown();
        assert_eq!(
            *seen.lock().unwrap_or_else(PoisonError::into_inner),
            Some(CancelReason::Shutdown)
        );
        assert!(matches!(
            scheduler.add(Uid::new(), EVERY_SECOND, Arc::new(|_: &Cancellation| RunVerdict::Continue)),
            Err(ExperimentError::BadState(_))
        ));
        scheduler.shutdown();
    }
}
