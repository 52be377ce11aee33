use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use uuid::Uuid;

mod duration;

pub use duration::{format_duration, parse_duration, parse_signed_duration, SignedDuration};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ExperimentError {
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error("experiment not found: {0}")]
    NotFound(String),
    #[error("bad state: {0}")]
    BadState(String),
    #[error("non-recoverable: {0}")]
    NonRecoverable(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExperimentError {
    /// Stable snake-case name of the error kind, used in wire envelopes.
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::BadConfig(_) => "bad_config",
            Self::NotFound(_) => "not_found",
            Self::BadState(_) => "bad_state",
            Self::NonRecoverable(_) => "non_recoverable",
            Self::Transient(_) => "transient",
            Self::Internal(_) => "internal",
        }
    }

    /// Recovers the typed error from an `anyhow` chain, falling back to
    /// [`ExperimentError::Internal`] with the rendered chain.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<Self>().cloned())
            .unwrap_or_else(|| Self::Internal(format!("{err:#}")))
    }
}

/// Experiment identifier: a random UUID rendered in its hyphenated form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Uid(pub Uuid);

impl Uid {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// # Errors
    /// Returns [`ExperimentError::BadConfig`] when `value` is not a UUID.
    pub fn parse(value: &str) -> Result<Self, ExperimentError> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|err| ExperimentError::BadConfig(format!("uid MUST be a UUID: {err}")))
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uid {
    type Err = ExperimentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentKind {
    Process,
    Network,
    Stress,
    Disk,
    Host,
    Jvm,
    Clock,
    Redis,
    File,
    Vm,
    Kafka,
    Http,
    UserDefined,
    Patroni,
}

impl ExperimentKind {
    pub const ALL: [Self; 14] = [
        Self::Process,
        Self::Network,
        Self::Stress,
        Self::Disk,
        Self::Host,
        Self::Jvm,
        Self::Clock,
        Self::Redis,
        Self::File,
        Self::Vm,
        Self::Kafka,
        Self::Http,
        Self::UserDefined,
        Self::Patroni,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Network => "network",
            Self::Stress => "stress",
            Self::Disk => "disk",
            Self::Host => "host",
            Self::Jvm => "jvm",
            Self::Clock => "clock",
            Self::Redis => "redis",
            Self::File => "file",
            Self::Vm => "vm",
            Self::Kafka => "kafka",
            Self::Http => "http",
            Self::UserDefined => "user_defined",
            Self::Patroni => "patroni",
        }
    }

    /// Accepts the snake-case name and the hyphenated CLI spelling.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "process" => Some(Self::Process),
            "network" => Some(Self::Network),
            "stress" => Some(Self::Stress),
            "disk" => Some(Self::Disk),
            "host" => Some(Self::Host),
            "jvm" => Some(Self::Jvm),
            "clock" => Some(Self::Clock),
            "redis" => Some(Self::Redis),
            "file" => Some(Self::File),
            "vm" => Some(Self::Vm),
            "kafka" => Some(Self::Kafka),
            "http" => Some(Self::Http),
            "user_defined" | "user-defined" => Some(Self::UserDefined),
            "patroni" => Some(Self::Patroni),
            _ => None,
        }
    }
}

impl Display for ExperimentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    Command,
    Server,
}

impl LaunchMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Server => "server",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "command" => Some(Self::Command),
            "server" => Some(Self::Server),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Created,
    Scheduled,
    Running,
    Success,
    Error,
    Destroyed,
    Revoked,
}

impl ExperimentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
            Self::Revoked => "revoked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "scheduled" => Some(Self::Scheduled),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "destroyed" => Some(Self::Destroyed),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    /// Status transition table of the lifecycle engine.
    ///
    /// `Revoked` is only ever written by an external admin path, so no edge
    /// of the engine leads into it.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running | Self::Error)
                | (
                    Self::Running,
                    Self::Success | Self::Error | Self::Scheduled
                )
                | (Self::Success | Self::Scheduled, Self::Destroyed)
                | (Self::Scheduled, Self::Running)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Destroyed | Self::Revoked)
    }

    /// Recovery is only accepted from these states.
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Success | Self::Scheduled)
    }
}

impl Display for ExperimentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentRecord {
    pub uid: Uid,
    pub kind: ExperimentKind,
    pub action: String,
    pub launch_mode: LaunchMode,
    pub status: ExperimentStatus,
    pub message: String,
    pub recover_command: String,
    pub cron: String,
    pub duration: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ExperimentRecord {
    /// Builds a fresh `Created` record; both timestamps are `now`.
    #[must_use]
    pub fn created(
        uid: Uid,
        kind: ExperimentKind,
        action: impl Into<String>,
        launch_mode: LaunchMode,
        recover_command: impl Into<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            uid,
            kind,
            action: action.into(),
            launch_mode,
            status: ExperimentStatus::Created,
            message: String::new(),
            recover_command: recover_command.into(),
            cron: String::new(),
            duration: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_schedule(mut self, cron: impl Into<String>, duration: impl Into<String>) -> Self {
        self.cron = cron.into();
        self.duration = duration.into();
        self
    }

    #[must_use]
    pub fn is_recurring(&self) -> bool {
        !self.cron.trim().is_empty()
    }

    /// # Errors
    /// Returns [`ExperimentError::BadConfig`] when the record cannot be
    /// persisted as-is.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.action.trim().is_empty() {
            return Err(ExperimentError::BadConfig(
                "action MUST be non-empty".to_string(),
            ));
        }
        if self.recover_command.is_empty() {
            return Err(ExperimentError::BadConfig(
                "recover_command MUST be non-empty".to_string(),
            ));
        }
        if self.updated_at < self.created_at {
            return Err(ExperimentError::BadConfig(
                "updated_at MUST NOT precede created_at".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One fire of a recurring experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentRun {
    pub run_uid: Uid,
    pub experiment_uid: Uid,
    pub status: RunStatus,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentFilter {
    pub uid: Option<Uid>,
    pub status: Option<ExperimentStatus>,
    pub kind: Option<ExperimentKind>,
    pub launch_mode: Option<LaunchMode>,
    pub order: SortOrder,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

impl ExperimentFilter {
    #[must_use]
    pub fn by_uid(uid: Uid) -> Self {
        Self {
            uid: Some(uid),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_status(status: ExperimentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// A uid filter wins over every other criterion.
    #[must_use]
    pub fn normalized(&self) -> Self {
        match self.uid {
            Some(uid) => Self::by_uid(uid),
            None => self.clone(),
        }
    }
}

/// Durable experiment storage.
///
/// Implementations serialize writes so that concurrent callers observe a
/// total order per uid. Domain failures are raised as [`ExperimentError`]
/// inside the returned `anyhow::Error`.
pub trait ExperimentStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> anyhow::Result<()>;

    /// Inserts a new record; fails with [`ExperimentError::BadConfig`] when
    /// the uid already exists.
    #[allow(clippy::missing_errors_doc)]
    fn put(&self, record: &ExperimentRecord) -> anyhow::Result<()>;

    /// Overwrites status, message and recover data of one record.
    #[allow(clippy::missing_errors_doc)]
    fn update_status(
        &self,
        uid: Uid,
        status: ExperimentStatus,
        message: &str,
        recover_command: &str,
    ) -> anyhow::Result<()>;

    /// Compare-and-set variant of [`ExperimentStore::update_status`]; returns
    /// `false` when the record is not currently in `from`.
    #[allow(clippy::missing_errors_doc)]
    fn transition(
        &self,
        uid: Uid,
        from: ExperimentStatus,
        to: ExperimentStatus,
        message: &str,
        recover_command: &str,
    ) -> anyhow::Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn find_by_uid(&self, uid: Uid) -> anyhow::Result<Option<ExperimentRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list(&self, filter: &ExperimentFilter) -> anyhow::Result<Vec<ExperimentRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn put_run(&self, run: &ExperimentRun) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn finish_run(
        &self,
        run_uid: Uid,
        status: RunStatus,
        message: &str,
        finished_at: OffsetDateTime,
    ) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self, experiment_uid: Uid) -> anyhow::Result<Vec<ExperimentRun>>;
}

/// Parses an RFC3339 timestamp and requires UTC.
///
/// # Errors
/// Returns [`ExperimentError::BadConfig`] for malformed or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ExperimentError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ExperimentError::BadConfig(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ExperimentError::BadConfig(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ExperimentError::Internal`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ExperimentError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ExperimentError::Internal(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(value) => value,
            None => panic!("expected Some"),
        }
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use ExperimentStatus::{Created, Destroyed, Error, Revoked, Running, Scheduled, Success};

        let allowed = [
            (Created, Running),
            (Created, Error),
            (Running, Success),
            (Running, Error),
            (Running, Scheduled),
            (Success, Destroyed),
            (Scheduled, Running),
            (Scheduled, Destroyed),
        ];
        let all = [Created, Scheduled, Running, Success, Error, Destroyed, Revoked];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for status in [
            ExperimentStatus::Error,
            ExperimentStatus::Destroyed,
            ExperimentStatus::Revoked,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_recoverable());
        }
        assert!(ExperimentStatus::Success.is_recoverable());
        assert!(ExperimentStatus::Scheduled.is_recoverable());
        assert!(!ExperimentStatus::Running.is_recoverable());
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in ExperimentKind::ALL {
            assert_eq!(ExperimentKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(
            ExperimentKind::parse("user-defined"),
            Some(ExperimentKind::UserDefined)
        );
        assert_eq!(ExperimentKind::parse("dns"), None);
    }

    #[test]
    fn uid_parse_rejects_garbage() {
        let uid = Uid::new();
        assert_eq!(must_ok(Uid::parse(&uid.to_string())), uid);
        assert!(matches!(
            Uid::parse("not-a-uid"),
            Err(ExperimentError::BadConfig(_))
        ));
    }

    #[test]
    fn filter_uid_takes_precedence() {
        let uid = Uid::new();
        let filter = ExperimentFilter {
            uid: Some(uid),
            status: Some(ExperimentStatus::Success),
            kind: Some(ExperimentKind::Disk),
            limit: Some(3),
            ..ExperimentFilter::default()
        };
        assert_eq!(filter.normalized(), ExperimentFilter::by_uid(uid));
    }

    #[test]
    fn record_validation_requires_recover_data() {
        let now = now_utc();
        let record = ExperimentRecord::created(
            Uid::new(),
            ExperimentKind::File,
            "append",
            LaunchMode::Command,
            "",
            now,
        );
        assert!(matches!(
            record.validate(),
            Err(ExperimentError::BadConfig(message)) if message.contains("recover_command")
        ));
    }

    #[test]
    fn anyhow_chain_keeps_typed_error() {
        let err = anyhow::Error::new(ExperimentError::NotFound("abc".to_string()))
            .context("failed to update experiment");
        assert_eq!(
            ExperimentError::from_anyhow(&err),
            ExperimentError::NotFound("abc".to_string())
        );

        let plain = anyhow::anyhow!("disk I/O error");
        assert!(matches!(
            ExperimentError::from_anyhow(&plain),
            ExperimentError::Internal(message) if message.contains("disk I/O")
        ));
    }

    #[test]
    fn rfc3339_requires_utc() {
        let parsed = must_ok(parse_rfc3339_utc("2026-01-02T03:04:05Z"));
        assert_eq!(
            must_ok(format_rfc3339(parsed)),
            "2026-01-02T03:04:05Z".to_string()
        );
        assert!(parse_rfc3339_utc("2026-01-02T03:04:05+02:00").is_err());
    }

    #[test]
    fn status_parse_matches_serde_names() {
        let json = must_ok(serde_json::to_string(&ExperimentStatus::Scheduled));
        assert_eq!(json, "\"scheduled\"");
        assert_eq!(
            must_some(ExperimentStatus::parse("scheduled")),
            ExperimentStatus::Scheduled
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn record_json_round_trip(
            action in "[a-z][a-z-]{0,12}",
            message in ".{0,40}",
            cron in prop_oneof![Just(String::new()), Just("*/1 * * * *".to_string())],
            kind_index in 0usize..ExperimentKind::ALL.len(),
        ) {
            let now = now_utc();
            let mut record = ExperimentRecord::created(
                Uid::new(),
                ExperimentKind::ALL[kind_index],
                action,
                LaunchMode::Server,
                "{}",
                now,
            )
            .with_schedule(cron, "");
            record.message = message;

            let encoded = must_ok(serde_json::to_string(&record));
            let decoded: ExperimentRecord = must_ok(serde_json::from_str(&encoded));
            prop_assert_eq!(decoded, record);
        }
    }
}
