#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use chaos_agent_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ExperimentError, ExperimentFilter,
    ExperimentKind, ExperimentRecord, ExperimentRun, ExperimentStatus, ExperimentStore,
    LaunchMode, RunStatus, SortOrder, Uid,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;

const SCHEMA_EXPERIMENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS experiments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uid TEXT NOT NULL UNIQUE,
  kind TEXT NOT NULL CHECK (
    kind IN (
      'process',
      'network',
      'stress',
      'disk',
      'host',
      'jvm',
      'clock',
      'redis',
      'file',
      'vm',
      'kafka',
      'http',
      'user_defined',
      'patroni'
    )
  ),
  action TEXT NOT NULL,
  launch_mode TEXT NOT NULL CHECK (launch_mode IN ('command', 'server')),
  status TEXT NOT NULL CHECK (
    status IN ('created', 'scheduled', 'running', 'success', 'error', 'destroyed', 'revoked')
  ),
  message TEXT NOT NULL DEFAULT '',
  recover_command TEXT NOT NULL,
  cron TEXT NOT NULL DEFAULT '',
  duration TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status, id);
CREATE INDEX IF NOT EXISTS idx_experiments_kind ON experiments(kind, id);
CREATE INDEX IF NOT EXISTS idx_experiments_launch_mode ON experiments(launch_mode, id);
";

const SCHEMA_EXPERIMENT_RUNS_V2: &str = r"
CREATE TABLE IF NOT EXISTS experiment_runs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_uid TEXT NOT NULL UNIQUE,
  experiment_uid TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('running', 'success', 'error')),
  message TEXT NOT NULL DEFAULT '',
  started_at TEXT NOT NULL,
  finished_at TEXT,
  FOREIGN KEY (experiment_uid) REFERENCES experiments(uid)
);

CREATE INDEX IF NOT EXISTS idx_experiment_runs_experiment ON experiment_runs(experiment_uid, id);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, SCHEMA_EXPERIMENTS_V1), (2, SCHEMA_EXPERIMENT_RUNS_V2)];

const RECORD_COLUMNS: &str = "uid, kind, action, launch_mode, status, message, recover_command, cron, duration, created_at, updated_at";

pub struct SqliteExperimentStore {
    conn: Mutex<Connection>,
}

impl SqliteExperimentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens the database and applies pending migrations.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn applied_migrations(&self) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version ASC")
            .context("failed to prepare migration query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("failed to query schema_migrations")?;
        collect_rows(rows)
    }
}

impl ExperimentStore for SqliteExperimentStore {
    fn migrate(&self) -> Result<()> {
        let mut conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        for (version, schema) in MIGRATIONS {
            let applied: Option<i64> = conn
                .query_row(
                    "SELECT version FROM schema_migrations WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read schema_migrations")?;
            if applied.is_some() {
                continue;
            }

            let tx = conn
                .transaction()
                .context("failed to start migration transaction")?;
            tx.execute_batch(schema)
                .with_context(|| format!("failed to apply schema migration v{version}"))?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![version, timestamp(now_utc())?],
            )
            .context("failed to register schema migration")?;
            tx.commit()
                .with_context(|| format!("failed to commit schema migration v{version}"))?;
            debug!(version, "applied schema migration");
        }

        Ok(())
    }

    fn put(&self, record: &ExperimentRecord) -> Result<()> {
        record
            .validate()
            .map_err(|err| anyhow!(err).context("refusing to store invalid experiment"))?;

        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO experiments(uid, kind, action, launch_mode, status, message, recover_command, cron, duration, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.uid.to_string(),
                record.kind.as_str(),
                record.action,
                record.launch_mode.as_str(),
                record.status.as_str(),
                record.message,
                record.recover_command,
                record.cron,
                record.duration,
                timestamp(record.created_at)?,
                timestamp(record.updated_at)?,
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(anyhow!(ExperimentError::BadConfig(
                format!("experiment {} already exists", record.uid)
            ))),
            Err(err) => Err(anyhow!(err).context("failed to insert experiment")),
        }
    }

    fn update_status(
        &self,
        uid: Uid,
        status: ExperimentStatus,
        message: &str,
        recover_command: &str,
    ) -> Result<()> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE experiments
                 SET status = ?2, message = ?3, recover_command = ?4, updated_at = ?5
                 WHERE uid = ?1",
                params![
                    uid.to_string(),
                    status.as_str(),
                    message,
                    recover_command,
                    timestamp(now_utc())?
                ],
            )
            .context("failed to update experiment status")?;

        if changed == 0 {
            return Err(anyhow!(ExperimentError::NotFound(uid.to_string())));
        }
        Ok(())
    }

    fn transition(
        &self,
        uid: Uid,
        from: ExperimentStatus,
        to: ExperimentStatus,
        message: &str,
        recover_command: &str,
    ) -> Result<bool> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE experiments
                 SET status = ?3, message = ?4, recover_command = ?5, updated_at = ?6
                 WHERE uid = ?1 AND status = ?2",
                params![
                    uid.to_string(),
                    from.as_str(),
                    to.as_str(),
                    message,
                    recover_command,
                    timestamp(now_utc())?
                ],
            )
            .context("failed to transition experiment status")?;
        Ok(changed == 1)
    }

    fn find_by_uid(&self, uid: Uid) -> Result<Option<ExperimentRecord>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM experiments WHERE uid = ?1"),
            params![uid.to_string()],
            parse_record_row,
        )
        .optional()
        .context("failed to query experiment by uid")
    }

    fn list(&self, filter: &ExperimentFilter) -> Result<Vec<ExperimentRecord>> {
        let filter = filter.normalized();
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(uid) = filter.uid {
            values.push(uid.to_string());
            clauses.push(format!("uid = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(kind) = filter.kind {
            values.push(kind.as_str().to_string());
            clauses.push(format!("kind = ?{}", values.len()));
        }
        if let Some(launch_mode) = filter.launch_mode {
            values.push(launch_mode.as_str().to_string());
            clauses.push(format!("launch_mode = ?{}", values.len()));
        }

        let mut query = format!("SELECT {RECORD_COLUMNS} FROM experiments");
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(match filter.order {
            SortOrder::Asc => " ORDER BY id ASC",
            SortOrder::Desc => " ORDER BY id DESC",
        });
        match (filter.limit, filter.offset) {
            (Some(limit), Some(offset)) => {
                query.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
            }
            (Some(limit), None) => query.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => query.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        let conn = self.conn();
        let mut stmt = conn
            .prepare(&query)
            .context("failed to prepare experiment listing")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), parse_record_row)
            .context("failed to list experiments")?;
        collect_rows(rows)
    }

    fn put_run(&self, run: &ExperimentRun) -> Result<()> {
        let finished_at = run.finished_at.map(timestamp).transpose()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO experiment_runs(run_uid, experiment_uid, status, message, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.run_uid.to_string(),
                run.experiment_uid.to_string(),
                run.status.as_str(),
                run.message,
                timestamp(run.started_at)?,
                finished_at,
            ],
        )
        .with_context(|| format!("failed to insert run for experiment {}", run.experiment_uid))?;
        Ok(())
    }

    fn finish_run(
        &self,
        run_uid: Uid,
        status: RunStatus,
        message: &str,
        finished_at: OffsetDateTime,
    ) -> Result<()> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE experiment_runs SET status = ?2, message = ?3, finished_at = ?4 WHERE run_uid = ?1",
                params![
                    run_uid.to_string(),
                    status.as_str(),
                    message,
                    timestamp(finished_at)?
                ],
            )
            .context("failed to finish experiment run")?;
        if changed == 0 {
            return Err(anyhow!(ExperimentError::NotFound(format!("run {run_uid}"))));
        }
        Ok(())
    }

    fn list_runs(&self, experiment_uid: Uid) -> Result<Vec<ExperimentRun>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT run_uid, experiment_uid, status, message, started_at, finished_at
                 FROM experiment_runs WHERE experiment_uid = ?1 ORDER BY id ASC",
            )
            .context("failed to prepare run listing")?;
        let rows = stmt
            .query_map(params![experiment_uid.to_string()], parse_run_row)
            .context("failed to list experiment runs")?;
        collect_rows(rows)
    }
}

fn timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn invalid_column(index: usize, column: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {column}: {raw}"),
        )),
    )
}

fn parse_uid_column(row: &rusqlite::Row<'_>, index: usize, column: &str) -> rusqlite::Result<Uid> {
    let raw: String = row.get(index)?;
    Uid::parse(&raw).map_err(|_| invalid_column(index, column, &raw))
}

fn parse_time_column(
    row: &rusqlite::Row<'_>,
    index: usize,
    column: &str,
) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|_| invalid_column(index, column, &raw))
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentRecord> {
    let uid = parse_uid_column(row, 0, "uid")?;

    let kind_raw: String = row.get(1)?;
    let kind = ExperimentKind::parse(&kind_raw).ok_or_else(|| invalid_column(1, "kind", &kind_raw))?;

    let launch_mode_raw: String = row.get(3)?;
    let launch_mode = LaunchMode::parse(&launch_mode_raw)
        .ok_or_else(|| invalid_column(3, "launch_mode", &launch_mode_raw))?;

    let status_raw: String = row.get(4)?;
    let status = ExperimentStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(4, "status", &status_raw))?;

    Ok(ExperimentRecord {
        uid,
        kind,
        action: row.get(2)?,
        launch_mode,
        status,
        message: row.get(5)?,
        recover_command: row.get(6)?,
        cron: row.get(7)?,
        duration: row.get(8)?,
        created_at: parse_time_column(row, 9, "created_at")?,
        updated_at: parse_time_column(row, 10, "updated_at")?,
    })
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentRun> {
    let status_raw: String = row.get(2)?;
    let status =
        RunStatus::parse(&status_raw).ok_or_else(|| invalid_column(2, "run status", &status_raw))?;

    let finished_raw: Option<String> = row.get(5)?;
    let finished_at = finished_raw
        .as_deref()
        .map(|raw| parse_rfc3339_utc(raw).map_err(|_| invalid_column(5, "finished_at", raw)))
        .transpose()?;

    Ok(ExperimentRun {
        run_uid: parse_uid_column(row, 0, "run_uid")?,
        experiment_uid: parse_uid_column(row, 1, "experiment_uid")?,
        status,
        message: row.get(3)?,
        started_at: parse_time_column(row, 4, "started_at")?,
        finished_at,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
