//! `chaos-agent` command surface.
//!
//! [`run_cli`] executes a parsed [`Cli`]; the binary only adds argument
//! parsing, logging setup and exit-code mapping.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chaos_agent_core::{
    format_rfc3339, parse_signed_duration, ExperimentError, ExperimentFilter, ExperimentKind,
    ExperimentRecord, ExperimentStatus, ExperimentStore, LaunchMode, SortOrder, Uid,
};
use chaos_agent_engine::{parse_clock_ids, Attack, ClockAttack, Engine, FaultConfig};
use chaos_agent_service::{ServeOptions, TlsOptions};
use chaos_agent_store_sqlite::SqliteExperimentStore;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

pub const DEFAULT_DB_FILE: &str = "chaos_agent.sqlite3";

#[derive(Debug, Parser)]
#[command(name = "chaos-agent")]
#[command(about = "Single-node chaos injection agent", version)]
pub struct Cli {
    /// Experiment database; defaults to `chaos_agent.sqlite3` next to the binary.
    #[arg(long, global = true, env = "CHAOS_AGENT_DB")]
    pub db: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error). `CHAOS_AGENT_LOG` wins when set.
    #[arg(long, global = true, env = "CHAOS_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inject a fault.
    Attack {
        #[command(subcommand)]
        command: Box<AttackCommand>,
    },
    /// Undo a fault by experiment uid.
    Recover {
        uid: String,
    },
    /// List experiment records.
    Search(SearchArgs),
    /// Serve the HTTP API.
    Server(ServerArgs),
    /// Print name and version as JSON.
    Version,
    /// Print a shell completion script.
    Completion {
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ScheduleArgs {
    /// Use this uid instead of a generated one.
    #[arg(long)]
    pub uid: Option<String>,
    /// Cron expression (5, 6 or 7 fields); makes the experiment recurring.
    #[arg(long)]
    pub cron: Option<String>,
    /// How long each scheduled run keeps the fault in place, e.g. `30s`.
    #[arg(long)]
    pub duration: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum AttackCommand {
    /// Signal processes by PID or command name (kill, stop).
    Process {
        action: String,
        #[arg(long)]
        process: String,
        #[arg(long)]
        signal: Option<i32>,
        #[arg(long)]
        recover_cmd: Option<String>,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Degrade an interface with netem (delay, loss, corrupt, duplicate).
    Network {
        action: String,
        #[arg(long)]
        device: String,
        #[arg(long)]
        latency: Option<String>,
        #[arg(long)]
        jitter: Option<String>,
        #[arg(long)]
        correlation: Option<String>,
        #[arg(long)]
        percent: Option<String>,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Burn CPU or memory with stress-ng (cpu, mem).
    Stress {
        action: String,
        #[arg(long)]
        workers: Option<u32>,
        #[arg(long)]
        load: Option<u32>,
        #[arg(long)]
        size: Option<String>,
        /// Extra stress-ng option; repeatable.
        #[arg(long = "option", allow_hyphen_values = true)]
        options: Vec<String>,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Fill a disk or burn disk I/O (fill, write-payload, read-payload).
    Disk {
        action: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        size: String,
        #[arg(long)]
        payload_process_num: Option<u32>,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Shut down or reboot the host (shutdown, reboot).
    Host {
        action: String,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Force a full GC in a JVM (gc).
    Jvm {
        action: String,
        #[arg(long)]
        pid: i32,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Skew the clocks a process reads through the vDSO.
    Clock {
        /// Only `skew`.
        action: Option<String>,
        #[arg(long)]
        pid: i32,
        /// Signed offset such as `-10m30s`.
        #[arg(long, allow_hyphen_values = true)]
        time_offset: String,
        /// Comma-separated clock names or ids.
        #[arg(long, default_value = "CLOCK_REALTIME")]
        clock_ids_slice: String,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Change a file and keep a backup (create, modify, delete, rename, append, replace).
    File {
        action: String,
        #[arg(long)]
        file_name: Option<String>,
        #[arg(long)]
        dir_name: Option<String>,
        /// Octal mode for `modify`, e.g. 644.
        #[arg(long)]
        privilege: Option<u32>,
        #[arg(long)]
        dest_name: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        data: Option<String>,
        #[arg(long)]
        count: Option<u32>,
        #[arg(long)]
        line_no: Option<u32>,
        #[arg(long, allow_hyphen_values = true)]
        origin_str: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        dest_str: Option<String>,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Destroy a libvirt domain (destroy).
    Vm {
        action: String,
        #[arg(long)]
        vm_name: String,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Run an arbitrary shell command with an optional undo command.
    #[command(name = "user-defined", alias = "user_defined")]
    UserDefined {
        /// Only `run`.
        action: Option<String>,
        #[arg(long)]
        attack_cmd: String,
        #[arg(long)]
        recover_cmd: Option<String>,
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Eq, PartialEq)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(long)]
    pub uid: Option<String>,
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long)]
    pub kind: Option<String>,
    #[arg(long)]
    pub launch_mode: Option<String>,
    /// Oldest first.
    #[arg(long)]
    pub asc: bool,
    #[arg(long)]
    pub offset: Option<u32>,
    #[arg(long)]
    pub limit: Option<u32>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    #[arg(long, default_value = "0.0.0.0")]
    pub ip: IpAddr,
    #[arg(long, default_value_t = 31767)]
    pub port: u16,
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,
    /// Require client certificates signed by this CA.
    #[arg(long, requires_all = ["cert", "key"])]
    pub ca: Option<PathBuf>,
    #[arg(long, default_value_t = 60_000)]
    pub operation_timeout_ms: u64,
}

/// Executes the parsed command.
///
/// # Errors
/// Returns an error when the database cannot be opened or the command
/// fails; [`ExperimentError`] values stay downcastable for exit-code mapping.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Version => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "name": "chaos-agent",
                    "version": env!("CARGO_PKG_VERSION"),
                }))?
            );
            Ok(())
        }
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "chaos-agent", &mut io::stdout());
            Ok(())
        }
        Command::Attack { command } => {
            let config = attack_config(*command)?;
            let engine = open_engine(cli.db.as_deref())?;
            run_attack(&engine, config)
        }
        Command::Recover { uid } => {
            let uid = Uid::parse(&uid)?;
            let engine = open_engine(cli.db.as_deref())?;
            engine.recover(uid)?;
            println!("Recover {uid} successfully");
            Ok(())
        }
        Command::Search(args) => {
            let output = args.output;
            let filter = search_filter(args)?;
            let engine = open_engine(cli.db.as_deref())?;
            let records = engine.search(&filter)?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                OutputFormat::Table => print!("{}", render_table(&records)?),
            }
            Ok(())
        }
        Command::Server(args) => run_server(cli.db.as_deref(), args),
    }
}

/// Resolves the database path: the flag or env value, else the default file
/// beside the running executable.
///
/// # Errors
/// Fails when the executable path cannot be determined.
pub fn database_path(flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path.to_path_buf());
    }
    let exe = std::env::current_exe().context("failed to locate the chaos-agent executable")?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow!("executable {} has no parent directory", exe.display()))?;
    Ok(dir.join(DEFAULT_DB_FILE))
}

fn open_engine(db: Option<&Path>) -> Result<Engine> {
    let path = database_path(db)?;
    let store: Arc<dyn ExperimentStore> = Arc::new(SqliteExperimentStore::open_and_migrate(&path)?);
    Ok(Engine::new(store))
}

fn run_attack(engine: &Engine, config: FaultConfig) -> Result<()> {
    let kind = config.kind();
    let recurring = !config.schedule.cron.is_empty();
    let uid = engine.execute(config, LaunchMode::Command)?;
    println!("Attack {kind} successfully, uid: {uid}");
    if recurring {
        info!(%uid, "recurring experiment scheduled; press Ctrl-C to stop");
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?
            .block_on(tokio::signal::ctrl_c())
            .context("failed to wait for Ctrl-C")?;
        engine.shutdown();
        info!(%uid, "scheduler stopped; the experiment stays scheduled until recovered");
    }
    Ok(())
}

fn run_server(db: Option<&Path>, args: ServerArgs) -> Result<()> {
    let engine = open_engine(db)?;
    let tls = match (args.cert, args.key) {
        (Some(cert), Some(key)) => Some(TlsOptions {
            cert,
            key,
            ca: args.ca,
        }),
        _ => None,
    };
    let options = ServeOptions {
        addr: SocketAddr::new(args.ip, args.port),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        tls,
    };

    let resumed = engine.resume_scheduled()?;
    info!(resumed, "scheduled experiments restored");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let result = runtime.block_on(chaos_agent_service::serve(
        engine.clone(),
        options,
        async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        },
    ));
    engine.shutdown();
    result
}

fn search_filter(args: SearchArgs) -> Result<ExperimentFilter, ExperimentError> {
    fn parse_with<T>(
        field: &str,
        value: Option<String>,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<T>, ExperimentError> {
        value
            .map(|raw| {
                parse(&raw)
                    .ok_or_else(|| ExperimentError::BadConfig(format!("unknown {field} {raw:?}")))
            })
            .transpose()
    }

    Ok(ExperimentFilter {
        uid: args.uid.as_deref().map(Uid::parse).transpose()?,
        status: parse_with("status", args.status, ExperimentStatus::parse)?,
        kind: parse_with("kind", args.kind, ExperimentKind::parse)?,
        launch_mode: parse_with("launch mode", args.launch_mode, LaunchMode::parse)?,
        order: if args.asc { SortOrder::Asc } else { SortOrder::Desc },
        offset: args.offset,
        limit: args.limit,
    })
}

fn render_table(records: &[ExperimentRecord]) -> Result<String, ExperimentError> {
    let mut out = format!(
        "{:<36}  {:<12}  {:<13}  {:<9}  {:<7}  {:<20}  {}\n",
        "UID", "KIND", "ACTION", "STATUS", "MODE", "CREATED", "MESSAGE"
    );
    for record in records {
        out.push_str(&format!(
            "{:<36}  {:<12}  {:<13}  {:<9}  {:<7}  {:<20}  {}\n",
            record.uid,
            record.kind,
            record.action,
            record.status,
            record.launch_mode.as_str(),
            format_rfc3339(record.created_at)?,
            record.message
        ));
    }
    Ok(out)
}

fn attack_config(command: AttackCommand) -> Result<FaultConfig, ExperimentError> {
    let mut fields = Map::new();
    let (kind, schedule) = match command {
        AttackCommand::Process {
            action,
            process,
            signal,
            recover_cmd,
            schedule,
        } => {
            fields.insert("action".into(), json!(action));
            fields.insert("process".into(), json!(process));
            insert_opt(&mut fields, "signal", signal);
            insert_opt(&mut fields, "recover_cmd", recover_cmd);
            (ExperimentKind::Process, schedule)
        }
        AttackCommand::Network {
            action,
            device,
            latency,
            jitter,
            correlation,
            percent,
            schedule,
        } => {
            fields.insert("action".into(), json!(action));
            fields.insert("device".into(), json!(device));
            insert_opt(&mut fields, "latency", latency);
            insert_opt(&mut fields, "jitter", jitter);
            insert_opt(&mut fields, "correlation", correlation);
            insert_opt(&mut fields, "percent", percent);
            (ExperimentKind::Network, schedule)
        }
        AttackCommand::Stress {
            action,
            workers,
            load,
            size,
            options,
            schedule,
        } => {
            fields.insert("action".into(), json!(action));
            insert_opt(&mut fields, "workers", workers);
            insert_opt(&mut fields, "load", load);
            insert_opt(&mut fields, "size", size);
            fields.insert("options".into(), json!(options));
            (ExperimentKind::Stress, schedule)
        }
        AttackCommand::Disk {
            action,
            path,
            size,
            payload_process_num,
            schedule,
        } => {
            fields.insert("action".into(), json!(action));
            fields.insert("path".into(), json!(path));
            fields.insert("size".into(), json!(size));
            insert_opt(&mut fields, "payload_process_num", payload_process_num);
            (ExperimentKind::Disk, schedule)
        }
        AttackCommand::Host {
            action,
            dry_run,
            schedule,
        } => {
            fields.insert("action".into(), json!(action));
            fields.insert("dry_run".into(), json!(dry_run));
            (ExperimentKind::Host, schedule)
        }
        AttackCommand::Jvm {
            action,
            pid,
            schedule,
        } => {
            fields.insert("action".into(), json!(action));
            fields.insert("pid".into(), json!(pid));
            (ExperimentKind::Jvm, schedule)
        }
        AttackCommand::Clock {
            action,
            pid,
            time_offset,
            clock_ids_slice,
            schedule,
        } => {
            expect_action(action.as_deref(), "skew", ExperimentKind::Clock)?;
            let offset = parse_signed_duration(&time_offset)?;
            let mask = parse_clock_ids(&clock_ids_slice)?;
            let config = FaultConfig::new(Attack::Clock(ClockAttack::new(pid, offset, mask)));
            return with_schedule(config, schedule);
        }
        AttackCommand::File {
            action,
            file_name,
            dir_name,
            privilege,
            dest_name,
            data,
            count,
            line_no,
            origin_str,
            dest_str,
            schedule,
        } => {
            fields.insert("action".into(), json!(action));
            insert_opt(&mut fields, "file_name", file_name);
            insert_opt(&mut fields, "dir_name", dir_name);
            insert_opt(&mut fields, "privilege", privilege);
            insert_opt(&mut fields, "dest_name", dest_name);
            insert_opt(&mut fields, "data", data);
            insert_opt(&mut fields, "count", count);
            insert_opt(&mut fields, "line_no", line_no);
            insert_opt(&mut fields, "origin_str", origin_str);
            insert_opt(&mut fields, "dest_str", dest_str);
            (ExperimentKind::File, schedule)
        }
        AttackCommand::Vm {
            action,
            vm_name,
            schedule,
        } => {
            fields.insert("action".into(), json!(action));
            fields.insert("vm_name".into(), json!(vm_name));
            (ExperimentKind::Vm, schedule)
        }
        AttackCommand::UserDefined {
            action,
            attack_cmd,
            recover_cmd,
            schedule,
        } => {
            expect_action(action.as_deref(), "run", ExperimentKind::UserDefined)?;
            fields.insert("attack_cmd".into(), json!(attack_cmd));
            insert_opt(&mut fields, "recover_cmd", recover_cmd);
            (ExperimentKind::UserDefined, schedule)
        }
    };
    let config = FaultConfig::from_json_value(kind, Value::Object(fields))?;
    with_schedule(config, schedule)
}

fn insert_opt<T: serde::Serialize>(fields: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), json!(value));
    }
}

fn expect_action(
    action: Option<&str>,
    only: &str,
    kind: ExperimentKind,
) -> Result<(), ExperimentError> {
    match action {
        None => Ok(()),
        Some(action) if action == only => Ok(()),
        Some(action) => Err(ExperimentError::BadConfig(format!(
            "{kind} action MUST be {only:?}, got {action:?}"
        ))),
    }
}

fn with_schedule(
    mut config: FaultConfig,
    schedule: ScheduleArgs,
) -> Result<FaultConfig, ExperimentError> {
    if let Some(uid) = schedule.uid {
        config = config.with_uid(Uid::parse(&uid)?);
    }
    config = config.with_schedule(
        schedule.cron.unwrap_or_default(),
        schedule.duration.unwrap_or_default(),
    );
    config.validate()?;
    Ok(config)
}
