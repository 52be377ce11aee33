use std::process::ExitCode;

use chaos_agent_cli::{run_cli, Cli};
use chaos_agent_core::ExperimentError;
use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_BAD_ARGS: u8 = 128;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_BAD_ARGS),
            };
        }
    };

    let filter = std::env::var("CHAOS_AGENT_LOG")
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_new(&cli.log_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            match ExperimentError::from_anyhow(&err) {
                ExperimentError::BadConfig(_) => ExitCode::from(EXIT_BAD_ARGS),
                _ => ExitCode::from(EXIT_FAILURE),
            }
        }
    }
}
