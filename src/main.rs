mod bus;
mod codec;
mod error;
mod sim;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use codec::{DecodeArgs, EncodeArgs};
use sim::SimArgs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Parser, Debug)]
#[command(author, version, about = "CANIOT frame tools and bus simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print machine readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Also write the logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Explain a raw frame, e.g. `caniot decode 0x68D 2a42`.
    Decode(DecodeArgs),
    /// Build a raw frame from its fields.
    Encode(EncodeArgs),
    /// Run a controller against simulated devices on an in-memory bus.
    Simulate(SimArgs),
}

/// Console logs go to stderr, leaving stdout to the command output.
fn setup_logging(log_file: Option<&Path>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file, guard) = match log_file {
        Some(path) => {
            let log_file = File::create(path).with_context(|| format!("Cannot create log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(log_file);
            (Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(filter).with(console).with(file).init();
    Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    let result = match &cli.command {
        Command::Decode(args) => codec::decode(args, cli.json),
        Command::Encode(args) => codec::encode(args, cli.json),
        Command::Simulate(args) => sim::run(args, cli.json).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }

    Ok(())
}
