mod app;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::runtime::Builder;

use printfleet_core::{targets, LogLevel};

const TOKIO_WORKER_STACK_SIZE_BYTES: usize = 4_200_000;

/// Monitor and drive a fleet of networked 3D printers.
#[derive(Debug, Parser)]
#[command(name = "printfleet", version)]
pub struct Cli {
    /// Fleet file listing the devices and runtime settings.
    #[arg(long, default_value = "fleet.ron")]
    pub config: PathBuf,

    /// error, warn, info, debug or trace. Overrides the fleet file.
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll every device once, store the results and print them.
    Poll,
    /// Poll on the configured interval until Ctrl-C.
    Watch,
    /// Upload a file to a device and start printing it.
    Submit {
        #[arg(long)]
        device: String,
        #[arg(long)]
        file: PathBuf,
        /// Upload only; leave the file on the device without printing.
        #[arg(long)]
        hold: bool,
    },
    /// Cancel the current print on a device.
    Stop {
        #[arg(long)]
        device: String,
    },
    /// Send a console G-code script to a device (Moonraker only).
    Gcode {
        device: String,
        /// Commands separated by newlines, e.g. "G28".
        script: String,
    },
    /// Check that every device answers.
    Check,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let reload_handle = logging::init_logging(cli.log_level.unwrap_or_default());

    tracing::info!(
        target: targets::CLI,
        version = env!("CARGO_PKG_VERSION"),
        "printfleet starting"
    );

    let runtime = match Builder::new_multi_thread()
        .thread_stack_size(TOKIO_WORKER_STACK_SIZE_BYTES)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(target: targets::CLI, error = %error, "Failed to start runtime");
            eprintln!("failed to start async runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(app::run(cli, reload_handle))
}
