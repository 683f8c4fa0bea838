pub mod delivery;
pub mod error;
mod macos_bridge;
pub mod reader;
pub mod scan;
pub mod settings;
pub mod shutdown;
pub mod supervisor;
mod utils;
pub mod worker;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use delivery::{PlatformDelivery, PrintDelivery};
use reader::{PcscAccess, ReaderAccess};
use scan::PayloadFormat;
use settings::Settings;
use supervisor::{ProcessLauncher, Supervisor, SupervisorConfig};
use utils::logging::{self, ProcessRole};
use worker::{ScanOutcome, ScanWorker};

#[derive(Debug, Parser)]
#[command(name = "tapfill", version, about = "Types URLs stored on NFC tags into the focused app")]
pub struct Cli {
    /// JSON settings file; missing keys use built-in defaults.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Supervise the scan worker until interrupted (default).
    Run,
    /// Scan loop run inside the supervised child process.
    #[command(hide = true)]
    Worker {
        /// Exit when stdin closes.
        #[arg(long)]
        watch_parent: bool,
    },
    /// Perform a single scan attempt and report the result.
    ScanOnce {
        /// Print the payload instead of pasting it.
        #[arg(long)]
        no_deliver: bool,
    },
    /// List the readers PC/SC can see.
    Readers,
}

impl Command {
    fn role(&self) -> ProcessRole {
        match self {
            Command::Run => ProcessRole::Supervisor,
            Command::Worker { .. } => ProcessRole::Worker,
            Command::ScanOnce { .. } | Command::Readers => ProcessRole::Cli,
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Command::Run);
    logging::init(command.role());

    let settings = Settings::load(cli.config.as_deref())?;

    match command {
        Command::Run => run_supervisor(cli.config, &settings),
        Command::Worker { watch_parent } => worker::run_worker_process(&settings, watch_parent),
        Command::ScanOnce { no_deliver } => scan_once(&settings, no_deliver),
        Command::Readers => list_readers(),
    }
}

fn run_supervisor(config: Option<PathBuf>, settings: &Settings) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async {
        println!("NFC scanner active. Tap a card to read...");
        let cancel = shutdown::install_interrupt_handler();
        let launcher = ProcessLauncher::current_exe(config.as_deref())?;
        let mut supervisor = Supervisor::new(launcher, SupervisorConfig::from(settings));

        let stats = supervisor.supervise_forever(cancel).await;
        info!(
            "shutdown after {} worker runs ({} timed out, {} failed launches, {} failed kills)",
            stats.launched, stats.timed_out, stats.failed_launches, stats.kill_failures
        );
        println!("\nStopping NFC scanner...");
        Ok(())
    })
}

fn scan_once(settings: &Settings, no_deliver: bool) -> Result<()> {
    let format = PayloadFormat {
        scheme: settings.url_scheme.clone(),
        artifact_prefix: settings.artifact_prefix.clone(),
    };
    let outcome = if no_deliver {
        ScanWorker::new(PcscAccess::new(), PrintDelivery, format, settings.poll_interval())
            .scan_once()
    } else {
        ScanWorker::new(
            PcscAccess::new(),
            PlatformDelivery::new(settings),
            format,
            settings.poll_interval(),
        )
        .scan_once()
    };

    match outcome {
        ScanOutcome::Delivered(_) => Ok(()),
        ScanOutcome::NoReader => anyhow::bail!("no NFC reader found"),
        ScanOutcome::Empty => anyhow::bail!("no valid data on the tag"),
        ScanOutcome::Skipped(err) | ScanOutcome::Failed(err) => {
            Err(err).context("scan attempt failed")
        }
    }
}

fn list_readers() -> Result<()> {
    let readers = PcscAccess::new()
        .list_readers()
        .context("failed to enumerate readers")?;
    if readers.is_empty() {
        println!("No NFC reader found.");
    }
    for (index, reader) in readers.iter().enumerate() {
        println!("{index}: {reader}");
    }
    Ok(())
}
