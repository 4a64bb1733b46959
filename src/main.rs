//! CLI entry point for the laser sequencer.
//!
//! # Usage
//!
//! Preview the grid a configuration produces:
//! ```bash
//! laser_sequencer preview --config config/sequence.toml
//! ```
//!
//! Run a sequence against simulated instruments:
//! ```bash
//! laser_sequencer run --config config/sequence.toml --mock
//! ```
//!
//! Ctrl+C requests an abort; the current row finishes and is logged first.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use laser_sequencer::config::SequenceConfig;
use laser_sequencer::hardware::mock::MockRig;
use laser_sequencer::hardware::Instruments;
use laser_sequencer::sequence::{RunOutcome, SequenceController};
use laser_sequencer::tracing_config::{self, OutputFormat, TracingConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "laser_sequencer")]
#[command(about = "Multi-instrument laser processing sequencer", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty, global = true)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the parameter grid without touching hardware
    Preview {
        /// Sequence configuration file
        #[arg(long, default_value = "config/sequence.toml")]
        config: PathBuf,
    },

    /// Run a sequence
    Run {
        /// Sequence configuration file
        #[arg(long, default_value = "config/sequence.toml")]
        config: PathBuf,

        /// Use simulated instruments
        #[arg(long)]
        mock: bool,
    },

    /// Write a configuration file with every default filled in
    Template {
        /// Output path; stdout when omitted
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// List serial ports
    #[cfg(feature = "instrument_serial")]
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Preview { config } => {
            let config = load(&config, cli.log_format)?;
            let controller = SequenceController::new(config, Instruments::new());
            println!("{}", controller.preview_grid()?);
            Ok(())
        }
        Commands::Run { config, mock } => {
            let config = load(&config, cli.log_format)?;
            run(config, mock).await
        }
        Commands::Template { path } => {
            let template = SequenceConfig::template()?;
            match path {
                Some(path) => {
                    std::fs::write(&path, template)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Template written to {}", path.display());
                }
                None => print!("{}", template),
            }
            Ok(())
        }
        #[cfg(feature = "instrument_serial")]
        Commands::Ports => {
            for port in laser_sequencer::hardware::serial::list_ports()? {
                println!("{}", port);
            }
            Ok(())
        }
    }
}

fn load(path: &Path, format: OutputFormat) -> Result<SequenceConfig> {
    let config = SequenceConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let tracing = TracingConfig::from_sequence_config(&config)?.with_format(format);
    tracing_config::init(tracing)?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

async fn connect(config: &SequenceConfig, mock: bool) -> Result<Instruments> {
    if mock {
        info!("using simulated instruments");
        return Ok(MockRig::new().instruments());
    }
    #[cfg(feature = "instrument_serial")]
    {
        let (instruments, failures) = Instruments::connect_from_config(&config.instruments).await;
        if !failures.is_empty() {
            warn!(
                failed = failures.len(),
                "continuing without some instruments; sequences that need them will not start"
            );
        }
        Ok(instruments)
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = config;
        anyhow::bail!("built without the instrument_serial feature; use --mock")
    }
}

async fn run(config: SequenceConfig, mock: bool) -> Result<()> {
    let instruments = connect(&config, mock).await?;
    let controller = Arc::new(SequenceController::new(config, instruments));

    let mut notices = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            println!("{}", notice);
        }
    });

    let abort = controller.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, aborting after the current row");
            abort.request();
        }
    });

    let summary = controller.start_sequence()?.await??;
    match summary.outcome {
        RunOutcome::Completed => info!(rows = summary.rows_logged, "sequence complete"),
        RunOutcome::Aborted => warn!(rows = summary.rows_logged, "sequence aborted"),
    }
    println!("Run log: {}", summary.log_path.display());
    Ok(())
}
