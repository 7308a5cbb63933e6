//! CLI entry point for arena_protocol
//!
//! # Usage
//!
//! Run an experiment:
//! ```bash
//! arena_protocol run protocols/demo.yaml --output ./experiments
//! ```
//!
//! Check a protocol without touching hardware:
//! ```bash
//! arena_protocol validate protocols/demo.yaml
//! ```
//!
//! Preview the trial order for a seed:
//! ```bash
//! arena_protocol order protocols/demo.yaml --seed 42
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use arena_protocol::config::EngineConfig;
use arena_protocol::logging::{self, OutputFormat, TracingConfig};
use arena_protocol::orchestrator::{ExperimentOrchestrator, OrchestratorState};
use arena_protocol::protocol::Protocol;
use arena_protocol::trial_order::{generate_trial_order, TrialOrder};

#[derive(Parser)]
#[command(name = "arena_protocol")]
#[command(about = "Protocol-driven LED arena experiment runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an experiment protocol
    Run {
        /// Protocol file (.yaml, .yml or .json)
        protocol: PathBuf,

        /// Arena controller address (`mock` or host:port)
        #[arg(long)]
        arena: Option<String>,

        /// Root directory for experiment output
        #[arg(long)]
        output: Option<PathBuf>,

        /// Engine configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Debug-level logging with run and phase timings
        #[arg(short, long)]
        verbose: bool,

        /// Validate and initialize only
        #[arg(long)]
        dry_run: bool,

        /// Use in-memory serial links instead of real ports
        #[arg(long)]
        mock_serial: bool,

        /// Console log format
        #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
        log_format: OutputFormat,
    },

    /// Validate a protocol and print a short summary
    Validate {
        /// Protocol file
        protocol: PathBuf,
    },

    /// Print the trial order a protocol would produce, as JSON
    Order {
        /// Protocol file
        protocol: PathBuf,

        /// Seed overriding the protocol's randomization seed
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            protocol,
            arena,
            output,
            config,
            verbose,
            dry_run,
            mock_serial,
            log_format,
        } => {
            let mut engine = match &config {
                Some(path) => EngineConfig::load_from(path),
                None => EngineConfig::load(),
            }
            .context("Failed to load engine configuration")?;

            if let Some(address) = arena {
                engine.arena.address = address;
            }
            if let Some(dir) = output {
                engine.output_dir = dir;
            }
            if verbose {
                engine.log_level = "debug".to_string();
            }
            engine.dry_run |= dry_run;
            engine.plugins.mock_serial |= mock_serial;
            engine.validate().map_err(anyhow::Error::msg)?;

            let tracing_config = TracingConfig::from_engine_config(&engine)
                .map_err(anyhow::Error::msg)?
                .with_format(log_format)
                .with_phase_timings(verbose);
            logging::init(tracing_config).map_err(anyhow::Error::msg)?;

            run_protocol(protocol, engine).await
        }
        Commands::Validate { protocol } => {
            logging::init(TracingConfig::default()).map_err(anyhow::Error::msg)?;
            validate_protocol(protocol)
        }
        Commands::Order { protocol, seed } => print_order(protocol, seed),
    }
}

async fn run_protocol(path: PathBuf, config: EngineConfig) -> Result<()> {
    let mut orchestrator = ExperimentOrchestrator::new(&path, config)
        .with_context(|| format!("Cannot run {}", path.display()))?;

    tracing::info!(
        protocol = %path.display(),
        experiment_dir = %orchestrator.experiment_dir().display(),
        "Starting experiment"
    );

    let outcome = orchestrator.run().await?;
    match outcome.state {
        OrchestratorState::DryRunDone => {
            println!("Dry run complete: protocol valid, hardware and plugins initialized");
        }
        _ => {
            println!(
                "Experiment complete: {} trials, {} posttrial failures",
                outcome.trials_completed, outcome.posttrial_failures
            );
        }
    }
    println!("Output: {}", outcome.experiment_dir.display());
    Ok(())
}

fn validate_protocol(path: PathBuf) -> Result<()> {
    let protocol = Protocol::load(&path)?;
    let info = &protocol.experiment_info;

    println!("{} is valid", path.display());
    println!("  Experiment:  {}", info.name);
    println!(
        "  Arena:       {} ({} x {})",
        protocol.arena.generation, protocol.arena.num_rows, protocol.arena.num_cols
    );
    println!("  Conditions:  {}", protocol.condition_ids().join(", "));
    println!("  Repetitions: {}", protocol.structure.repetitions);
    println!("  Trials:      {}", protocol.total_trials());
    let plugins: Vec<String> = protocol
        .plugins
        .iter()
        .map(|p| format!("{} ({})", p.name, p.plugin_type()))
        .collect();
    if !plugins.is_empty() {
        println!("  Plugins:     {}", plugins.join(", "));
    }
    Ok(())
}

fn print_order(path: PathBuf, seed: Option<u64>) -> Result<()> {
    let protocol = Protocol::load(&path)?;
    let conditions = protocol.condition_ids();
    let repetitions = protocol.structure.repetitions;
    let randomization = &protocol.structure.randomization;

    let order = match seed {
        Some(seed) if randomization.enabled => TrialOrder {
            seed: Some(seed),
            method: randomization.method.to_string(),
            trials: generate_trial_order(&conditions, repetitions, randomization, Some(seed)),
        },
        _ => TrialOrder::generate(&conditions, repetitions, randomization),
    };

    println!("{}", serde_json::to_string_pretty(&order)?);
    Ok(())
}
