//! # Arena Protocol Engine
//!
//! Runs LED-arena behavioural experiments described by a declarative protocol
//! document (YAML or JSON). A protocol names the arena hardware, the conditions
//! to present, how often and in which order to present them, and any auxiliary
//! devices (plugins) taking part in the run.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: the protocol model, document loading and validation.
//! - **`trial_order`**: expands conditions x repetitions into a reproducible
//!   trial sequence.
//! - **`hardware`**: the `ArenaController` trait with a simulated and a TCP
//!   implementation.
//! - **`plugin`**: the `Plugin` contract, the three plugin kinds (serial device,
//!   class, script) and the `PluginRegistry` that owns them.
//! - **`dispatch`**: routes one protocol command to the controller, a wait or
//!   a plugin.
//! - **`orchestrator`**: the run state machine, experiment directory and
//!   guaranteed cleanup.
//! - **`run_log`**: the per-run `experiment.log`.
//! - **`config`** / **`logging`**: Figment configuration and `tracing` setup.
//! - **`error`**: `ExperimentError`, `CommandError` and `PluginError`.
//!
//! ## Example
//!
//! ```no_run
//! use arena_protocol::config::EngineConfig;
//! use arena_protocol::orchestrator::ExperimentOrchestrator;
//!
//! # async fn run() -> arena_protocol::error::AppResult<()> {
//! let config = EngineConfig::load()?;
//! let mut orchestrator = ExperimentOrchestrator::new("protocols/demo.yaml", config)?;
//! let outcome = orchestrator.run().await?;
//! println!("{} trials written to {}", outcome.trials_completed, outcome.experiment_dir.display());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod orchestrator;
pub mod plugin;
pub mod protocol;
pub mod run_log;
pub mod trial_order;

pub use dispatch::CommandDispatcher;
pub use error::{AppResult, CommandError, ExperimentError, PluginError};
pub use orchestrator::{CleanupReport, ExperimentOrchestrator, OrchestratorState, RunOutcome};
pub use protocol::Protocol;
pub use trial_order::{generate_trial_order, TrialOrder, TrialRecord};
