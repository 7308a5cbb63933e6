//! Experiment orchestrator
//!
//! Top-level state machine for one experiment run:
//!
//! ```text
//! Constructed ──> ProtocolValidated ──run()──> Initialized ──dry run──> DryRunDone ──┐
//!                                                   │                                 │
//!                                                   ▼                                 │
//!                    PretrialRunning ──> TrialLoopRunning ──> PosttrialRunning       │
//!                                                                   │                 │
//!                                                                   ▼                 ▼
//!                                                               Finalized ──────> Cleaned
//! ```
//!
//! Any failure jumps straight to `Cleaned`. Cleanup always visits the arena
//! controller, every plugin and the run log, and runs at most once.
//!
//! Failure policy by phase: pretrial, trial and intertrial command failures
//! abort the run; posttrial failures are logged and the remaining posttrial
//! commands still execute.

use chrono::{DateTime, Local};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::{AppResult, ExperimentError};
use crate::hardware::{controller_from_config, ArenaController};
use crate::plugin::registry::PluginInit;
use crate::plugin::{ClassCatalog, PluginRegistry, PluginStatus, RegistryOptions};
use crate::protocol::{Command, PluginKind, Protocol};
use crate::run_log::{ExperimentLogger, LogLevel};
use crate::trial_order::TrialOrder;

pub const LOG_FILE: &str = "experiment.log";
pub const TRIAL_ORDER_FILE: &str = "trial_order.json";
pub const SUMMARY_FILE: &str = "summary.txt";

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Constructed,
    ProtocolValidated,
    Initialized,
    DryRunDone,
    PretrialRunning,
    TrialLoopRunning,
    PosttrialRunning,
    Finalized,
    Cleaned,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorState::Constructed => "Constructed",
            OrchestratorState::ProtocolValidated => "ProtocolValidated",
            OrchestratorState::Initialized => "Initialized",
            OrchestratorState::DryRunDone => "DryRunDone",
            OrchestratorState::PretrialRunning => "PretrialRunning",
            OrchestratorState::TrialLoopRunning => "TrialLoopRunning",
            OrchestratorState::PosttrialRunning => "PosttrialRunning",
            OrchestratorState::Finalized => "Finalized",
            OrchestratorState::Cleaned => "Cleaned",
        };
        f.write_str(s)
    }
}

impl OrchestratorState {
    /// Whether `run()` may be called
    pub fn can_run(&self) -> bool {
        matches!(self, OrchestratorState::ProtocolValidated)
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// `Finalized` or `DryRunDone`
    pub state: OrchestratorState,
    pub experiment_dir: PathBuf,
    pub trials_completed: usize,
    pub posttrial_failures: usize,
    pub seed: Option<u64>,
}

/// Failures collected while releasing resources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_error(self) -> Option<ExperimentError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(ExperimentError::CleanupFailed(self.errors))
        }
    }
}

pub struct ExperimentOrchestrator {
    config: EngineConfig,
    protocol: Protocol,
    state: OrchestratorState,
    experiment_dir: PathBuf,
    controller: Arc<dyn ArenaController>,
    catalog: ClassCatalog,
    logger: Arc<ExperimentLogger>,
    registry: Option<Arc<Mutex<PluginRegistry>>>,
    dispatcher: Option<CommandDispatcher>,
    trial_order: Option<TrialOrder>,
    trials_completed: usize,
    posttrial_failures: usize,
    controller_open: bool,
    cleanup_runs: usize,
    started_at: DateTime<Local>,
}

impl ExperimentOrchestrator {
    /// Load and validate `protocol_path`, and check the host environment.
    ///
    /// No hardware or plugin is touched.
    pub fn new(protocol_path: impl AsRef<Path>, config: EngineConfig) -> AppResult<Self> {
        let protocol = Protocol::load(protocol_path)?;
        Self::from_protocol(protocol, config)
    }

    /// Use an already validated protocol.
    pub fn from_protocol(protocol: Protocol, config: EngineConfig) -> AppResult<Self> {
        let started_at = Local::now();
        validate_environment(&config, &protocol)?;

        let experiment_dir = experiment_dir_for(
            &config.output_dir,
            &protocol.experiment_info.name,
            &started_at,
        );
        let min_level = run_log_level(&config.log_level);
        let controller = controller_from_config(&config);

        tracing::info!(
            experiment = %protocol.experiment_info.name,
            conditions = protocol.conditions.len(),
            repetitions = protocol.structure.repetitions,
            "Protocol validated"
        );

        Ok(Self {
            config,
            protocol,
            state: OrchestratorState::ProtocolValidated,
            experiment_dir,
            controller,
            catalog: ClassCatalog::new(),
            logger: Arc::new(ExperimentLogger::detached(min_level)),
            registry: None,
            dispatcher: None,
            trial_order: None,
            trials_completed: 0,
            posttrial_failures: 0,
            controller_open: false,
            cleanup_runs: 0,
            started_at,
        })
    }

    /// Replace the controller selected from the configuration
    pub fn with_controller(mut self, controller: Arc<dyn ArenaController>) -> Self {
        self.controller = controller;
        self
    }

    /// Native classes available to `class` plugins
    pub fn with_class_catalog(mut self, catalog: ClassCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn experiment_dir(&self) -> &Path {
        &self.experiment_dir
    }

    pub fn trial_order(&self) -> Option<&TrialOrder> {
        self.trial_order.as_ref()
    }

    /// How many times cleanup actually released resources (0 or 1)
    pub fn cleanup_runs(&self) -> usize {
        self.cleanup_runs
    }

    /// Plugin statuses, empty before `run()`
    pub async fn plugin_statuses(&self) -> Vec<PluginStatus> {
        match &self.registry {
            Some(registry) => registry.lock().await.statuses(),
            None => Vec::new(),
        }
    }

    /// Execute the experiment.
    ///
    /// Cleanup has always run when this returns, whether it succeeded or not.
    #[tracing::instrument(skip(self), fields(experiment = %self.protocol.experiment_info.name))]
    pub async fn run(&mut self) -> AppResult<RunOutcome> {
        if !self.state.can_run() {
            return Err(ExperimentError::InvalidState(format!(
                "run() requires state ProtocolValidated, current state is {}",
                self.state
            )));
        }

        let result = self.execute_run().await;
        let reached = self.state;

        if let Err(e) = &result {
            self.logger
                .error(format!("Experiment aborted in state {}: {}", reached, e));
        }

        let report = self.cleanup().await;
        if !report.is_clean() {
            tracing::warn!(errors = ?report.errors, "Cleanup finished with errors");
        }

        result.map(|()| RunOutcome {
            state: reached,
            experiment_dir: self.experiment_dir.clone(),
            trials_completed: self.trials_completed,
            posttrial_failures: self.posttrial_failures,
            seed: self.trial_order.as_ref().and_then(|o| o.seed),
        })
    }

    async fn execute_run(&mut self) -> AppResult<()> {
        self.prepare_artifacts()?;
        self.initialize_plugins().await?;
        self.initialize_controller().await?;

        let registry = self
            .registry
            .clone()
            .ok_or_else(|| ExperimentError::InvalidState("plugin registry missing".into()))?;
        self.dispatcher = Some(CommandDispatcher::new(
            Arc::clone(&self.controller),
            registry,
            Arc::clone(&self.logger),
        ));
        self.state = OrchestratorState::Initialized;
        self.logger.info("Initialization complete");

        if self.config.dry_run {
            self.logger
                .info("Dry run: validation and initialization succeeded, no commands issued");
            self.state = OrchestratorState::DryRunDone;
            return Ok(());
        }

        let order = TrialOrder::generate(
            &self.protocol.condition_ids(),
            self.protocol.structure.repetitions,
            &self.protocol.structure.randomization,
        );
        match order.seed {
            Some(seed) => self.logger.info(format!(
                "Trial order generated: {} trials, method {}, seed {}",
                order.len(),
                order.method,
                seed
            )),
            None => self
                .logger
                .info(format!("Trial order generated: {} trials, sequential", order.len())),
        }
        order.save_json(&self.experiment_dir.join(TRIAL_ORDER_FILE))?;
        self.trial_order = Some(order);

        self.state = OrchestratorState::PretrialRunning;
        let pretrial = self.protocol.pretrial.clone();
        self.run_phase("pretrial", &pretrial, true).await?;

        self.state = OrchestratorState::TrialLoopRunning;
        self.run_trials().await?;

        self.state = OrchestratorState::PosttrialRunning;
        let posttrial = self.protocol.posttrial.clone();
        self.run_phase("posttrial", &posttrial, false).await?;

        self.write_summary()?;
        self.state = OrchestratorState::Finalized;
        self.logger.info(format!(
            "Experiment finished: {} trials completed, {} posttrial failures",
            self.trials_completed, self.posttrial_failures
        ));
        Ok(())
    }

    /// Create the experiment directory, open the run log and copy the protocol.
    fn prepare_artifacts(&mut self) -> AppResult<()> {
        std::fs::create_dir_all(&self.experiment_dir).map_err(|e| {
            ExperimentError::Environment(format!(
                "cannot create experiment directory {}: {}",
                self.experiment_dir.display(),
                e
            ))
        })?;

        let min_level = run_log_level(&self.config.log_level);
        let logger = ExperimentLogger::open(self.experiment_dir.join(LOG_FILE), min_level)?;
        self.logger = Arc::new(logger);

        let info = &self.protocol.experiment_info;
        self.logger.info(format!("Experiment '{}' started", info.name));
        if let Some(author) = &info.author {
            self.logger.info(format!("Author: {}", author));
        }
        self.logger.info(format!(
            "Arena: {} ({} x {} panels) via {}",
            self.protocol.arena.generation,
            self.protocol.arena.num_rows,
            self.protocol.arena.num_cols,
            self.controller.describe()
        ));

        if let Some(source) = &self.protocol.source_path {
            let ext = source
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("yaml");
            let target = self.experiment_dir.join(format!("protocol.{}", ext));
            std::fs::copy(source, &target)?;
            self.logger
                .debug(format!("Protocol copied to {}", target.display()));
        }
        Ok(())
    }

    async fn initialize_plugins(&mut self) -> AppResult<()> {
        // Stored before initializing so cleanup also reaches a partially built registry
        let shared = Arc::new(Mutex::new(PluginRegistry::new(
            Arc::clone(&self.logger),
            self.catalog.clone(),
            RegistryOptions::from_config(&self.config),
        )));
        self.registry = Some(Arc::clone(&shared));

        for def in &self.protocol.plugins {
            let mut guard = shared.lock().await;
            match guard.initialize_plugin(def).await {
                Ok(PluginInit::Ready) => {}
                Ok(PluginInit::Unavailable(reason)) => {
                    tracing::warn!(plugin = %def.name, %reason, "Continuing without plugin");
                }
                Err(e) => {
                    return Err(ExperimentError::initialization(
                        format!("plugin '{}'", def.name),
                        e.to_string(),
                    ))
                }
            }
        }
        self.logger
            .info(format!("{} plugin(s) initialized", self.protocol.plugins.len()));
        Ok(())
    }

    async fn initialize_controller(&mut self) -> AppResult<()> {
        let generation = self.protocol.arena.generation;
        self.controller.open(generation).await.map_err(|e| {
            ExperimentError::initialization(
                format!("arena controller ({})", self.controller.describe()),
                format!("{:#}", e),
            )
        })?;
        self.controller_open = true;
        self.logger.info(format!(
            "Arena controller ready: {} {}",
            generation,
            self.controller.describe()
        ));
        Ok(())
    }

    fn dispatcher(&self) -> AppResult<&CommandDispatcher> {
        self.dispatcher
            .as_ref()
            .ok_or_else(|| ExperimentError::InvalidState("dispatcher not initialized".into()))
    }

    /// Execute `commands` in order. With `fatal` the first failure aborts.
    #[tracing::instrument(skip(self, commands), fields(count = commands.len()))]
    async fn run_phase(&mut self, phase: &str, commands: &[Command], fatal: bool) -> AppResult<()> {
        if commands.is_empty() {
            return Ok(());
        }
        self.logger
            .info(format!("{} phase started ({} commands)", phase, commands.len()));

        for (i, command) in commands.iter().enumerate() {
            let index = i + 1;
            let result = self.dispatcher()?.execute(command).await;
            if let Err(source) = result {
                let err = ExperimentError::Command {
                    phase: phase.to_string(),
                    index,
                    source,
                };
                if fatal {
                    self.logger.error(err.to_string());
                    return Err(err);
                }
                self.posttrial_failures += 1;
                self.logger.warning(format!("{} (continuing)", err));
            }
        }

        self.logger.info(format!("{} phase completed", phase));
        Ok(())
    }

    async fn run_trials(&mut self) -> AppResult<()> {
        let trials = self
            .trial_order
            .as_ref()
            .map(|o| o.trials.clone())
            .unwrap_or_default();
        let intertrial = self.protocol.intertrial.clone();
        let total = trials.len();

        for (i, trial) in trials.iter().enumerate() {
            let condition = self
                .protocol
                .condition(&trial.condition_id)
                .cloned()
                .ok_or_else(|| {
                    ExperimentError::InvalidState(format!(
                        "trial {} references unknown condition '{}'",
                        trial.trial_number, trial.condition_id
                    ))
                })?;

            self.logger.info(format!(
                "Trial {}/{}: condition {} (repetition {})",
                trial.trial_number, total, condition.id, trial.repetition
            ));
            let phase = format!("trial {} ({})", trial.trial_number, condition.id);
            self.run_phase(&phase, &condition.commands, true).await?;
            self.trials_completed += 1;

            if i + 1 < total && !intertrial.is_empty() {
                self.run_phase("intertrial", &intertrial, true).await?;
            }
        }
        Ok(())
    }

    fn write_summary(&self) -> AppResult<()> {
        let path = self.experiment_dir.join(SUMMARY_FILE);
        std::fs::write(&path, self.summary(Local::now()))?;
        self.logger.debug(format!("Summary written to {}", path.display()));
        Ok(())
    }

    /// Human-readable run summary.
    pub fn summary(&self, ended_at: DateTime<Local>) -> String {
        let p = &self.protocol;
        let info = &p.experiment_info;
        let randomization = &p.structure.randomization;
        let elapsed = (ended_at - self.started_at).num_milliseconds() as f64 / 1000.0;

        let mut lines = vec![
            format!("Experiment: {}", info.name),
            format!("Author: {}", info.author.as_deref().unwrap_or("-")),
            format!("Date: {}", info.date.as_deref().unwrap_or("-")),
            format!(
                "Arena: {} ({} rows x {} cols)",
                p.arena.generation, p.arena.num_rows, p.arena.num_cols
            ),
            format!("Conditions: {}", p.conditions.len()),
            format!("Repetitions: {}", p.structure.repetitions),
        ];
        let seed = self.trial_order.as_ref().and_then(|o| o.seed);
        lines.push(if randomization.enabled {
            format!(
                "Randomization: {} (seed {})",
                randomization.method,
                seed.map_or_else(|| "-".to_string(), |s| s.to_string())
            )
        } else {
            "Randomization: disabled".to_string()
        });
        lines.extend([
            format!("Total trials: {}", p.total_trials()),
            format!("Trials completed: {}", self.trials_completed),
            format!("Posttrial failures: {}", self.posttrial_failures),
            format!("Started: {}", self.started_at.format("%Y-%m-%d %H:%M:%S")),
            format!("Ended: {}", ended_at.format("%Y-%m-%d %H:%M:%S")),
            format!("Elapsed: {:.1} s", elapsed),
        ]);
        lines.join("\n") + "\n"
    }

    /// Release the controller, all plugins and the run log.
    ///
    /// Every step runs even if an earlier one fails. Calling this again after
    /// it has run returns an empty report.
    pub async fn cleanup(&mut self) -> CleanupReport {
        if self.state == OrchestratorState::Cleaned {
            return CleanupReport::default();
        }
        self.cleanup_runs += 1;
        let mut report = CleanupReport::default();

        if self.controller_open {
            match self.controller.close().await {
                Ok(()) => self.logger.debug("Arena controller closed"),
                Err(e) => {
                    let message = format!("arena controller: {:#}", e);
                    self.logger.error(format!("Cleanup failed for {}", message));
                    report.errors.push(message);
                }
            }
            self.controller_open = false;
        }

        if let Some(registry) = &self.registry {
            report.errors.extend(registry.lock().await.close_all().await);
        }

        self.dispatcher = None;
        self.logger.log(
            if report.is_clean() {
                LogLevel::Info
            } else {
                LogLevel::Warning
            },
            format!("Cleanup complete ({} error(s))", report.errors.len()),
        );
        if let Err(e) = self.logger.close() {
            report.errors.push(format!("run log: {}", e));
        }

        self.state = OrchestratorState::Cleaned;
        report
    }
}

impl fmt::Debug for ExperimentOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentOrchestrator")
            .field("experiment", &self.protocol.experiment_info.name)
            .field("state", &self.state)
            .field("experiment_dir", &self.experiment_dir)
            .finish()
    }
}

/// Check that the run can take place on this host.
pub fn validate_environment(config: &EngineConfig, protocol: &Protocol) -> AppResult<()> {
    std::fs::create_dir_all(&config.output_dir).map_err(|e| {
        ExperimentError::Environment(format!(
            "output directory {} is not writable: {}",
            config.output_dir.display(),
            e
        ))
    })?;

    if config.arena.address.trim().is_empty() {
        return Err(ExperimentError::Environment(
            "arena address must not be empty".into(),
        ));
    }

    // Non-critical plugins may be missing; the registry degrades them instead
    for def in protocol.plugins.iter().filter(|d| d.critical) {
        let script = match &def.kind {
            PluginKind::Script(spec) => Some(spec.script_path.clone()),
            PluginKind::Class(spec) if spec.class_name.ends_with(".rhai") => {
                Some(PathBuf::from(&spec.class_name))
            }
            _ => None,
        };
        if let Some(path) = script {
            if !path.is_file() {
                return Err(ExperimentError::Environment(format!(
                    "plugin '{}' script not found: {}",
                    def.name,
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("Invalid name regex"));

/// File-system-safe form of an experiment name.
pub fn sanitize_name(name: &str) -> String {
    let cleaned = UNSAFE_NAME_CHARS.replace_all(name.trim(), "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "experiment".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `<output_dir>/<name>_<YYYYMMDD_HHMMSS>`, suffixed if that directory already exists.
fn experiment_dir_for(output_dir: &Path, name: &str, at: &DateTime<Local>) -> PathBuf {
    let base = format!("{}_{}", sanitize_name(name), at.format("%Y%m%d_%H%M%S"));
    let mut dir = output_dir.join(&base);
    let mut n = 2;
    while dir.exists() {
        dir = output_dir.join(format!("{}_{}", base, n));
        n += 1;
    }
    dir
}

fn run_log_level(level: &str) -> LogLevel {
    match level.to_lowercase().as_str() {
        "trace" | "debug" => LogLevel::Debug,
        other => other.parse().unwrap_or(LogLevel::Info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_experiment_names() {
        assert_eq!(sanitize_name("Optomotor / Gain 2"), "Optomotor_Gain_2");
        assert_eq!(sanitize_name("  "), "experiment");
        assert_eq!(sanitize_name("looming-v2"), "looming-v2");
    }

    #[test]
    fn experiment_dirs_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let at = Local::now();
        let first = experiment_dir_for(root.path(), "exp", &at);
        std::fs::create_dir_all(&first).unwrap();
        let second = experiment_dir_for(root.path(), "exp", &at);
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_2"));
    }

    #[test]
    fn run_log_level_follows_engine_level() {
        assert_eq!(run_log_level("debug"), LogLevel::Debug);
        assert_eq!(run_log_level("warn"), LogLevel::Warning);
        assert_eq!(run_log_level("info"), LogLevel::Info);
    }

    #[test]
    fn only_validated_orchestrators_can_run() {
        assert!(OrchestratorState::ProtocolValidated.can_run());
        assert!(!OrchestratorState::Cleaned.can_run());
        assert_eq!(OrchestratorState::DryRunDone.to_string(), "DryRunDone");
    }
}
