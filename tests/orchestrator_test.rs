//! End-to-end runs of the experiment orchestrator against the mock arena.
//!
//! Each test writes a protocol into a temporary directory, runs it, and checks
//! the controller call sequence, the run artifacts and the cleanup guarantees.

use anyhow::Result;
use arena_protocol::config::EngineConfig;
use arena_protocol::error::{CommandError, ExperimentError};
use arena_protocol::hardware::{ArenaCall, MockArena};
use arena_protocol::orchestrator::{ExperimentOrchestrator, OrchestratorState};
use arena_protocol::plugin::{ClassCatalog, ClassInstance};
use arena_protocol::protocol::Params;
use arena_protocol::trial_order::{generate_trial_order, TrialOrder};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

fn base_protocol() -> Value {
    json!({
        "version": 1,
        "experiment_info": {"name": "orchestrator test", "author": "tests"},
        "arena_info": {"generation": "G4", "num_rows": 2, "num_cols": 12},
        "experiment_structure": {"repetitions": 2},
        "block": {"conditions": [
            {"id": "A", "commands": [{"type": "controller", "command_name": "setPositionX", "posX": 1}]},
            {"id": "B", "commands": [{"type": "controller", "command_name": "setPositionX", "posX": 2}]}
        ]},
        "intertrial": {"commands": [{"type": "controller", "command_name": "allOff"}]}
    })
}

fn write_protocol(dir: &Path, doc: &Value) -> PathBuf {
    let path = dir.join("protocol.json");
    std::fs::write(&path, serde_json::to_string_pretty(doc).unwrap()).unwrap();
    path
}

fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.output_dir = dir.path().join("out");
    config.plugins.mock_serial = true;
    config
}

fn orchestrator(dir: &TempDir, doc: &Value, arena: &Arc<MockArena>) -> ExperimentOrchestrator {
    let path = write_protocol(dir.path(), doc);
    ExperimentOrchestrator::new(path, test_config(dir))
        .unwrap()
        .with_controller(arena.clone())
}

/// Class double recording its lifecycle into a shared journal.
struct Recorder {
    name: String,
    journal: Arc<Mutex<Vec<String>>>,
    fail_initialize: bool,
    fail_cleanup: bool,
}

#[async_trait]
impl ClassInstance for Recorder {
    async fn initialize(&mut self) -> Result<()> {
        self.journal.lock().unwrap().push(format!("init {}", self.name));
        if self.fail_initialize {
            anyhow::bail!("device {} not connected", self.name);
        }
        Ok(())
    }

    async fn execute(&mut self, command: &str, _params: &Params) -> Result<Value> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{} {}", command, self.name));
        Ok(Value::Null)
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.journal.lock().unwrap().push(format!("cleanup {}", self.name));
        if self.fail_cleanup {
            anyhow::bail!("{} refused to close", self.name);
        }
        Ok(())
    }
}

fn recorder_catalog(journal: &Arc<Mutex<Vec<String>>>) -> ClassCatalog {
    let journal = Arc::clone(journal);
    let mut catalog = ClassCatalog::new();
    catalog.register("Recorder", move |name, config, _logger| {
        let flag = |key: &str| config.get(key).and_then(Value::as_bool).unwrap_or(false);
        Ok(Box::new(Recorder {
            name: name.to_string(),
            journal: Arc::clone(&journal),
            fail_initialize: flag("fail_initialize"),
            fail_cleanup: flag("fail_cleanup"),
        }) as Box<dyn ClassInstance>)
    });
    catalog
}

#[tokio::test]
async fn sequential_run_alternates_conditions_with_intertrial_between_trials() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    let mut orch = orchestrator(&dir, &base_protocol(), &arena);

    let outcome = orch.run().await.unwrap();

    assert_eq!(outcome.state, OrchestratorState::Finalized);
    assert_eq!(outcome.trials_completed, 4);
    assert_eq!(outcome.seed, None);
    assert_eq!(orch.state(), OrchestratorState::Cleaned);
    assert_eq!(orch.cleanup_runs(), 1);
    assert_eq!(arena.close_count(), 1);

    use ArenaCall::*;
    assert_eq!(
        arena.calls(),
        vec![
            Open(arena_protocol::protocol::ArenaGeneration::G4),
            SetPositionX(1),
            AllOff,
            SetPositionX(2),
            AllOff,
            SetPositionX(1),
            AllOff,
            SetPositionX(2),
            Close,
        ]
    );
}

#[tokio::test]
async fn run_writes_log_order_summary_and_protocol_copy() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    let mut orch = orchestrator(&dir, &base_protocol(), &arena);

    let outcome = orch.run().await.unwrap();
    let exp = outcome.experiment_dir;
    assert!(exp.starts_with(dir.path().join("out")));
    assert!(exp
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("orchestrator_test_"));

    let log = std::fs::read_to_string(exp.join("experiment.log")).unwrap();
    assert!(log.contains("INFO: Experiment 'orchestrator test' started"));
    assert!(log.contains("Trial 4/4: condition B"));
    assert!(log.contains("Cleanup complete (0 error(s))"));

    let order = TrialOrder::load_json(&exp.join("trial_order.json")).unwrap();
    let ids: Vec<&str> = order.trials.iter().map(|t| t.condition_id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B", "A", "B"]);
    assert_eq!(order.method, "none");

    let summary = std::fs::read_to_string(exp.join("summary.txt")).unwrap();
    assert!(summary.contains("Experiment: orchestrator test"));
    assert!(summary.contains("Arena: G4 (2 rows x 12 cols)"));
    assert!(summary.contains("Trials completed: 4"));
    assert!(summary.contains("Randomization: disabled"));

    assert!(exp.join("protocol.json").is_file());
}

#[tokio::test]
async fn pretrial_failure_aborts_before_any_trial_and_cleans_up_once() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new().fail_on("all_off"));
    let mut doc = base_protocol();
    doc["pretrial"] = json!({"commands": [
        {"type": "controller", "command_name": "allOn"},
        {"type": "controller", "command_name": "allOff"},
        {"type": "controller", "command_name": "stopDisplay"}
    ]});
    let mut orch = orchestrator(&dir, &doc, &arena);

    let err = orch.run().await.unwrap_err();
    match &err {
        ExperimentError::Command {
            phase,
            index,
            source,
        } => {
            assert_eq!(phase, "pretrial");
            assert_eq!(*index, 2);
            assert!(matches!(source, CommandError::HardwareFailure(_)));
        }
        other => panic!("expected a pretrial command error, got {:?}", other),
    }

    assert_eq!(orch.state(), OrchestratorState::Cleaned);
    assert_eq!(orch.cleanup_runs(), 1);
    assert_eq!(arena.close_count(), 1);
    assert!(!arena.is_open());

    use ArenaCall::*;
    assert_eq!(
        arena.calls(),
        vec![
            Open(arena_protocol::protocol::ArenaGeneration::G4),
            AllOn,
            AllOff,
            Close,
        ]
    );

    let log = std::fs::read_to_string(orch.experiment_dir().join("experiment.log")).unwrap();
    assert!(log.contains("ERROR: pretrial command 2 failed"));
    assert!(!orch.experiment_dir().join("summary.txt").exists());

    // A second run is refused and does not clean up again
    assert!(matches!(
        orch.run().await,
        Err(ExperimentError::InvalidState(_))
    ));
    assert!(orch.cleanup().await.is_clean());
    assert_eq!(orch.cleanup_runs(), 1);
    assert_eq!(arena.close_count(), 1);
}

#[tokio::test]
async fn trial_failure_stops_the_loop() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    let mut doc = base_protocol();
    doc["block"]["conditions"][1]["commands"] = json!([
        {"type": "controller", "command_name": "trialParams", "mode": 5,
         "pattern_ID": 1, "frame_rate": 0, "frame_index": 1, "gain": 0, "duration": 1}
    ]);
    let mut orch = orchestrator(&dir, &doc, &arena);

    let err = orch.run().await.unwrap_err();
    assert!(matches!(
        err,
        ExperimentError::Command {
            source: CommandError::InvalidParameter { .. },
            ..
        }
    ));
    // Mode 5 never reaches the controller
    assert!(!arena
        .calls()
        .iter()
        .any(|c| matches!(c, ArenaCall::StartTrial(_))));
    assert_eq!(arena.close_count(), 1);
}

#[tokio::test]
async fn posttrial_failure_is_logged_and_remaining_commands_run() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new().fail_on("stop_display"));
    let mut doc = base_protocol();
    doc["posttrial"] = json!({"commands": [
        {"type": "controller", "command_name": "stopDisplay"},
        {"type": "controller", "command_name": "allOn"}
    ]});
    let mut orch = orchestrator(&dir, &doc, &arena);

    let outcome = orch.run().await.unwrap();
    assert_eq!(outcome.state, OrchestratorState::Finalized);
    assert_eq!(outcome.posttrial_failures, 1);

    let calls = arena.calls();
    let tail = &calls[calls.len() - 3..];
    assert_eq!(
        tail,
        &[ArenaCall::StopDisplay, ArenaCall::AllOn, ArenaCall::Close]
    );

    let log = std::fs::read_to_string(outcome.experiment_dir.join("experiment.log")).unwrap();
    assert!(log.contains("WARNING: posttrial command 1 failed"));
    let summary = std::fs::read_to_string(outcome.experiment_dir.join("summary.txt")).unwrap();
    assert!(summary.contains("Posttrial failures: 1"));
}

#[tokio::test]
async fn excluded_phases_are_skipped() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    let mut doc = base_protocol();
    doc["intertrial"]["include"] = json!(false);
    doc["pretrial"] = json!({"include": false, "commands": [
        {"type": "controller", "command_name": "allOn"}
    ]});
    let mut orch = orchestrator(&dir, &doc, &arena);

    orch.run().await.unwrap();
    assert_eq!(arena.command_count(), 4);
    assert!(!arena.calls().contains(&ArenaCall::AllOn));
}

#[tokio::test]
async fn dry_run_initializes_without_issuing_commands() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    let path = write_protocol(dir.path(), &base_protocol());
    let mut config = test_config(&dir);
    config.dry_run = true;
    let mut orch = ExperimentOrchestrator::new(path, config)
        .unwrap()
        .with_controller(arena.clone());

    let outcome = orch.run().await.unwrap();
    assert_eq!(outcome.state, OrchestratorState::DryRunDone);
    assert_eq!(outcome.trials_completed, 0);
    assert_eq!(arena.command_count(), 0);
    assert_eq!(arena.close_count(), 1);
    assert!(!outcome.experiment_dir.join("trial_order.json").exists());
    assert!(orch.trial_order().is_none());
}

#[tokio::test]
async fn seeded_randomization_is_reproduced_in_trial_order_file() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    let mut doc = base_protocol();
    doc["experiment_structure"] = json!({
        "repetitions": 3,
        "randomization": {"enabled": true, "seed": 7, "method": "trial"}
    });
    let mut orch = orchestrator(&dir, &doc, &arena);

    let outcome = orch.run().await.unwrap();
    assert_eq!(outcome.seed, Some(7));

    let saved = TrialOrder::load_json(&outcome.experiment_dir.join("trial_order.json")).unwrap();
    let expected = generate_trial_order(
        &["A".to_string(), "B".to_string()],
        3,
        &orch.protocol().structure.randomization,
        Some(7),
    );
    assert_eq!(saved.trials, expected);
    assert!(saved.trials.iter().all(|t| t.block_number.is_none()));

    // Executed positions follow the saved order
    let executed: Vec<u16> = arena
        .calls()
        .iter()
        .filter_map(|c| match c {
            ArenaCall::SetPositionX(x) => Some(*x),
            _ => None,
        })
        .collect();
    let planned: Vec<u16> = expected
        .iter()
        .map(|t| if t.condition_id == "A" { 1 } else { 2 })
        .collect();
    assert_eq!(executed, planned);
}

#[tokio::test]
async fn every_plugin_is_cleaned_up_in_reverse_order_even_when_one_fails() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut doc = base_protocol();
    doc["plugins"] = json!([
        {"name": "first", "type": "class", "class_name": "Recorder"},
        {"name": "second", "type": "class", "class_name": "Recorder", "config": {"fail_cleanup": true}},
        {"name": "third", "type": "class", "class_name": "Recorder"}
    ]);
    doc["posttrial"] = json!({"commands": [
        {"type": "plugin", "plugin_name": "second", "command_name": "flush"}
    ]});
    let mut orch = orchestrator(&dir, &doc, &arena).with_class_catalog(recorder_catalog(&journal));

    let outcome = orch.run().await.unwrap();
    assert_eq!(outcome.state, OrchestratorState::Finalized);
    assert_eq!(arena.close_count(), 1);

    let journal = journal.lock().unwrap().clone();
    assert_eq!(
        journal,
        vec![
            "init first",
            "init second",
            "init third",
            "flush second",
            "cleanup third",
            "cleanup second",
            "cleanup first",
        ]
    );

    let log = std::fs::read_to_string(outcome.experiment_dir.join("experiment.log")).unwrap();
    assert!(log.contains("Cleanup failed for plugin 'second'"));
    assert!(log.contains("Cleanup complete (1 error(s))"));
}

#[tokio::test]
async fn critical_plugin_failure_aborts_before_the_arena_opens() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut doc = base_protocol();
    doc["plugins"] = json!([
        {"name": "ok", "type": "class", "class_name": "Recorder"},
        {"name": "camera", "type": "class", "class_name": "Recorder", "config": {"fail_initialize": true}}
    ]);
    let mut orch = orchestrator(&dir, &doc, &arena).with_class_catalog(recorder_catalog(&journal));

    let err = orch.run().await.unwrap_err();
    match err {
        ExperimentError::Initialization { component, .. } => {
            assert_eq!(component, "plugin 'camera'")
        }
        other => panic!("expected initialization error, got {:?}", other),
    }
    assert!(arena.calls().is_empty());
    // The already registered plugin is still released
    assert!(journal.lock().unwrap().contains(&"cleanup ok".to_string()));
}

#[tokio::test]
async fn non_critical_plugin_failure_degrades_and_run_continues() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut doc = base_protocol();
    doc["plugins"] = json!([
        {"name": "camera", "type": "class", "class_name": "Recorder", "critical": false,
         "config": {"fail_initialize": true}}
    ]);
    let mut orch = orchestrator(&dir, &doc, &arena).with_class_catalog(recorder_catalog(&journal));

    let outcome = orch.run().await.unwrap();
    assert_eq!(outcome.trials_completed, 4);

    let statuses = orch.plugin_statuses().await;
    assert_eq!(statuses.len(), 1);
    assert!(!statuses[0].critical);

    let log = std::fs::read_to_string(outcome.experiment_dir.join("experiment.log")).unwrap();
    assert!(log.contains("WARNING: Non-critical plugin 'camera' unavailable"));
}

#[tokio::test]
async fn log_command_and_script_plugin_write_to_the_run_log() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new());
    std::fs::write(
        dir.path().join("notes.rhai"),
        r#"fn notes(params) { experiment_log("INFO", "note " + params.text); }"#,
    )
    .unwrap();
    let mut doc = base_protocol();
    doc["plugins"] = json!([{"name": "notes", "type": "script", "script_path": "notes.rhai"}]);
    doc["pretrial"] = json!({"commands": [
        {"type": "plugin", "plugin_name": "notes", "command_name": "log",
         "params": {"message": "session begins", "level": "warning"}},
        {"type": "plugin", "plugin_name": "notes", "params": {"text": "from script"}}
    ]});
    let mut orch = orchestrator(&dir, &doc, &arena);

    let outcome = orch.run().await.unwrap();
    let log = std::fs::read_to_string(outcome.experiment_dir.join("experiment.log")).unwrap();
    assert!(log.contains("WARNING: [notes] session begins"));
    assert!(log.contains("note from script"));
}

#[tokio::test]
async fn invalid_protocol_is_rejected_before_any_side_effect() {
    let dir = tempdir().unwrap();
    let mut doc = base_protocol();
    doc["block"]["conditions"] = json!([]);
    let path = write_protocol(dir.path(), &doc);

    let err = ExperimentOrchestrator::new(path, test_config(&dir)).unwrap_err();
    assert!(err.is_validation());
    assert!(!dir.path().join("out").exists());
}

#[tokio::test]
async fn missing_critical_script_is_an_environment_error() {
    let dir = tempdir().unwrap();
    let mut doc = base_protocol();
    doc["plugins"] = json!([{"name": "reward", "type": "script", "script_path": "missing.rhai"}]);
    let path = write_protocol(dir.path(), &doc);

    let err = ExperimentOrchestrator::new(path, test_config(&dir)).unwrap_err();
    assert!(matches!(err, ExperimentError::Environment(_)));
}

#[tokio::test]
async fn arena_refusing_to_open_is_an_initialization_error() {
    let dir = tempdir().unwrap();
    let arena = Arc::new(MockArena::new().fail_on("open"));
    let mut orch = orchestrator(&dir, &base_protocol(), &arena);

    let err = orch.run().await.unwrap_err();
    assert!(matches!(err, ExperimentError::Initialization { .. }));
    assert_eq!(orch.state(), OrchestratorState::Cleaned);
    // Never opened, so nothing to close
    assert!(!arena.calls().contains(&ArenaCall::Close));
}
