//! Loading protocol files from disk.

use arena_protocol::error::ExperimentError;
use arena_protocol::protocol::{
    ArenaGeneration, Command, PluginKind, PluginType, Protocol, RandomizationMethod,
    ScriptConvention,
};
use std::path::Path;
use tempfile::tempdir;

const YAML: &str = r#"
version: 1
experiment_info:
  name: looming
arena_info:
  generation: g4.1
  num_rows: 4
  num_cols: 12
experiment_structure:
  repetitions: 5
  randomization:
    enabled: true
    method: trial
plugins:
  - name: shutter
    type: serial_device
    port: /dev/ttyUSB0
    commands:
      open: "O\n"
      close: "C\n"
  - name: tracker
    type: script
    script_path: tracker.rhai
    script_type: script
block:
  conditions:
    - id: loom_fast
      commands:
        - type: controller
          command_name: trialParams
          mode: 3
          pattern_ID: 7
          frame_rate: 0
          frame_index: 1
          gain: 10
          duration: 1.5
        - { type: plugin, plugin_name: shutter, command_name: open }
posttrial:
  commands:
    - { type: wait, duration: 0 }
"#;

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn yaml_protocol_loads_with_resolved_paths_and_defaults() {
    let dir = tempdir().unwrap();
    let path = write(dir.path(), "looming.yaml", YAML);

    let protocol = Protocol::load(&path).unwrap();
    assert_eq!(protocol.source_path.as_deref(), Some(path.as_path()));
    assert_eq!(protocol.arena.generation, ArenaGeneration::G41);
    assert_eq!(protocol.total_trials(), 5);

    let randomization = &protocol.structure.randomization;
    assert!(randomization.enabled);
    assert_eq!(randomization.method, RandomizationMethod::Trial);
    assert_eq!(randomization.seed, None);

    let shutter = protocol.plugin("shutter").unwrap();
    assert!(shutter.critical);
    assert_eq!(shutter.plugin_type(), PluginType::SerialDevice);

    match &protocol.plugin("tracker").unwrap().kind {
        PluginKind::Script(spec) => {
            assert_eq!(spec.script_path, dir.path().join("tracker.rhai"));
            assert_eq!(spec.convention, ScriptConvention::Inline);
        }
        other => panic!("unexpected plugin kind {:?}", other),
    }

    assert!(protocol.pretrial.is_empty());
    assert!(protocol.intertrial.is_empty());
    assert_eq!(protocol.posttrial, vec![Command::Wait { duration: 0.0 }]);
    assert_eq!(protocol.conditions[0].commands.len(), 2);
}

#[test]
fn json_and_yaml_forms_are_equivalent() {
    let dir = tempdir().unwrap();
    let yaml_path = write(dir.path(), "p.yml", YAML);
    let doc: serde_json::Value = serde_yaml::from_str(YAML).unwrap();
    let json_path = write(dir.path(), "p.json", &serde_json::to_string(&doc).unwrap());

    let mut from_yaml = Protocol::load(&yaml_path).unwrap();
    let mut from_json = Protocol::load(&json_path).unwrap();
    from_yaml.source_path = None;
    from_json.source_path = None;
    assert_eq!(from_yaml, from_json);
}

#[test]
fn syntax_errors_name_the_file() {
    let dir = tempdir().unwrap();
    let path = write(dir.path(), "broken.yaml", "version: [1\n");

    match Protocol::load(&path).unwrap_err() {
        ExperimentError::Validation { section, .. } => {
            assert!(section.contains("broken.yaml"), "section was {}", section)
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn missing_file_is_a_validation_error() {
    let err = Protocol::load("/nonexistent/protocol.yaml").unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn undeclared_plugin_reference_is_rejected() {
    let dir = tempdir().unwrap();
    let text = YAML.replace("plugin_name: shutter", "plugin_name: laser");
    let path = write(dir.path(), "p.yaml", &text);

    let err = Protocol::load(&path).unwrap_err();
    match err {
        ExperimentError::Validation { section, message } => {
            assert_eq!(section, "block.conditions[0].commands[1]");
            assert!(message.contains("laser"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn wait_too_long_for_the_clock_is_rejected_at_load() {
    let dir = tempdir().unwrap();
    let text = YAML.replace("{ type: wait, duration: 0 }", "{ type: wait, duration: 1.0e+20 }");
    let path = write(dir.path(), "p.yaml", &text);

    match Protocol::load(&path).unwrap_err() {
        ExperimentError::Validation { section, message } => {
            assert_eq!(section, "posttrial.commands[0]");
            assert!(message.contains("duration"), "message was {}", message);
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn bundled_demo_protocol_is_valid() {
    let protocol = Protocol::load("protocols/demo.yaml").unwrap();
    assert_eq!(protocol.experiment_info.name, "Optomotor demo");
    assert_eq!(protocol.condition_ids(), vec!["grating_left", "grating_right"]);
    assert_eq!(protocol.plugins.len(), 3);
    assert_eq!(protocol.structure.randomization.seed, Some(42));
}
