//! Typed, validated experiment protocol.
//!
//! A `Protocol` is produced once by [`crate::protocol::validation`] and is not
//! mutated afterwards. Phase sections are always plain (possibly empty) command
//! sequences; the `include` flags and singleton-vs-list shapes of the source
//! document are resolved during validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CommandError;

/// Free-form key/value record passed to plugins and controller commands.
pub type Params = serde_json::Map<String, Value>;

/// Schema versions this engine understands.
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Reserved plugin command name intercepted by the dispatcher.
pub const LOG_COMMAND: &str = "log";

// =============================================================================
// Protocol
// =============================================================================

/// Root entity of an experiment definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Protocol {
    pub version: u32,
    pub experiment_info: ExperimentInfo,
    pub arena: ArenaConfig,
    pub structure: ExperimentStructure,
    pub plugins: Vec<PluginDefinition>,
    pub pretrial: Vec<Command>,
    pub intertrial: Vec<Command>,
    pub posttrial: Vec<Command>,
    pub conditions: Vec<Condition>,
    /// File the protocol was loaded from, if any
    pub source_path: Option<PathBuf>,
}

impl Protocol {
    /// Look up a condition by id
    pub fn condition(&self, id: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == id)
    }

    /// Condition ids in declaration order
    pub fn condition_ids(&self) -> Vec<String> {
        self.conditions.iter().map(|c| c.id.clone()).collect()
    }

    /// Look up a plugin definition by name
    pub fn plugin(&self, name: &str) -> Option<&PluginDefinition> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// Number of trials the experiment will run
    pub fn total_trials(&self) -> usize {
        self.conditions.len() * self.structure.repetitions as usize
    }
}

/// Descriptive metadata of an experiment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub name: String,
    pub author: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
}

// =============================================================================
// Arena
// =============================================================================

/// LED arena hardware generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArenaGeneration {
    G3,
    G4,
    #[serde(rename = "G4.1")]
    G41,
    G6,
}

impl ArenaGeneration {
    /// Every generation a protocol may declare
    pub const ALL: [ArenaGeneration; 4] = [Self::G3, Self::G4, Self::G41, Self::G6];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::G3 => "G3",
            Self::G4 => "G4",
            Self::G41 => "G4.1",
            Self::G6 => "G6",
        }
    }
}

impl fmt::Display for ArenaGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArenaGeneration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|g| g.as_str()).collect();
                format!(
                    "unsupported arena generation '{}' (supported: {})",
                    s,
                    names.join(", ")
                )
            })
    }
}

/// Panel layout of the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaConfig {
    pub generation: ArenaGeneration,
    pub num_rows: u32,
    pub num_cols: u32,
}

// =============================================================================
// Structure & randomization
// =============================================================================

/// Repetition and ordering rules for the trial loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStructure {
    pub repetitions: u32,
    pub randomization: Randomization,
}

/// Randomization settings for the trial order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Randomization {
    pub enabled: bool,
    pub seed: Option<u64>,
    pub method: RandomizationMethod,
}

/// How trials are shuffled when randomization is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RandomizationMethod {
    /// Each repetition is an independent permutation of the conditions
    #[default]
    Block,
    /// One permutation over the whole conditions x repetitions multiset
    Trial,
}

impl RandomizationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Trial => "trial",
        }
    }
}

impl fmt::Display for RandomizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RandomizationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "trial" => Ok(Self::Trial),
            other => Err(format!(
                "unknown randomization method '{}' (expected 'block' or 'trial')",
                other
            )),
        }
    }
}

// =============================================================================
// Plugins
// =============================================================================

/// Plugin variant tag used for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    SerialDevice,
    Class,
    Script,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SerialDevice => "serial_device",
            Self::Class => "class",
            Self::Script => "script",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "serial_device" => Ok(Self::SerialDevice),
            "class" => Ok(Self::Class),
            "script" => Ok(Self::Script),
            other => Err(format!(
                "unknown plugin type '{}' (expected serial_device, class or script)",
                other
            )),
        }
    }
}

/// One plugin declared by the protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDefinition {
    pub name: String,
    /// Whether an initialization failure aborts the run
    pub critical: bool,
    pub kind: PluginKind,
}

impl PluginDefinition {
    pub fn plugin_type(&self) -> PluginType {
        match self.kind {
            PluginKind::SerialDevice(_) => PluginType::SerialDevice,
            PluginKind::Class(_) => PluginType::Class,
            PluginKind::Script(_) => PluginType::Script,
        }
    }
}

/// Type-specific payload of a plugin definition.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginKind {
    SerialDevice(SerialDeviceSpec),
    Class(ClassSpec),
    Script(ScriptSpec),
}

/// Table-driven serial device.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialDeviceSpec {
    /// Port resolved for the current platform
    pub port: String,
    /// `None` uses the configured default
    pub baud_rate: Option<u32>,
    /// Read one response line after each command
    pub read_response: bool,
    /// Command name -> template string (e.g. `"on" -> "LIGHT ON\r\n"`)
    pub commands: BTreeMap<String, String>,
}

/// User-supplied stateful object.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassSpec {
    pub class_name: String,
    pub config: Params,
}

/// User-supplied callable.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSpec {
    pub script_path: PathBuf,
    pub convention: ScriptConvention,
}

/// How a script plugin is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptConvention {
    /// Call the function named after the file with one params record
    #[default]
    Function,
    /// Evaluate the whole file with `params` in scope
    Inline,
}

impl FromStr for ScriptConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "function" => Ok(Self::Function),
            "script" | "inline" => Ok(Self::Inline),
            other => Err(format!(
                "unknown script_type '{}' (expected 'function' or 'script')",
                other
            )),
        }
    }
}

// =============================================================================
// Conditions & commands
// =============================================================================

/// A named, reusable command sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub id: String,
    pub commands: Vec<Command>,
}

/// One instruction of a phase or condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Arena hardware operation; `fields` holds everything except `type` and `command_name`
    Controller { command_name: String, fields: Params },
    /// Block the run for `duration` seconds
    Wait { duration: f64 },
    /// Plugin invocation
    Plugin {
        plugin_name: String,
        command_name: Option<String>,
        params: Params,
    },
}

impl Command {
    /// Decode one command record.
    ///
    /// Only the type tag and the per-type minimal fields are checked here; parameter
    /// ranges are checked by the dispatcher right before execution.
    pub fn from_record(record: &Value) -> Result<Self, CommandError> {
        let map = record
            .as_object()
            .ok_or_else(|| CommandError::invalid("command", "must be a record"))?;

        let type_tag = match map.get("type") {
            None | Some(Value::Null) => return Err(CommandError::MissingField("type".into())),
            Some(Value::String(s)) => s.trim().to_lowercase(),
            Some(other) => return Err(CommandError::UnknownType(other.to_string())),
        };

        match type_tag.as_str() {
            "controller" => {
                let command_name = required_string(map, "command_name")?;
                let fields = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != "type" && k.as_str() != "command_name")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(Command::Controller {
                    command_name,
                    fields,
                })
            }
            "wait" => {
                let duration = match map.get("duration") {
                    None | Some(Value::Null) => {
                        return Err(CommandError::MissingField("duration".into()))
                    }
                    Some(v) => v.as_f64().ok_or_else(|| {
                        CommandError::invalid("duration", format!("expected a number, got {}", v))
                    })?,
                };
                wait_duration(duration)?;
                Ok(Command::Wait { duration })
            }
            "plugin" => {
                let plugin_name = required_string(map, "plugin_name")?;
                let command_name = match map.get("command_name") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => {
                        return Err(CommandError::invalid(
                            "command_name",
                            format!("expected a string, got {}", other),
                        ))
                    }
                };
                let params = match map.get("params") {
                    None | Some(Value::Null) => Params::new(),
                    Some(Value::Object(p)) => p.clone(),
                    Some(other) => {
                        return Err(CommandError::invalid(
                            "params",
                            format!("expected a record, got {}", other),
                        ))
                    }
                };
                Ok(Command::Plugin {
                    plugin_name,
                    command_name,
                    params,
                })
            }
            other => Err(CommandError::UnknownType(other.to_string())),
        }
    }

    /// Short human-readable description for log lines
    pub fn describe(&self) -> String {
        match self {
            Command::Controller { command_name, .. } => format!("controller '{}'", command_name),
            Command::Wait { duration } => format!("wait {}s", duration),
            Command::Plugin {
                plugin_name,
                command_name: Some(name),
                ..
            } => format!("plugin '{}' command '{}'", plugin_name, name),
            Command::Plugin { plugin_name, .. } => format!("plugin '{}'", plugin_name),
        }
    }

    /// Whether this is the reserved plugin `log` command
    pub fn is_log(&self) -> bool {
        matches!(
            self,
            Command::Plugin { command_name: Some(name), .. } if name.eq_ignore_ascii_case(LOG_COMMAND)
        )
    }
}

fn required_string(map: &Params, key: &str) -> Result<String, CommandError> {
    match map.get(key) {
        None | Some(Value::Null) => Err(CommandError::MissingField(key.to_string())),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(CommandError::invalid(key, "must not be empty")),
        Some(other) => Err(CommandError::invalid(
            key,
            format!("expected a string, got {}", other),
        )),
    }
}

/// Convert a wait length in seconds, rejecting values a `Duration` cannot hold.
pub fn wait_duration(seconds: f64) -> Result<std::time::Duration, CommandError> {
    std::time::Duration::try_from_secs_f64(seconds).map_err(|_| {
        CommandError::invalid(
            "duration",
            format!("must be a finite number of seconds >= 0, got {}", seconds),
        )
    })
}
