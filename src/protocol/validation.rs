//! Decoded document -> validated [`Protocol`].
//!
//! Checks run in a fixed order and stop at the first failure:
//! version, required sections, experiment info, arena, structure, plugins,
//! block conditions, then every command of every phase. Nothing is executed
//! here; parameter ranges are left to the dispatcher.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, ExperimentError};
use crate::protocol::document::{as_integer, as_sequence, type_name, Section};
use crate::protocol::model::*;

const REQUIRED_SECTIONS: [&str; 4] = ["experiment_info", "arena_info", "experiment_structure", "block"];

/// Validate a decoded protocol document.
///
/// `base_dir` resolves relative script paths; pass the directory of the
/// protocol file, or `None` to keep paths as written.
pub fn validate_document(doc: &Value, base_dir: Option<&Path>) -> AppResult<Protocol> {
    let root = Section::new("protocol", doc)?;

    let version = validate_version(&root)?;

    for section in REQUIRED_SECTIONS {
        if root.get(section).is_none() {
            return Err(ExperimentError::validation(
                section,
                "required section is missing",
            ));
        }
    }

    let experiment_info = validate_info(root.require("experiment_info")?)?;
    let arena = validate_arena(root.require("arena_info")?)?;
    let structure = validate_structure(root.require("experiment_structure")?)?;
    let plugins = validate_plugins(root.get("plugins"), base_dir)?;
    let block = root.require("block")?;
    let raw_conditions = validate_conditions(block)?;

    let declared: HashSet<&str> = plugins.iter().map(|p| p.name.as_str()).collect();

    let pretrial = validate_phase("pretrial", root.get("pretrial"), &declared)?;
    let intertrial = validate_phase("intertrial", root.get("intertrial"), &declared)?;
    let posttrial = validate_phase("posttrial", root.get("posttrial"), &declared)?;

    let mut conditions = Vec::with_capacity(raw_conditions.len());
    for (i, (id, commands)) in raw_conditions.into_iter().enumerate() {
        let path = format!("block.conditions[{}].commands", i);
        conditions.push(Condition {
            id,
            commands: validate_commands(&path, &commands, &declared)?,
        });
    }

    Ok(Protocol {
        version,
        experiment_info,
        arena,
        structure,
        plugins,
        pretrial,
        intertrial,
        posttrial,
        conditions,
        source_path: None,
    })
}

fn validate_version(root: &Section<'_>) -> AppResult<u32> {
    let value = root
        .get("version")
        .ok_or_else(|| ExperimentError::validation("version", "missing schema version"))?;
    let version = as_integer(value).ok_or_else(|| {
        ExperimentError::validation(
            "version",
            format!("must be an integer, got {}", type_name(value)),
        )
    })?;
    u32::try_from(version)
        .ok()
        .filter(|v| SUPPORTED_VERSIONS.contains(v))
        .ok_or_else(|| {
            ExperimentError::validation(
                "version",
                format!(
                    "unsupported schema version {} (supported: {:?})",
                    version, SUPPORTED_VERSIONS
                ),
            )
        })
}

fn validate_info(value: &Value) -> AppResult<ExperimentInfo> {
    let info = Section::new("experiment_info", value)?;
    Ok(ExperimentInfo {
        name: info.require_str("name")?.to_string(),
        author: info.optional_str("author")?.map(str::to_string),
        date: info.optional_str("date")?.map(str::to_string),
        description: info.optional_str("description")?.map(str::to_string),
    })
}

fn validate_arena(value: &Value) -> AppResult<ArenaConfig> {
    let arena = Section::new("arena_info", value)?;
    let generation = arena
        .require_str("generation")?
        .parse::<ArenaGeneration>()
        .map_err(|e| arena.error(e))?;
    Ok(ArenaConfig {
        generation,
        num_rows: to_u32(&arena, "num_rows", arena.require_u64("num_rows", 1)?)?,
        num_cols: to_u32(&arena, "num_cols", arena.require_u64("num_cols", 1)?)?,
    })
}

fn validate_structure(value: &Value) -> AppResult<ExperimentStructure> {
    let structure = Section::new("experiment_structure", value)?;
    let repetitions = to_u32(
        &structure,
        "repetitions",
        structure.require_u64("repetitions", 1)?,
    )?;

    let randomization = match structure.get("randomization") {
        None => Randomization::default(),
        Some(raw) => {
            let section = Section::new("experiment_structure.randomization", raw)?;
            let method = match section.optional_str("method")? {
                None => RandomizationMethod::default(),
                Some(m) => m.parse().map_err(|e: String| section.error(e))?,
            };
            Randomization {
                enabled: section.optional_bool("enabled")?.unwrap_or(false),
                seed: section.optional_u64("seed", 0)?,
                method,
            }
        }
    };

    Ok(ExperimentStructure {
        repetitions,
        randomization,
    })
}

fn to_u32(section: &Section<'_>, key: &str, value: u64) -> AppResult<u32> {
    u32::try_from(value).map_err(|_| section.error(format!("'{}' is too large: {}", key, value)))
}

// =============================================================================
// Plugins
// =============================================================================

fn validate_plugins(value: Option<&Value>, base_dir: Option<&Path>) -> AppResult<Vec<PluginDefinition>> {
    let mut plugins: Vec<PluginDefinition> = Vec::new();

    for (i, raw) in as_sequence(value).iter().enumerate() {
        let path = format!("plugins[{}]", i);
        let section = Section::new(&path, raw)?;

        if section.get("name").is_none() && section.get("id").is_some() {
            return Err(section.error("plugins are identified by 'name'; rename 'id' to 'name'"));
        }
        let name = section.require_str("name")?.to_string();
        if plugins.iter().any(|p| p.name == name) {
            return Err(section.error(format!("duplicate plugin name '{}'", name)));
        }

        let plugin_type: PluginType = section
            .require_str("type")?
            .parse()
            .map_err(|e: String| section.error(e))?;
        let critical = section.optional_bool("critical")?.unwrap_or(true);

        let kind = match plugin_type {
            PluginType::SerialDevice => PluginKind::SerialDevice(validate_serial(&section)?),
            PluginType::Class => PluginKind::Class(validate_class(&section, base_dir)?),
            PluginType::Script => PluginKind::Script(validate_script(&section, base_dir)?),
        };

        plugins.push(PluginDefinition {
            name,
            critical,
            kind,
        });
    }

    Ok(plugins)
}

fn platform_port_key() -> &'static str {
    if cfg!(target_os = "windows") {
        "port_windows"
    } else if cfg!(target_os = "macos") {
        "port_macos"
    } else {
        "port_linux"
    }
}

fn validate_serial(section: &Section<'_>) -> AppResult<SerialDeviceSpec> {
    let port = match section.optional_str(platform_port_key())? {
        Some(port) if !port.trim().is_empty() => port.to_string(),
        _ => section
            .require_str("port")
            .map_err(|_| {
                section.error(format!(
                    "serial_device needs 'port' or '{}'",
                    platform_port_key()
                ))
            })?
            .to_string(),
    };

    let baud_rate = section
        .optional_u64("baud_rate", 1)?
        .map(|b| to_u32(section, "baud_rate", b))
        .transpose()?;

    let raw_commands = section
        .optional_record("commands")?
        .ok_or_else(|| section.error("serial_device needs a 'commands' mapping"))?;
    if raw_commands.is_empty() {
        return Err(section.error("'commands' mapping must not be empty"));
    }

    let mut commands = BTreeMap::new();
    for (name, template) in raw_commands {
        match template {
            Value::String(t) => {
                commands.insert(name.clone(), t.clone());
            }
            other => {
                return Err(section.error(format!(
                    "command template '{}' must be a string, got {}",
                    name,
                    type_name(other)
                )))
            }
        }
    }

    Ok(SerialDeviceSpec {
        port,
        baud_rate,
        read_response: section.optional_bool("read_response")?.unwrap_or(false),
        commands,
    })
}

fn validate_class(section: &Section<'_>, base_dir: Option<&Path>) -> AppResult<ClassSpec> {
    let mut class_name = section.require_str("class_name")?.to_string();
    if class_name.ends_with(".rhai") {
        class_name = resolve(base_dir, Path::new(&class_name))
            .to_string_lossy()
            .into_owned();
    }
    Ok(ClassSpec {
        class_name,
        config: section.optional_record("config")?.cloned().unwrap_or_default(),
    })
}

fn validate_script(section: &Section<'_>, base_dir: Option<&Path>) -> AppResult<ScriptSpec> {
    let script_path = resolve(base_dir, Path::new(section.require_str("script_path")?));
    let convention = match section.optional_str("script_type")? {
        None => ScriptConvention::default(),
        Some(t) => t.parse().map_err(|e: String| section.error(e))?,
    };
    Ok(ScriptSpec {
        script_path,
        convention,
    })
}

fn resolve(base_dir: Option<&Path>, path: &Path) -> PathBuf {
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

// =============================================================================
// Conditions & phases
// =============================================================================

fn validate_conditions(block: &Value) -> AppResult<Vec<(String, Vec<Value>)>> {
    let block = Section::new("block", block)?;
    let conditions = as_sequence(block.get("conditions"));
    if conditions.is_empty() {
        return Err(block.error("'conditions' must contain at least one condition"));
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(conditions.len());
    for (i, raw) in conditions.iter().enumerate() {
        let path = format!("block.conditions[{}]", i);
        let condition = Section::new(&path, raw)?;
        let id = match condition.require("id")? {
            Value::String(s) if !s.trim().is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(condition.error(format!(
                    "'id' must be a non-empty string, got {}",
                    type_name(other)
                )))
            }
        };
        if !seen.insert(id.clone()) {
            return Err(condition.error(format!("duplicate condition id '{}'", id)));
        }
        if !condition.map.contains_key("commands") {
            return Err(condition.error("missing required field 'commands'"));
        }
        out.push((id, as_sequence(condition.get("commands"))));
    }
    Ok(out)
}

fn validate_phase(
    name: &str,
    value: Option<&Value>,
    declared: &HashSet<&str>,
) -> AppResult<Vec<Command>> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let phase = Section::new(name, value)?;
    if !phase.optional_bool("include")?.unwrap_or(true) {
        return Ok(Vec::new());
    }
    let path = format!("{}.commands", name);
    validate_commands(&path, &as_sequence(phase.get("commands")), declared)
}

fn validate_commands(
    path: &str,
    records: &[Value],
    declared: &HashSet<&str>,
) -> AppResult<Vec<Command>> {
    let mut commands = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        let at = format!("{}[{}]", path, i);
        let command =
            Command::from_record(record).map_err(|e| ExperimentError::validation(&at, e.to_string()))?;

        if let Command::Plugin {
            plugin_name,
            params,
            ..
        } = &command
        {
            if !declared.contains(plugin_name.as_str()) {
                return Err(ExperimentError::validation(
                    &at,
                    format!("plugin '{}' is not declared in 'plugins'", plugin_name),
                ));
            }
            if command.is_log() && !matches!(params.get("message"), Some(Value::String(_))) {
                return Err(ExperimentError::validation(
                    &at,
                    "log command requires a string 'params.message'",
                ));
            }
        }
        commands.push(command);
    }
    Ok(commands)
}
