//! Command dispatcher
//!
//! Routes one [`Command`] to the arena controller, a timed wait, or a plugin.
//! Controller parameters are range-checked before any hardware call, and a
//! controller answering `false` is reported exactly like a controller error.
//!
//! Controller commands (names are case-insensitive):
//!
//! | command         | fields                                                         |
//! |-----------------|----------------------------------------------------------------|
//! | `allOn`         |                                                                |
//! | `allOff`        |                                                                |
//! | `stopDisplay`   |                                                                |
//! | `setPositionX`  | `posX` >= 0                                                    |
//! | `setColorDepth` | `gs_val` in {2, 16}                                            |
//! | `trialParams`   | `mode` in {2,3,4}, `pattern_ID` >= 1, `frame_index` >= 1,      |
//! |                 | `duration` > 0 s, `frame_rate`, `gain`, `wait_for_completion`? |

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::CommandError;
use crate::hardware::{ArenaController, TrialStart};
use crate::plugin::{PluginRegistry, PluginType};
use crate::protocol::document::as_integer;
use crate::protocol::model::wait_duration;
use crate::protocol::{Command, Params};
use crate::run_log::{ExperimentLogger, LogLevel};

pub struct CommandDispatcher {
    controller: Arc<dyn ArenaController>,
    registry: Arc<Mutex<PluginRegistry>>,
    logger: Arc<ExperimentLogger>,
    executed: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(
        controller: Arc<dyn ArenaController>,
        registry: Arc<Mutex<PluginRegistry>>,
        logger: Arc<ExperimentLogger>,
    ) -> Self {
        Self {
            controller,
            registry,
            logger,
            executed: AtomicU64::new(0),
        }
    }

    /// Commands attempted so far
    pub fn commands_executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Decode and execute a raw command record.
    pub async fn execute_record(&self, record: &Value) -> Result<(), CommandError> {
        let command = Command::from_record(record)?;
        self.execute(&command).await
    }

    /// Execute one command.
    pub async fn execute(&self, command: &Command) -> Result<(), CommandError> {
        let n = self.executed.fetch_add(1, Ordering::SeqCst) + 1;
        self.logger
            .debug(format!("Command #{}: {}", n, command.describe()));

        match command {
            Command::Controller {
                command_name,
                fields,
            } => self.controller_command(command_name, fields).await,
            Command::Wait { duration } => wait(*duration).await,
            Command::Plugin {
                plugin_name,
                command_name,
                params,
            } => {
                if command.is_log() {
                    self.log_command(plugin_name, params).await
                } else {
                    self.plugin_command(plugin_name, command_name.as_deref(), params)
                        .await
                }
            }
        }
    }

    async fn controller_command(&self, name: &str, fields: &Params) -> Result<(), CommandError> {
        let hw = |e: anyhow::Error| CommandError::Hardware {
            command: name.to_string(),
            message: format!("{:#}", e),
        };
        let accepted = |ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(CommandError::HardwareFailure(name.to_string()))
            }
        };

        match name.to_lowercase().as_str() {
            "allon" => accepted(self.controller.all_on().await.map_err(hw)?),
            "alloff" => accepted(self.controller.all_off().await.map_err(hw)?),
            "stopdisplay" => accepted(self.controller.stop_display().await.map_err(hw)?),
            "setpositionx" => {
                let x = int_in_range(fields, "posX", 0, i64::from(u16::MAX))?;
                self.controller
                    .set_position_x(x as u16)
                    .await
                    .map_err(hw)
            }
            "setcolordepth" => {
                let depth = integer_field(fields, "gs_val")?;
                if depth != 2 && depth != 16 {
                    return Err(CommandError::invalid(
                        "gs_val",
                        format!("grayscale depth must be 2 or 16, got {}", depth),
                    ));
                }
                self.controller
                    .set_color_depth(depth as u8)
                    .await
                    .map_err(hw)
            }
            "trialparams" => {
                let trial = trial_start(fields)?;
                accepted(self.controller.start_trial(trial).await.map_err(hw)?)
            }
            _ => Err(CommandError::UnknownControllerCommand(name.to_string())),
        }
    }

    async fn log_command(&self, plugin_name: &str, params: &Params) -> Result<(), CommandError> {
        let message = match field(params, "message") {
            Some(Value::String(m)) => m.clone(),
            Some(other) => other.to_string(),
            None => return Err(CommandError::MissingField("params.message".into())),
        };
        let level = match field(params, "level") {
            None => LogLevel::Info,
            Some(Value::String(l)) => l
                .parse()
                .map_err(|e: String| CommandError::invalid("params.level", e))?,
            Some(other) => {
                return Err(CommandError::invalid(
                    "params.level",
                    format!("expected a string, got {}", other),
                ))
            }
        };
        self.registry
            .lock()
            .await
            .log_custom_message(plugin_name, &message, level)
    }

    async fn plugin_command(
        &self,
        plugin_name: &str,
        command_name: Option<&str>,
        params: &Params,
    ) -> Result<(), CommandError> {
        let mut registry = self.registry.lock().await;
        let plugin_type = registry
            .plugin_type(plugin_name)
            .ok_or_else(|| CommandError::PluginNotFound(plugin_name.to_string()))?;

        let command = match plugin_type {
            PluginType::Script => "",
            PluginType::SerialDevice | PluginType::Class => command_name
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| CommandError::MissingField("command_name".into()))?,
        };

        let result = registry.execute(plugin_name, command, params).await?;
        if !result.is_null() {
            self.logger
                .debug(format!("[{}] {} -> {}", plugin_name, command, result));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("controller", &self.controller.describe())
            .field("executed", &self.commands_executed())
            .finish()
    }
}

async fn wait(duration: f64) -> Result<(), CommandError> {
    tokio::time::sleep(wait_duration(duration)?).await;
    Ok(())
}

/// Case-insensitive field lookup (`pattern_ID` and `pattern_id` are the same field)
fn field<'a>(fields: &'a Params, name: &str) -> Option<&'a Value> {
    fields
        .get(name)
        .or_else(|| {
            fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
        .filter(|v| !v.is_null())
}

fn integer_field(fields: &Params, name: &str) -> Result<i64, CommandError> {
    let value = field(fields, name).ok_or_else(|| CommandError::MissingField(name.to_string()))?;
    as_integer(value)
        .ok_or_else(|| CommandError::invalid(name, format!("expected an integer, got {}", value)))
}

fn int_in_range(fields: &Params, name: &str, min: i64, max: i64) -> Result<i64, CommandError> {
    let value = integer_field(fields, name)?;
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(CommandError::invalid(
            name,
            format!("must be between {} and {}, got {}", min, max, value),
        ))
    }
}

/// Validate every trial-start field; nothing reaches the controller on error.
fn trial_start(fields: &Params) -> Result<TrialStart, CommandError> {
    let mode = integer_field(fields, "mode")?;
    if !(2..=4).contains(&mode) {
        return Err(CommandError::invalid(
            "mode",
            format!("trial mode must be 2, 3 or 4, got {}", mode),
        ));
    }
    let pattern_id = int_in_range(fields, "pattern_ID", 1, i64::from(u16::MAX))?;
    let frame_index = int_in_range(fields, "frame_index", 1, i64::from(u16::MAX))?;
    let frame_rate = int_in_range(fields, "frame_rate", i64::from(i16::MIN), i64::from(i16::MAX))?;
    let gain = int_in_range(fields, "gain", i64::from(i16::MIN), i64::from(i16::MAX))?;

    let duration = field(fields, "duration")
        .ok_or_else(|| CommandError::MissingField("duration".into()))?;
    let seconds = duration
        .as_f64()
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| {
            CommandError::invalid("duration", format!("must be a number > 0 seconds, got {}", duration))
        })?;
    let deciseconds = (seconds * 10.0).round();
    if deciseconds < 1.0 || deciseconds > f64::from(u32::MAX) {
        return Err(CommandError::invalid(
            "duration",
            format!("{} s is outside the controller's 0.1 s resolution range", seconds),
        ));
    }

    let wait_for_completion = match field(fields, "wait_for_completion") {
        None => true,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(CommandError::invalid(
                "wait_for_completion",
                format!("expected true or false, got {}", other),
            ))
        }
    };

    Ok(TrialStart {
        mode: mode as u8,
        pattern_id: pattern_id as u16,
        frame_rate: frame_rate as i16,
        frame_index: frame_index as u16,
        gain: gain as i16,
        duration_units: deciseconds as u32,
        wait_for_completion,
    })
}
