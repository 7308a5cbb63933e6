//! Engine configuration using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults (every field has one)
//! 2. An optional TOML file (e.g. `config/arena_protocol.toml`)
//! 3. Environment variables prefixed with `ARENA_PROTOCOL_` (`__` separates nesting)
//!
//! CLI flags are applied on top by the binary.
//!
//! # Example
//! ```no_run
//! use arena_protocol::config::EngineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load_from("config/arena_protocol.toml")?;
//! println!("Output directory: {}", config.output_dir.display());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory under which experiment directories are created
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Validate and initialize only; issue no experimental commands
    #[serde(default)]
    pub dry_run: bool,
    /// Arena controller settings
    #[serde(default)]
    pub arena: ArenaSettings,
    /// Plugin settings
    #[serde(default)]
    pub plugins: PluginSettings,
    /// Script plugin settings
    #[serde(default)]
    pub script: ScriptSettings,
}

/// Arena controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaSettings {
    /// `mock` for the simulated arena, otherwise `host:port` of the controller
    #[serde(default = "default_arena_address")]
    pub address: String,
    /// Round-trip timeout for one controller command in milliseconds
    #[serde(default = "default_arena_timeout")]
    pub timeout_ms: u64,
    /// Command templates sent by the network controller, keyed by operation
    #[serde(default = "default_command_set")]
    pub command_set: BTreeMap<String, String>,
}

/// Plugin configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Replace serial connections with in-memory links
    #[serde(default)]
    pub mock_serial: bool,
    /// Baud rate used when a serial plugin does not declare one
    #[serde(default = "default_baud_rate")]
    pub default_baud_rate: u32,
    /// Timeout for reading one response line in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// Script plugin configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSettings {
    /// Rhai operation limit per call (0 = unlimited)
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
}

// Default value functions
fn default_output_dir() -> PathBuf {
    PathBuf::from("./experiments")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_arena_address() -> String {
    "mock".to_string()
}

fn default_arena_timeout() -> u64 {
    2000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_read_timeout() -> u64 {
    500
}

fn default_max_operations() -> u64 {
    1_000_000
}

/// Default command words for the network arena controller.
///
/// `{mode}`, `{pattern_id}`, `{frame_rate}`, `{frame_index}`, `{gain}`, `{duration}`,
/// `{x}` and `{depth}` are substituted by the controller.
pub fn default_command_set() -> BTreeMap<String, String> {
    [
        ("all_on", "ALL_ON"),
        ("all_off", "ALL_OFF"),
        ("stop_display", "STOP_DISPLAY"),
        ("set_position_x", "SET_POSITION_X {x}"),
        ("set_color_depth", "SET_COLOR_DEPTH {depth}"),
        (
            "start_trial",
            "TRIAL {mode} {pattern_id} {frame_rate} {frame_index} {gain} {duration}",
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            address: default_arena_address(),
            timeout_ms: default_arena_timeout(),
            command_set: default_command_set(),
        }
    }
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            mock_serial: false,
            default_baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            log_level: default_log_level(),
            dry_run: false,
            arena: ArenaSettings::default(),
            plugins: PluginSettings::default(),
            script: ScriptSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load defaults overridden by `ARENA_PROTOCOL_*` environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(None).extract()
    }

    /// Load configuration from a TOML file, then environment variables
    ///
    /// A missing file is not an error; the defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(Some(path.as_ref())).extract()
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("ARENA_PROTOCOL_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.arena.address.trim().is_empty() {
            return Err("arena.address must not be empty".to_string());
        }
        if self.arena.timeout_ms == 0 {
            return Err("arena.timeout_ms must be greater than zero".to_string());
        }
        if self.plugins.read_timeout_ms == 0 {
            return Err("plugins.read_timeout_ms must be greater than zero".to_string());
        }
        if self.plugins.default_baud_rate == 0 {
            return Err("plugins.default_baud_rate must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Whether the arena address selects the simulated controller
    pub fn uses_mock_arena(&self) -> bool {
        self.arena.address.eq_ignore_ascii_case("mock")
    }
}
