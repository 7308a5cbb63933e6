//! Plugin contract and variants
//!
//! Every auxiliary device or user extension is driven through the [`Plugin`]
//! trait. Three variants exist, selected by the `type` of the plugin definition:
//!
//! - [`serial::SerialPlugin`] - table-driven serial device (`serial_device`)
//! - [`class::ClassPlugin`] - user-supplied stateful object (`class`)
//! - [`script::ScriptPlugin`] - user-supplied callable (`script`)
//!
//! The [`registry::PluginRegistry`] owns all instances of one run and only ever
//! sees them as `Box<dyn Plugin>`.

pub mod class;
pub mod registry;
pub mod script;
pub mod serial;
pub mod template;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::error::PluginError;
use crate::protocol::Params;

pub use crate::protocol::PluginType;
pub use class::{ClassCatalog, ClassInstance, ClassPlugin};
pub use registry::{PluginRegistry, RegistryOptions};
pub use script::ScriptPlugin;
pub use serial::SerialPlugin;

/// Lifecycle state of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    Closing,
    Closed,
    /// Non-critical initialization failed; commands are rejected
    Unavailable,
}

impl PluginState {
    pub fn can_execute(&self) -> bool {
        matches!(self, PluginState::Ready)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Uninitialized => "uninitialized",
            PluginState::Initializing => "initializing",
            PluginState::Ready => "ready",
            PluginState::Executing => "executing",
            PluginState::Closing => "closing",
            PluginState::Closed => "closed",
            PluginState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub plugin_type: PluginType,
    pub state: PluginState,
    pub critical: bool,
    /// Variant-specific detail: port, class name, script path or last error
    pub detail: Option<String>,
}

/// Uniform plugin lifecycle.
///
/// `execute` must fail with [`PluginError::NotInitialized`] before a successful
/// `initialize`, and with [`PluginError::UnknownCommand`] for commands the plugin
/// does not know. `cleanup` is idempotent and always leaves the plugin `Closed`;
/// an `Err` only reports what went wrong while releasing resources.
#[async_trait]
pub trait Plugin: Send {
    fn name(&self) -> &str;

    fn plugin_type(&self) -> PluginType;

    async fn initialize(&mut self) -> Result<(), PluginError>;

    async fn execute(&mut self, command: &str, params: &Params) -> Result<Value, PluginError>;

    async fn cleanup(&mut self) -> Result<(), PluginError>;

    fn status(&self) -> PluginStatus;
}

/// Guard `execute` on the current state.
pub(crate) fn ensure_ready(name: &str, state: PluginState) -> Result<(), PluginError> {
    if state.can_execute() {
        Ok(())
    } else {
        Err(PluginError::NotInitialized(name.to_string()))
    }
}
