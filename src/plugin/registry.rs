//! Plugin registry
//!
//! Owns every plugin instance of one run, keyed by name and kept in registration
//! order. Plugins are torn down in reverse order by [`PluginRegistry::close_all`],
//! which always visits every plugin and only reports failures.
//!
//! A failed `initialize` is handled according to the definition's `critical` flag:
//! critical plugins return the error to the caller, non-critical plugins are
//! registered as unavailable and a warning is written to the run log.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{CommandError, PluginError};
use crate::plugin::{
    ClassCatalog, ClassPlugin, Plugin, PluginState, PluginStatus, PluginType, ScriptPlugin,
    SerialPlugin,
};
use crate::protocol::{Params, PluginDefinition, PluginKind};
use crate::run_log::{ExperimentLogger, LogLevel};

/// Settings applied to every plugin built by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryOptions {
    pub mock_serial: bool,
    pub default_baud_rate: u32,
    pub read_timeout: Duration,
    pub max_operations: u64,
}

impl RegistryOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            mock_serial: config.plugins.mock_serial,
            default_baud_rate: config.plugins.default_baud_rate,
            read_timeout: Duration::from_millis(config.plugins.read_timeout_ms),
            max_operations: config.script.max_operations,
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Result of registering one plugin.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginInit {
    Ready,
    /// Non-critical plugin that failed to initialize
    Unavailable(String),
}

struct Entry {
    plugin: Box<dyn Plugin>,
    critical: bool,
    unavailable: Option<String>,
}

pub struct PluginRegistry {
    entries: Vec<Entry>,
    logger: Arc<ExperimentLogger>,
    catalog: ClassCatalog,
    options: RegistryOptions,
    closed: bool,
}

impl PluginRegistry {
    pub fn new(logger: Arc<ExperimentLogger>, catalog: ClassCatalog, options: RegistryOptions) -> Self {
        Self {
            entries: Vec::new(),
            logger,
            catalog,
            options,
            closed: false,
        }
    }

    /// Build the plugin described by `def` without initializing it.
    pub fn build(&self, def: &PluginDefinition) -> Box<dyn Plugin> {
        match &def.kind {
            PluginKind::SerialDevice(spec) => Box::new(SerialPlugin::new(
                &def.name,
                def.critical,
                spec.clone(),
                self.options.default_baud_rate,
                self.options.read_timeout,
                self.options.mock_serial,
            )),
            PluginKind::Class(spec) => Box::new(ClassPlugin::new(
                &def.name,
                def.critical,
                spec.clone(),
                self.catalog.clone(),
                Arc::clone(&self.logger),
                self.options.max_operations,
            )),
            PluginKind::Script(spec) => Box::new(ScriptPlugin::new(
                &def.name,
                def.critical,
                spec.clone(),
                self.options.max_operations,
                Arc::clone(&self.logger),
            )),
        }
    }

    /// Build, initialize and register the plugin described by `def`.
    pub async fn initialize_plugin(&mut self, def: &PluginDefinition) -> Result<PluginInit, PluginError> {
        let plugin = self.build(def);
        self.register(plugin, def.critical).await
    }

    /// Initialize and register an already-built plugin.
    pub async fn register(
        &mut self,
        mut plugin: Box<dyn Plugin>,
        critical: bool,
    ) -> Result<PluginInit, PluginError> {
        let name = plugin.name().to_string();
        if self.contains(&name) {
            return Err(PluginError::Duplicate(name));
        }

        match plugin.initialize().await {
            Ok(()) => {
                self.logger.info(format!(
                    "Plugin '{}' ({}) initialized",
                    name,
                    plugin.plugin_type()
                ));
                self.entries.push(Entry {
                    plugin,
                    critical,
                    unavailable: None,
                });
                Ok(PluginInit::Ready)
            }
            Err(e) if critical => {
                self.logger
                    .error(format!("Critical plugin '{}' failed to initialize: {}", name, e));
                if let Err(cleanup_err) = plugin.cleanup().await {
                    tracing::warn!(plugin = %name, error = %cleanup_err, "Cleanup after failed initialize");
                }
                Err(e)
            }
            Err(e) => {
                let reason = e.to_string();
                self.logger.warning(format!(
                    "Non-critical plugin '{}' unavailable: {}",
                    name, reason
                ));
                self.entries.push(Entry {
                    plugin,
                    critical,
                    unavailable: Some(reason.clone()),
                });
                Ok(PluginInit::Unavailable(reason))
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.plugin.name() == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plugin names in registration order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.plugin.name().to_string()).collect()
    }

    pub fn plugin_type(&self, name: &str) -> Option<PluginType> {
        self.entry(name).map(|e| e.plugin.plugin_type())
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.plugin.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Plugin + 'static)> {
        self.entries
            .iter_mut()
            .find(|e| e.plugin.name() == name)
            .map(|e| e.plugin.as_mut())
    }

    /// Run `command` on plugin `name`.
    pub async fn execute(
        &mut self,
        name: &str,
        command: &str,
        params: &Params,
    ) -> Result<Value, CommandError> {
        let plugin = self
            .get_mut(name)
            .ok_or_else(|| CommandError::PluginNotFound(name.to_string()))?;
        Ok(plugin.execute(command, params).await?)
    }

    /// Write `[plugin_name] message` to the run log.
    ///
    /// Only requires `plugin_name` to be registered.
    pub fn log_custom_message(
        &self,
        plugin_name: &str,
        message: &str,
        level: LogLevel,
    ) -> Result<(), CommandError> {
        if !self.contains(plugin_name) {
            return Err(CommandError::PluginNotFound(plugin_name.to_string()));
        }
        self.logger.log(level, format!("[{}] {}", plugin_name, message));
        Ok(())
    }

    /// Snapshot of every plugin in registration order
    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.entries
            .iter()
            .map(|e| {
                let mut status = e.plugin.status();
                status.critical = e.critical;
                if let Some(reason) = &e.unavailable {
                    if status.state != PluginState::Closed {
                        status.state = PluginState::Unavailable;
                    }
                    status.detail = Some(reason.clone());
                }
                status
            })
            .collect()
    }

    /// Clean up every plugin in reverse registration order.
    ///
    /// Never fails; returns one message per plugin whose cleanup reported an
    /// error. A second call does nothing.
    pub async fn close_all(&mut self) -> Vec<String> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;

        let mut failures = Vec::new();
        for entry in self.entries.iter_mut().rev() {
            let name = entry.plugin.name().to_string();
            match entry.plugin.cleanup().await {
                Ok(()) => self.logger.debug(format!("Plugin '{}' closed", name)),
                Err(e) => {
                    let message = format!("plugin '{}': {}", name, e);
                    self.logger.error(format!("Cleanup failed for {}", message));
                    failures.push(message);
                }
            }
        }
        failures
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ScriptConvention, ScriptSpec, SerialDeviceSpec};

    fn registry() -> PluginRegistry {
        let options = RegistryOptions {
            mock_serial: true,
            ..RegistryOptions::default()
        };
        PluginRegistry::new(
            Arc::new(ExperimentLogger::detached(LogLevel::Debug)),
            ClassCatalog::new(),
            options,
        )
    }

    fn serial_def(name: &str) -> PluginDefinition {
        PluginDefinition {
            name: name.into(),
            critical: true,
            kind: PluginKind::SerialDevice(SerialDeviceSpec {
                port: "/dev/ttyACM0".into(),
                baud_rate: Some(115_200),
                read_response: false,
                commands: [("on".to_string(), "ON\n".to_string())].into_iter().collect(),
            }),
        }
    }

    fn missing_script_def(name: &str, critical: bool) -> PluginDefinition {
        PluginDefinition {
            name: name.into(),
            critical,
            kind: PluginKind::Script(ScriptSpec {
                script_path: "/nonexistent/missing.rhai".into(),
                convention: ScriptConvention::Function,
            }),
        }
    }

    #[tokio::test]
    async fn registers_in_order_and_rejects_duplicates() {
        let mut reg = registry();
        assert_eq!(reg.initialize_plugin(&serial_def("a")).await.unwrap(), PluginInit::Ready);
        reg.initialize_plugin(&serial_def("b")).await.unwrap();
        assert_eq!(reg.names(), vec!["a", "b"]);
        assert!(matches!(
            reg.initialize_plugin(&serial_def("a")).await,
            Err(PluginError::Duplicate(_))
        ));
        assert_eq!(reg.plugin_type("b"), Some(PluginType::SerialDevice));
    }

    #[tokio::test]
    async fn critical_failure_is_returned_non_critical_is_degraded() {
        let mut reg = registry();
        assert!(reg
            .initialize_plugin(&missing_script_def("must", true))
            .await
            .is_err());
        assert!(!reg.contains("must"));

        let init = reg
            .initialize_plugin(&missing_script_def("optional", false))
            .await
            .unwrap();
        assert!(matches!(init, PluginInit::Unavailable(_)));
        let status = &reg.statuses()[0];
        assert_eq!(status.state, PluginState::Unavailable);
        assert!(!status.critical);

        let err = reg
            .execute("optional", "run", &Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Plugin(PluginError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn log_hook_requires_registration_only() {
        let mut reg = registry();
        reg.initialize_plugin(&serial_def("led")).await.unwrap();
        assert!(reg.log_custom_message("led", "hello", LogLevel::Info).is_ok());
        assert!(matches!(
            reg.log_custom_message("camera", "hello", LogLevel::Info),
            Err(CommandError::PluginNotFound(_))
        ));
    }

    #[tokio::test]
    async fn close_all_runs_once() {
        let mut reg = registry();
        reg.initialize_plugin(&serial_def("led")).await.unwrap();
        assert!(reg.close_all().await.is_empty());
        assert!(reg.is_closed());
        assert!(reg.close_all().await.is_empty());
        assert_eq!(reg.statuses()[0].state, PluginState::Closed);
    }
}
