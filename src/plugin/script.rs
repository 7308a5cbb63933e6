//! Script plugin backed by Rhai.
//!
//! The function convention calls the function named after the file stem with a
//! single params map and returns its value:
//!
//! ```rhai
//! // reward_pulse.rhai
//! fn reward_pulse(params) {
//!     experiment_log("INFO", `pulse ${params.ms} ms`);
//!     params.ms * 2
//! }
//! ```
//!
//! The inline convention evaluates the whole file with `params` in scope.
//! The script's directory is the base for `import` statements.

use rhai::module_resolvers::FileModuleResolver;
use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PluginError;
use crate::plugin::{ensure_ready, Plugin, PluginState, PluginStatus, PluginType};
use crate::protocol::{Params, ScriptConvention, ScriptSpec};
use crate::run_log::{ExperimentLogger, LogLevel};

/// Build a sandboxed Rhai engine for plugin `plugin`.
///
/// Registers `experiment_log(level, message)`, routes `print`/`debug` to the
/// run log, resolves imports relative to `base_dir` and enforces the operation
/// limit (0 disables it).
pub(crate) fn plugin_engine(
    plugin: &str,
    base_dir: Option<&Path>,
    max_operations: u64,
    logger: Arc<ExperimentLogger>,
) -> Engine {
    let mut engine = Engine::new();

    if max_operations > 0 {
        engine.on_progress(move |count| {
            if count > max_operations {
                Some(format!("Safety limit exceeded: maximum {} operations", max_operations).into())
            } else {
                None
            }
        });
    }

    if let Some(dir) = base_dir {
        engine.set_module_resolver(FileModuleResolver::new_with_path(dir));
    }

    let name = plugin.to_string();
    let log = Arc::clone(&logger);
    engine.register_fn("experiment_log", move |level: &str, message: &str| {
        let level = level.parse().unwrap_or(LogLevel::Info);
        log.log(level, format!("[{}] {}", name, message));
    });

    let name = plugin.to_string();
    let log = Arc::clone(&logger);
    engine.on_print(move |text| log.info(format!("[{}] {}", name, text)));

    let name = plugin.to_string();
    engine.on_debug(move |text, _source, _pos| logger.debug(format!("[{}] {}", name, text)));

    engine
}

pub(crate) fn params_to_dynamic(plugin: &str, params: &Params) -> Result<Dynamic, PluginError> {
    rhai::serde::to_dynamic(params).map_err(|e| PluginError::Parameter {
        plugin: plugin.to_string(),
        message: format!("params cannot be passed to script: {}", e),
    })
}

pub(crate) fn dynamic_to_value(plugin: &str, value: &Dynamic) -> Result<Value, PluginError> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    rhai::serde::from_dynamic::<Value>(value).map_err(|e| PluginError::Script {
        plugin: plugin.to_string(),
        message: format!("script returned a value that cannot be converted: {}", e),
    })
}

pub struct ScriptPlugin {
    name: String,
    critical: bool,
    spec: ScriptSpec,
    max_operations: u64,
    logger: Arc<ExperimentLogger>,
    engine: Option<Engine>,
    ast: Option<AST>,
    entry_point: String,
    state: PluginState,
    last_error: Option<String>,
}

impl ScriptPlugin {
    pub fn new(
        name: impl Into<String>,
        critical: bool,
        spec: ScriptSpec,
        max_operations: u64,
        logger: Arc<ExperimentLogger>,
    ) -> Self {
        let entry_point = spec
            .script_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: name.into(),
            critical,
            spec,
            max_operations,
            logger,
            engine: None,
            ast: None,
            entry_point,
            state: PluginState::Uninitialized,
            last_error: None,
        }
    }

    pub fn script_path(&self) -> &Path {
        &self.spec.script_path
    }

    fn script_error(&self, message: impl Into<String>) -> PluginError {
        PluginError::Script {
            plugin: self.name.clone(),
            message: message.into(),
        }
    }

    fn load(&self) -> Result<(Engine, AST), PluginError> {
        let path = &self.spec.script_path;
        if !path.is_file() {
            return Err(self.script_error(format!("script not found: {}", path.display())));
        }

        let engine = plugin_engine(
            &self.name,
            path.parent(),
            self.max_operations,
            Arc::clone(&self.logger),
        );
        let ast = engine
            .compile_file(PathBuf::from(path))
            .map_err(|e| self.script_error(format!("{}: {}", path.display(), e)))?;

        if self.spec.convention == ScriptConvention::Function {
            let found = ast
                .iter_functions()
                .any(|f| f.name == self.entry_point && f.params.len() == 1);
            if !found {
                return Err(self.script_error(format!(
                    "{} must define fn {}(params)",
                    path.display(),
                    self.entry_point
                )));
            }
        }
        Ok((engine, ast))
    }
}

#[async_trait::async_trait]
impl Plugin for ScriptPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::Script
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        self.state = PluginState::Initializing;
        match self.load() {
            Ok((engine, ast)) => {
                self.engine = Some(engine);
                self.ast = Some(ast);
                self.state = PluginState::Ready;
                tracing::info!(
                    plugin = %self.name,
                    script = %self.spec.script_path.display(),
                    "Script plugin loaded"
                );
                Ok(())
            }
            Err(e) => {
                self.state = PluginState::Uninitialized;
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// `command` is ignored; scripts have a single entry point.
    async fn execute(&mut self, _command: &str, params: &Params) -> Result<Value, PluginError> {
        ensure_ready(&self.name, self.state)?;
        let (Some(engine), Some(ast)) = (self.engine.as_ref(), self.ast.as_ref()) else {
            return Err(PluginError::NotInitialized(self.name.clone()));
        };

        let args = params_to_dynamic(&self.name, params)?;
        let mut scope = Scope::new();
        let result = match self.spec.convention {
            ScriptConvention::Function => {
                engine.call_fn::<Dynamic>(&mut scope, ast, &self.entry_point, (args,))
            }
            ScriptConvention::Inline => {
                scope.push_dynamic("params", args);
                engine.eval_ast_with_scope::<Dynamic>(&mut scope, ast)
            }
        };

        match result {
            Ok(value) => dynamic_to_value(&self.name, &value),
            Err(e) => {
                let err = self.script_error(e.to_string());
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        self.ast = None;
        self.engine = None;
        self.state = PluginState::Closed;
        Ok(())
    }

    fn status(&self) -> PluginStatus {
        let script = self.spec.script_path.display().to_string();
        PluginStatus {
            name: self.name.clone(),
            plugin_type: PluginType::Script,
            state: self.state,
            critical: self.critical,
            detail: Some(match &self.last_error {
                Some(e) => format!("{}; last error: {}", script, e),
                None => script,
            }),
        }
    }
}
