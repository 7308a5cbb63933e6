//! Class (stateful object) plugins.
//!
//! A class plugin wraps an object built from `(name, config, logger)`. Native
//! classes are registered in a [`ClassCatalog`] under their identifier. An
//! identifier ending in `.rhai` that is not registered loads a Rhai script whose
//! object state lives in `this`:
//!
//! ```rhai
//! fn create(name, config) { #{ name: name, pulses: 0, width: config.width } }
//! fn initialize() { experiment_log("INFO", "ready"); }
//! fn execute(command, params) { this.pulses += 1; this.pulses }
//! fn cleanup() { }
//! ```
//!
//! Either way the lifecycle methods are checked when the instance is constructed,
//! before the registry accepts it.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rhai::{CallFnOptions, Dynamic, Engine, FuncArgs, Scope, AST};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PluginError;
use crate::plugin::script::{dynamic_to_value, params_to_dynamic, plugin_engine};
use crate::plugin::{ensure_ready, Plugin, PluginState, PluginStatus, PluginType};
use crate::protocol::{ClassSpec, Params};
use crate::run_log::ExperimentLogger;

/// Lifecycle of a user-supplied object.
#[async_trait]
pub trait ClassInstance: Send {
    async fn initialize(&mut self) -> Result<()>;

    async fn execute(&mut self, command: &str, params: &Params) -> Result<Value>;

    async fn cleanup(&mut self) -> Result<()>;
}

/// Constructor signature for native classes.
pub type ClassConstructor =
    Arc<dyn Fn(&str, &Params, Arc<ExperimentLogger>) -> Result<Box<dyn ClassInstance>> + Send + Sync>;

/// Class identifiers available to protocols.
#[derive(Clone, Default)]
pub struct ClassCatalog {
    constructors: BTreeMap<String, ClassConstructor>,
}

impl ClassCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `constructor` under `class_name`, replacing any previous entry.
    pub fn register<F>(&mut self, class_name: impl Into<String>, constructor: F)
    where
        F: Fn(&str, &Params, Arc<ExperimentLogger>) -> Result<Box<dyn ClassInstance>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(class_name.into(), Arc::new(constructor));
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build an instance for `class_name`.
    ///
    /// Falls back to a Rhai class when the identifier ends in `.rhai`.
    pub fn construct(
        &self,
        class_name: &str,
        instance_name: &str,
        config: &Params,
        logger: Arc<ExperimentLogger>,
        max_operations: u64,
    ) -> Result<Box<dyn ClassInstance>> {
        if let Some(constructor) = self.constructors.get(class_name) {
            return constructor(instance_name, config, logger);
        }
        if class_name.ends_with(".rhai") {
            let instance = RhaiClass::load(
                Path::new(class_name),
                instance_name,
                config,
                logger,
                max_operations,
            )?;
            return Ok(Box::new(instance));
        }
        let known: Vec<&str> = self.class_names().collect();
        Err(anyhow!(
            "unknown class '{}' (registered: {})",
            class_name,
            if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            }
        ))
    }
}

impl std::fmt::Debug for ClassCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassCatalog")
            .field("classes", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Rhai-scripted classes
// =============================================================================

const REQUIRED_METHODS: [(&str, usize); 4] = [
    ("create", 2),
    ("initialize", 0),
    ("execute", 2),
    ("cleanup", 0),
];

/// Object defined by a Rhai script; `this` carries its state between calls.
pub struct RhaiClass {
    path: PathBuf,
    engine: Engine,
    ast: AST,
    this: Dynamic,
}

impl RhaiClass {
    pub fn load(
        path: &Path,
        instance_name: &str,
        config: &Params,
        logger: Arc<ExperimentLogger>,
        max_operations: u64,
    ) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("class script not found: {}", path.display());
        }
        let engine = plugin_engine(instance_name, path.parent(), max_operations, logger);
        let ast = engine
            .compile_file(path.to_path_buf())
            .map_err(|e| anyhow!("{}: {}", path.display(), e))?;

        let missing: Vec<String> = REQUIRED_METHODS
            .iter()
            .filter(|(name, arity)| {
                !ast.iter_functions()
                    .any(|f| f.name == *name && f.params.len() == *arity)
            })
            .map(|(name, arity)| format!("{}/{}", name, arity))
            .collect();
        if !missing.is_empty() {
            anyhow::bail!(
                "{} does not define required methods: {}",
                path.display(),
                missing.join(", ")
            );
        }

        let config = params_to_dynamic(instance_name, config)?;
        let this = engine
            .call_fn::<Dynamic>(
                &mut Scope::new(),
                &ast,
                "create",
                (Dynamic::from(instance_name.to_string()), config),
            )
            .map_err(|e| anyhow!("{}: create failed: {}", path.display(), e))?;

        Ok(Self {
            path: path.to_path_buf(),
            engine,
            ast,
            this,
        })
    }

    fn call_method(&mut self, method: &str, args: impl FuncArgs) -> Result<Dynamic> {
        let options = CallFnOptions::new().bind_this_ptr(&mut self.this);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut Scope::new(), &self.ast, method, args)
            .map_err(|e| anyhow!("{}: {} failed: {}", self.path.display(), method, e))
    }
}

#[async_trait]
impl ClassInstance for RhaiClass {
    async fn initialize(&mut self) -> Result<()> {
        self.call_method("initialize", ()).map(|_| ())
    }

    async fn execute(&mut self, command: &str, params: &Params) -> Result<Value> {
        let params = params_to_dynamic("class", params)?;
        let result =
            self.call_method("execute", (Dynamic::from(command.to_string()), params))?;
        Ok(dynamic_to_value("class", &result)?)
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.call_method("cleanup", ()).map(|_| ())
    }
}

// =============================================================================
// ClassPlugin
// =============================================================================

pub struct ClassPlugin {
    name: String,
    critical: bool,
    spec: ClassSpec,
    catalog: ClassCatalog,
    logger: Arc<ExperimentLogger>,
    max_operations: u64,
    instance: Option<Box<dyn ClassInstance>>,
    state: PluginState,
    last_error: Option<String>,
}

impl ClassPlugin {
    pub fn new(
        name: impl Into<String>,
        critical: bool,
        spec: ClassSpec,
        catalog: ClassCatalog,
        logger: Arc<ExperimentLogger>,
        max_operations: u64,
    ) -> Self {
        Self {
            name: name.into(),
            critical,
            spec,
            catalog,
            logger,
            max_operations,
            instance: None,
            state: PluginState::Uninitialized,
            last_error: None,
        }
    }

    fn class_error(&self, err: impl std::fmt::Display) -> PluginError {
        PluginError::Class {
            plugin: self.name.clone(),
            message: err.to_string(),
        }
    }

    fn fail(&mut self, err: PluginError) -> PluginError {
        self.last_error = Some(err.to_string());
        err
    }
}

#[async_trait]
impl Plugin for ClassPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::Class
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        self.state = PluginState::Initializing;

        let constructed = self.catalog.construct(
            &self.spec.class_name,
            &self.name,
            &self.spec.config,
            Arc::clone(&self.logger),
            self.max_operations,
        );
        let mut instance = match constructed {
            Ok(instance) => instance,
            Err(e) => {
                self.state = PluginState::Uninitialized;
                let err = PluginError::InvalidDefinition {
                    plugin: self.name.clone(),
                    message: e.to_string(),
                };
                return Err(self.fail(err));
            }
        };

        if let Err(e) = instance.initialize().await {
            self.state = PluginState::Uninitialized;
            let err = self.class_error(format!("initialize failed: {}", e));
            return Err(self.fail(err));
        }

        self.instance = Some(instance);
        self.state = PluginState::Ready;
        tracing::info!(plugin = %self.name, class = %self.spec.class_name, "Class plugin ready");
        Ok(())
    }

    async fn execute(&mut self, command: &str, params: &Params) -> Result<Value, PluginError> {
        ensure_ready(&self.name, self.state)?;
        let Some(instance) = self.instance.as_mut() else {
            return Err(PluginError::NotInitialized(self.name.clone()));
        };

        self.state = PluginState::Executing;
        let result = instance.execute(command, params).await;
        self.state = PluginState::Ready;

        result.map_err(|e| {
            let err = self.class_error(e);
            self.fail(err)
        })
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        let Some(mut instance) = self.instance.take() else {
            self.state = PluginState::Closed;
            return Ok(());
        };
        self.state = PluginState::Closing;
        let result = instance.cleanup().await;
        self.state = PluginState::Closed;

        result.map_err(|e| {
            let err = self.class_error(format!("cleanup failed: {}", e));
            self.fail(err)
        })
    }

    fn status(&self) -> PluginStatus {
        PluginStatus {
            name: self.name.clone(),
            plugin_type: PluginType::Class,
            state: self.state,
            critical: self.critical,
            detail: Some(match &self.last_error {
                Some(e) => format!("{}; last error: {}", self.spec.class_name, e),
                None => self.spec.class_name.clone(),
            }),
        }
    }
}
