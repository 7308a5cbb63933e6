//! Experiment protocol model, loading and validation.

pub mod document;
pub mod loader;
pub mod model;
pub mod validation;

pub use model::{
    ArenaConfig, ArenaGeneration, ClassSpec, Command, Condition, ExperimentInfo,
    ExperimentStructure, Params, PluginDefinition, PluginKind, PluginType, Protocol,
    Randomization, RandomizationMethod, ScriptConvention, ScriptSpec, SerialDeviceSpec,
    LOG_COMMAND, SUPPORTED_VERSIONS,
};
pub use validation::validate_document;

use serde_json::Value;
use std::path::Path;

use crate::error::AppResult;

impl Protocol {
    /// Load and validate a protocol file (YAML or JSON).
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let doc = loader::load_document(path)?;
        let mut protocol = validate_document(&doc, path.parent())?;
        protocol.source_path = Some(path.to_path_buf());
        Ok(protocol)
    }

    /// Validate an already-decoded document.
    pub fn from_document(doc: &Value) -> AppResult<Self> {
        validate_document(doc, None)
    }
}
