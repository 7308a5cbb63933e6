//! Custom error types for the protocol engine.
//!
//! This module defines the primary error type, `ExperimentError`, returned by the
//! orchestrator, together with the narrower `CommandError` (one command failed)
//! and `PluginError` (a plugin operation failed) used by the dispatcher and the
//! plugin registry.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: the protocol document is malformed or incomplete. Raised before
//!   any hardware or plugin side effect and never retried.
//! - **`Initialization`**: a plugin or the arena controller could not be brought up.
//!   Always fatal to the run.
//! - **`Command`**: a single controller/wait/plugin command failed its precondition
//!   check or its underlying operation. Carries the phase and the 1-based position of
//!   the failing command so the run log can localise it.
//! - **`CleanupFailed`**: collected teardown failures. These are only ever reported,
//!   never returned from a run.
//!
//! By using `#[from]`, `ExperimentError` can be created from I/O and serialization
//! errors with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, ExperimentError>;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Protocol validation error in '{section}': {message}")]
    Validation { section: String, message: String },

    #[error("Initialization of {component} failed: {message}")]
    Initialization { component: String, message: String },

    #[error("{phase} command {index} failed: {source}")]
    Command {
        phase: String,
        index: usize,
        #[source]
        source: CommandError,
    },

    #[error("Cleanup failed with errors: {}", .0.join("; "))]
    CleanupFailed(Vec<String>),

    #[error("Host environment error: {0}")]
    Environment(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExperimentError {
    /// Shorthand for a validation failure at `section`.
    pub fn validation(section: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            section: section.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an initialization failure of `component`.
    pub fn initialization(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Initialization {
            component: component.into(),
            message: message.into(),
        }
    }

    /// True for errors raised before any side effect took place.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl From<figment::Error> for ExperimentError {
    fn from(value: figment::Error) -> Self {
        Self::Config(Box::new(value))
    }
}

/// Failure of a single command record.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Command is missing required field '{0}'")]
    MissingField(String),

    #[error("Unknown command type '{0}'")]
    UnknownType(String),

    #[error("Unknown controller command '{0}'")]
    UnknownControllerCommand(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidParameter { field: String, reason: String },

    #[error("Controller command '{0}' reported failure")]
    HardwareFailure(String),

    #[error("Controller command '{command}' raised an error: {message}")]
    Hardware { command: String, message: String },

    #[error("Plugin '{0}' is not registered")]
    PluginNotFound(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl CommandError {
    /// Shorthand for an out-of-range or mistyped field.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of a plugin lifecycle or execute call.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin '{0}' is not initialized")]
    NotInitialized(String),

    #[error("Plugin '{plugin}' does not support command '{command}'")]
    UnknownCommand { plugin: String, command: String },

    #[error("Plugin '{plugin}' template for '{command}' expects {expected} value(s), got {actual}")]
    ParameterMismatch {
        plugin: String,
        command: String,
        expected: usize,
        actual: usize,
    },

    #[error("Plugin '{plugin}' parameter error: {message}")]
    Parameter { plugin: String, message: String },

    #[error("Plugin '{plugin}' connection error: {message}")]
    Connection { plugin: String, message: String },

    #[error("Plugin '{plugin}' script error: {message}")]
    Script { plugin: String, message: String },

    #[error("Plugin '{plugin}' class error: {message}")]
    Class { plugin: String, message: String },

    #[error("Invalid definition for plugin '{plugin}': {message}")]
    InvalidDefinition { plugin: String, message: String },

    #[error("Plugin '{0}' is already registered")]
    Duplicate(String),
}
