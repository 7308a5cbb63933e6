//! Console tracing for the `arena_protocol` binary
//!
//! Installs a single `tracing-subscriber` fmt layer on top of an `EnvFilter`.
//! `RUST_LOG` wins over the level from [`EngineConfig`], and a second [`init`]
//! keeps whichever subscriber is already installed. With phase timings on, the
//! orchestrator's `run` and per-phase spans report their duration when they close.
//!
//! The durable per-run log file is separate; see [`crate::run_log`].

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::EngineConfig;

/// Console output format, selected with `--log-format`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Report run and phase span durations on close
    pub phase_timings: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::default(),
            phase_timings: false,
        }
    }
}

impl TracingConfig {
    /// Console settings for an engine configuration
    pub fn from_engine_config(config: &EngineConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.log_level)?,
            ..Default::default()
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_phase_timings(mut self, enabled: bool) -> Self {
        self.phase_timings = enabled;
        self
    }
}

/// Install the global subscriber. Ok(()) without changes if one is already set.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(config.level).into())
    });
    let span_events = if config.phase_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer().pretty().with_span_events(span_events).boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_span_events(span_events)
            .boxed(),
        OutputFormat::Json => fmt::layer().json().with_span_events(span_events).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Lost a race for the global subscriber
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

/// Parse a case-insensitive level name
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn log_format_values_match_the_cli() {
        assert_eq!(OutputFormat::from_str("json", true), Ok(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("PRETTY", true), Ok(OutputFormat::Pretty));
        assert!(OutputFormat::from_str("xml", true).is_err());
        assert_eq!(OutputFormat::default(), OutputFormat::Compact);
    }

    #[test]
    fn engine_level_carries_over() {
        let config = EngineConfig {
            log_level: "debug".to_string(),
            ..Default::default()
        };
        let tracing_config = TracingConfig::from_engine_config(&config)
            .unwrap()
            .with_phase_timings(true);
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert!(tracing_config.phase_timings);
        assert_eq!(tracing_config.format, OutputFormat::Compact);
    }

    #[test]
    fn init_is_idempotent() {
        assert!(init(TracingConfig::default()).is_ok());
        assert!(init(TracingConfig::default().with_format(OutputFormat::Json)).is_ok());
    }
}
