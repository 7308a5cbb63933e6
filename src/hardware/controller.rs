//! Arena controller interface
//!
//! The dispatcher drives the LED arena through this narrow trait. Implementations
//! own their connection and use interior mutability, so the controller is shared
//! as `Arc<dyn ArenaController>` and every method takes `&self`.
//!
//! Display operations return `Ok(false)` when the controller answered but refused
//! the command, and `Err` when it could not be reached at all. The dispatcher
//! treats both as a failed command.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::hardware::{mock::MockArena, tcp::TcpArena};

pub use crate::protocol::ArenaGeneration;

/// Generations the controller can drive. G3 protocols validate but cannot run.
pub const DRIVABLE_GENERATIONS: [ArenaGeneration; 3] = [
    ArenaGeneration::G4,
    ArenaGeneration::G41,
    ArenaGeneration::G6,
];

/// Parameters of the unified trial-start operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialStart {
    /// Display mode: 2 = constant rate, 3 = position stream, 4 = closed loop
    pub mode: u8,
    pub pattern_id: u16,
    pub frame_rate: i16,
    pub frame_index: u16,
    pub gain: i16,
    /// Trial duration in deciseconds
    pub duration_units: u32,
    /// Block until the controller reports the trial finished
    pub wait_for_completion: bool,
}

#[async_trait]
pub trait ArenaController: Send + Sync {
    /// Short identifier for logs (e.g. "mock", "tcp://10.0.0.2:62222")
    fn describe(&self) -> String;

    /// Establish the connection for an arena of `generation`.
    async fn open(&self, generation: ArenaGeneration) -> Result<()>;

    /// Stop the display and release the connection. Safe to call twice.
    async fn close(&self) -> Result<()>;

    async fn all_on(&self) -> Result<bool>;

    async fn all_off(&self) -> Result<bool>;

    async fn stop_display(&self) -> Result<bool>;

    async fn set_position_x(&self, x: u16) -> Result<()>;

    async fn set_color_depth(&self, depth: u8) -> Result<()>;

    async fn start_trial(&self, trial: TrialStart) -> Result<bool>;
}

/// Check that the controller can drive `generation`.
pub fn ensure_drivable(generation: ArenaGeneration) -> Result<()> {
    if DRIVABLE_GENERATIONS.contains(&generation) {
        Ok(())
    } else {
        anyhow::bail!(
            "arena generation {} is not supported by the controller (supported: G4, G4.1, G6)",
            generation
        )
    }
}

/// Build the controller selected by `config.arena.address`.
///
/// `mock` selects the in-memory [`MockArena`]; anything else is treated as the
/// `host:port` of a network controller.
pub fn controller_from_config(config: &EngineConfig) -> Arc<dyn ArenaController> {
    if config.uses_mock_arena() {
        Arc::new(MockArena::new())
    } else {
        Arc::new(TcpArena::new(
            config.arena.address.clone(),
            config.arena.timeout_ms,
            config.arena.command_set.clone(),
        ))
    }
}
