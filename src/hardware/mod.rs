//! LED arena hardware access.

pub mod controller;
pub mod mock;
pub mod tcp;

pub use controller::{controller_from_config, ArenaController, TrialStart};
pub use mock::{ArenaCall, MockArena};
pub use tcp::TcpArena;
