//! Stemsync Core - Synchronized multi-stem playback engine

pub mod asset;
pub mod audio;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod sync;
pub mod track;
pub mod types;

#[cfg(test)]
mod test_support;

pub use error::{FailureReason, PlayerError, PlayerResult};
pub use session::{BackendConfig, PlaybackSession, SessionConfig, SessionEvent, SessionServices};
pub use types::*;
