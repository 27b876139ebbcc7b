//! Shared mixer engine
//!
//! One output, N channels, one transport. All channels of a session start,
//! pause, resume and seek together, and the transport position is derived
//! from the monotonic clock rather than from the audio device.

mod channel;
mod error;
mod mixer;
mod transport;

pub use channel::Channel;
pub use error::{EngineError, EngineResult};
pub use mixer::{MixerConfig, MixerEngine, ENGINE_OUTPUT_LABEL};
pub use transport::{TransportSnapshot, TransportState};
