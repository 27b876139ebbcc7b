//! Mixer engine error types

use thiserror::Error;

use crate::audio::AudioError;
use crate::types::TrackId;

/// Errors reported by the shared mixer engine
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// The engine's output could not be opened
    #[error("Shared mixer engine unavailable: {0}")]
    EngineUnavailable(AudioError),

    /// Every mixer channel is bound to a track
    #[error("All {capacity} mixer channels are in use")]
    ChannelAllocationExhausted { capacity: usize },

    /// No channel is loaded for the track
    #[error("No channel loaded for {0}")]
    UnknownTrack(TrackId),

    /// The track already has a channel
    #[error("{0} is already loaded")]
    DuplicateTrack(TrackId),

    /// Starting mid-file needs a trimmable representation the asset lacks
    #[error("{track} cannot start at {position_ms}ms: asset has no trimmable representation")]
    NotSeekable { track: TrackId, position_ms: u64 },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
