//! Session-level errors

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::asset::DecodeError;
use crate::audio::AudioError;
use crate::engine::EngineError;
use crate::track::LoadState;
use crate::types::TrackId;

/// Why a track could not be made playable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MissingFile,
    UnsupportedFormat,
    OutputUnavailable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFile => write!(f, "file not found"),
            Self::UnsupportedFormat => write!(f, "unsupported or unreadable audio"),
            Self::OutputUnavailable => write!(f, "no audio output available"),
        }
    }
}

impl From<&DecodeError> for FailureReason {
    fn from(e: &DecodeError) -> Self {
        if e.is_missing_file() {
            Self::MissingFile
        } else {
            Self::UnsupportedFormat
        }
    }
}

impl From<&AudioError> for FailureReason {
    fn from(_: &AudioError) -> Self {
        Self::OutputUnavailable
    }
}

/// Errors reported by tracks and playback sessions
#[derive(Error, Debug, Clone)]
pub enum PlayerError {
    #[error("Cannot play {path:?}: {reason}")]
    CannotPlay { path: PathBuf, reason: FailureReason },

    #[error("All {capacity} mixer channels are in use")]
    ChannelAllocationExhausted { capacity: usize },

    #[error("No track with id {0}")]
    UnknownTrack(TrackId),

    #[error("{track} cannot {operation} while {state}")]
    InvalidTransition {
        track: TrackId,
        operation: &'static str,
        state: LoadState,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Result type for session and controller operations
pub type PlayerResult<T> = Result<T, PlayerError>;
