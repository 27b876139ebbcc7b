//! Audio output error types

use thiserror::Error;

/// Errors that can occur while opening or driving an audio output
#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("No audio output devices found")]
    NoDevices,

    #[error("Failed to get default audio device: {0}")]
    NoDefaultDevice(String),

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// No usable stream configuration for the device
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// Device only offers sample formats the mixer cannot write
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// The output thread went away before reporting its stream state
    #[error("Audio output thread exited: {0}")]
    ThreadError(String),

    /// Every voice on the output is already bound to a track
    #[error("All {capacity} output voices are in use")]
    ChannelAllocationExhausted { capacity: usize },
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
