//! Per-track playback
//!
//! A [`TrackController`] drives one track on whichever backend the session
//! picked for it and owns the track's persisted volume.

mod controller;
mod independent;
mod settings;

pub use controller::{BackendKind, ControllerContext, LoadState, TrackController};
pub use independent::IndependentPlayer;
pub use settings::{MemoryVolumeStore, TrackVolume, VolumeStore, YamlVolumeStore, DEFAULT_VOLUME};
