//! Persisted per-track volume and mute
//!
//! Settings are keyed by the track's display name (file stem), so the same
//! stem keeps its level across sessions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{load_config, save_config};

/// Volume used for tracks with no stored settings
pub const DEFAULT_VOLUME: u8 = 80;

/// Stored level of one track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackVolume {
    /// 0..=100
    pub volume: u8,
    pub muted: bool,
}

impl Default for TrackVolume {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME,
            muted: false,
        }
    }
}

impl TrackVolume {
    pub fn new(volume: u8, muted: bool) -> Self {
        Self {
            volume: volume.min(100),
            muted,
        }
    }

    /// Gain to apply to the backend, 0.0 while muted
    pub fn gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            f32::from(self.volume.min(100)) / 100.0
        }
    }
}

/// Where track volumes are remembered
pub trait VolumeStore: Send + Sync {
    /// Stored settings for `name`, or the defaults
    fn load(&self, name: &str) -> TrackVolume;

    fn save(&self, name: &str, volume: TrackVolume);
}

/// Volume store that forgets everything when dropped
#[derive(Debug, Default)]
pub struct MemoryVolumeStore {
    volumes: Mutex<BTreeMap<String, TrackVolume>>,
}

impl MemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VolumeStore for MemoryVolumeStore {
    fn load(&self, name: &str) -> TrackVolume {
        self.volumes.lock().get(name).copied().unwrap_or_default()
    }

    fn save(&self, name: &str, volume: TrackVolume) {
        self.volumes.lock().insert(name.to_string(), volume);
    }
}

/// Volume store backed by a YAML file
///
/// The whole map is rewritten on every save. A failed write is logged and
/// the in-memory value still applies for the rest of the process.
pub struct YamlVolumeStore {
    path: PathBuf,
    volumes: Mutex<BTreeMap<String, TrackVolume>>,
}

impl YamlVolumeStore {
    /// Open the store at `path`, reading any existing settings
    pub fn open(path: &Path) -> Self {
        let volumes: BTreeMap<String, TrackVolume> = load_config(path);
        log::debug!("Volume store {:?} holds {} tracks", path, volumes.len());
        Self {
            path: path.to_path_buf(),
            volumes: Mutex::new(volumes),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VolumeStore for YamlVolumeStore {
    fn load(&self, name: &str) -> TrackVolume {
        self.volumes.lock().get(name).copied().unwrap_or_default()
    }

    fn save(&self, name: &str, volume: TrackVolume) {
        let mut volumes = self.volumes.lock();
        if volumes.get(name) == Some(&volume) {
            return;
        }
        volumes.insert(name.to_string(), volume);
        if let Err(e) = save_config(&*volumes, &self.path) {
            log::warn!("Failed to persist volume for '{}': {:#}", name, e);
        }
    }
}
