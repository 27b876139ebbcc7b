//! Player configuration for stemsync-player
//!
//! Configuration is stored as YAML in the user's config directory.
//! Default location: ~/.config/stemsync/config.yaml

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use stemsync_core::asset::DecoderConfig;
use stemsync_core::audio::AudioConfig;
use stemsync_core::config::{default_volumes_path, load_config};
use stemsync_core::engine::MixerConfig;
use stemsync_core::sync::SyncConfig;
use stemsync_core::{BackendConfig, SessionConfig};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Output device, buffer size and sample rate
    pub audio: AudioConfig,
    /// Shared engine channel budget and end threshold
    pub mixer: MixerConfig,
    /// Drift correction and end detection
    pub sync: SyncConfig,
    /// Shared engine vs independent players
    pub backend: BackendConfig,
    /// Decoding and background loading
    pub decoder: DecoderConfig,
    /// Where per-track volumes are kept
    /// Default: ~/.config/stemsync/volumes.yaml
    pub volumes_path: Option<PathBuf>,
}

impl PlayerConfig {
    pub fn volumes_path(&self) -> PathBuf {
        self.volumes_path.clone().unwrap_or_else(default_volumes_path)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            sync: self.sync.clone(),
            backend: self.backend.clone(),
        }
    }
}

/// Load the player configuration, logging the settings that matter most
pub fn load(path: &Path) -> PlayerConfig {
    let config: PlayerConfig = load_config(path);
    log::info!(
        "Config: {} mixer channels, correction every {}ms (tolerance {}ms), single track {}",
        config.mixer.max_channels,
        config.sync.correction_interval_ms,
        config.sync.tolerance_ms,
        if config.backend.prefer_independent_for_single_track {
            "independent"
        } else {
            "on engine"
        }
    );
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use stemsync_core::audio::{BufferSize, DeviceId};
    use stemsync_core::config::save_config;

    #[test]
    fn test_default_config() {
        let config = PlayerConfig::default();
        assert_eq!(config.mixer.max_channels, 32);
        assert_eq!(config.sync.correction_interval_ms, 500);
        assert_eq!(config.sync.tolerance_ms, 300);
        assert_eq!(config.sync.end_poll_interval_ms, 200);
        assert!(config.backend.prefer_independent_for_single_track);
        assert_eq!(config.decoder.loader_workers, 2);
        assert!(config.volumes_path().ends_with("volumes.yaml"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = PlayerConfig::default();
        config.audio = config
            .audio
            .with_device(DeviceId::with_host("USB Audio", "ALSA"))
            .with_buffer_size(BufferSize::Fixed(256));
        config.sync.tolerance_ms = 150;
        config.backend.prefer_independent_for_single_track = false;
        config.volumes_path = Some(dir.path().join("levels.yaml"));

        save_config(&config, &path).unwrap();
        assert_eq!(load(&path), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "sync:\n  tolerance_ms: 100\n").unwrap();

        let config = load(&path);
        assert_eq!(config.sync.tolerance_ms, 100);
        assert_eq!(config.sync.correction_interval_ms, 500);
        assert_eq!(config.mixer, MixerConfig::default());
    }
}
