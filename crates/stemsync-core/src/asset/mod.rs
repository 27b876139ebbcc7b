//! Decoded audio assets
//!
//! An [`AudioAsset`] is one stem file decoded into memory. Assets are
//! immutable once loaded (apart from the last-used timestamp), owned by the
//! [`AssetCache`] and shared read-only by every channel and player that plays
//! them.

mod cache;
mod decoder;
mod loader;

use std::path::{Path, PathBuf};
use std::time::Instant;

use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};

use crate::types::PcmBuffer;

pub use cache::{AssetCache, CacheStats};
pub use decoder::{decode_file, DecodeError, DecodeOptions, DecodePath, DecodedAudio, TrimmableSamples};
pub use loader::{AssetLoader, LoadCallback};

/// Decoding and loader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Keep a representation that can start mid-file when the length is exact
    pub keep_trimmable: bool,
    /// Background loader threads
    pub loader_workers: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            keep_trimmable: true,
            loader_workers: 2,
        }
    }
}

impl DecoderConfig {
    /// Decode options producing audio at `target_sample_rate`
    pub fn options(&self, target_sample_rate: u32) -> DecodeOptions {
        DecodeOptions {
            target_sample_rate,
            keep_trimmable: self.keep_trimmable,
        }
    }
}

/// One decoded stem
pub struct AudioAsset {
    path: PathBuf,
    playback: PcmBuffer,
    trimmable: Option<TrimmableSamples>,
    decode_path: DecodePath,
    duration_ms: u64,
    size_bytes: u64,
    loaded_at: Instant,
    last_used: AtomicCell<Instant>,
}

impl AudioAsset {
    pub fn from_decoded(path: &Path, decoded: DecodedAudio, size_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            path: path.to_path_buf(),
            duration_ms: decoded.playback.duration_ms(),
            playback: decoded.playback,
            trimmable: decoded.trimmable,
            decode_path: decoded.path,
            size_bytes,
            loaded_at: now,
            last_used: AtomicCell::new(now),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full decoded buffer, starting at the beginning of the file
    pub fn playback(&self) -> &PcmBuffer {
        &self.playback
    }

    pub fn trimmable(&self) -> Option<&TrimmableSamples> {
        self.trimmable.as_ref()
    }

    /// True when playback can start at an arbitrary offset
    pub fn is_trimmable(&self) -> bool {
        self.trimmable.is_some()
    }

    /// Buffer starting `position_ms` into the asset
    ///
    /// `None` when the position is non-zero and the asset has no trimmable
    /// representation.
    pub fn buffer_from(&self, position_ms: u64) -> Option<PcmBuffer> {
        if position_ms == 0 {
            return Some(self.playback.clone());
        }
        self.trimmable.as_ref().map(|t| t.from_position(position_ms))
    }

    pub fn decode_path(&self) -> DecodePath {
        self.decode_path
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Size of the source file on disk
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used.load()
    }

    /// Mark the asset as used now
    pub fn touch(&self) {
        self.last_used.store(Instant::now());
    }
}

impl std::fmt::Debug for AudioAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioAsset")
            .field("path", &self.path)
            .field("duration_ms", &self.duration_ms)
            .field("trimmable", &self.is_trimmable())
            .field("decode_path", &self.decode_path)
            .finish()
    }
}

/// Display name of a stem file (its file stem)
///
/// Per-track settings are keyed by this name.
pub fn display_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_sine_wav;

    #[test]
    fn test_buffer_from_requires_trimmable_for_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "other.wav", 1000, 48_000);
        let mut decoded = decode_file(
            &path,
            &DecodeOptions {
                target_sample_rate: 48_000,
                keep_trimmable: true,
            },
        )
        .unwrap();

        let asset = AudioAsset::from_decoded(&path, decoded.clone(), 0);
        assert_eq!(asset.buffer_from(400).unwrap().duration_ms(), 600);

        decoded.trimmable = None;
        let asset = AudioAsset::from_decoded(&path, decoded, 0);
        assert!(asset.buffer_from(400).is_none());
        assert_eq!(asset.buffer_from(0).unwrap().duration_ms(), 1000);
    }

    #[test]
    fn test_display_name_is_file_stem() {
        assert_eq!(display_name(Path::new("/music/song/vocals.wav")), "vocals");
        assert_eq!(display_name(Path::new("drums")), "drums");
    }
}
