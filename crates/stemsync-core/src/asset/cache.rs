//! Shared decoded-asset cache
//!
//! Maps a file path to its decoded [`AudioAsset`]. Concurrent requests for
//! the same path decode once: the first caller decodes outside the lock while
//! later callers block on the in-flight slot and receive the same result.
//! Failed decodes are never registered, so a later request retries.
//!
//! Eviction policy lives outside this type; [`AssetCache::evict`],
//! [`AssetCache::clear`] and [`AssetCache::stats`] are the hooks for it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::decoder::{decode_file, DecodeError, DecodeOptions};
use super::AudioAsset;

type LoadResult = Result<Arc<AudioAsset>, DecodeError>;

/// A decode in progress that other callers can wait on
struct InFlight {
    result: Mutex<Option<LoadResult>>,
    done: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, result: LoadResult) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> LoadResult {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut result);
        }
    }
}

enum Slot {
    Ready(Arc<AudioAsset>),
    Loading(Arc<InFlight>),
}

enum Lookup {
    Hit(Arc<AudioAsset>),
    Wait(Arc<InFlight>),
    Load(Arc<InFlight>),
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Fully decoded assets
    pub entries: usize,
    /// Decodes currently in flight
    pub loading: usize,
    /// Decoded PCM held by the cache
    pub total_bytes: u64,
}

/// Path-keyed cache of decoded assets
pub struct AssetCache {
    options: DecodeOptions,
    entries: Mutex<HashMap<PathBuf, Slot>>,
}

impl AssetCache {
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Sample rate every cached asset is decoded to
    pub fn sample_rate(&self) -> u32 {
        self.options.target_sample_rate
    }

    /// Return the cached asset for `path`, decoding it on first use
    ///
    /// Blocks while the file decodes (or while another caller decodes it).
    pub fn get_or_load(&self, path: &Path) -> Result<Arc<AudioAsset>, DecodeError> {
        let lookup = {
            let mut entries = self.entries.lock();
            match entries.get(path) {
                Some(Slot::Ready(asset)) => Lookup::Hit(Arc::clone(asset)),
                Some(Slot::Loading(flight)) => Lookup::Wait(Arc::clone(flight)),
                None => {
                    let flight = Arc::new(InFlight::new());
                    entries.insert(path.to_path_buf(), Slot::Loading(Arc::clone(&flight)));
                    Lookup::Load(flight)
                }
            }
        };

        match lookup {
            Lookup::Hit(asset) => {
                asset.touch();
                Ok(asset)
            }
            Lookup::Wait(flight) => {
                log::debug!("Waiting for in-flight decode of {:?}", path);
                let result = flight.wait();
                if let Ok(asset) = &result {
                    asset.touch();
                }
                result
            }
            Lookup::Load(flight) => {
                let mut guard = LoadGuard {
                    cache: self,
                    path,
                    flight,
                    finished: false,
                };
                let result = self.decode(path);
                guard.finish(result.clone());
                result
            }
        }
    }

    fn decode(&self, path: &Path) -> LoadResult {
        let started = std::time::Instant::now();
        let decoded = decode_file(path, &self.options)?;
        let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let asset = Arc::new(AudioAsset::from_decoded(path, decoded, size_bytes));
        log::info!(
            "[PERF] Decoded {:?}: {}ms of audio ({:?} path, trimmable: {}) in {:?}",
            path,
            asset.duration_ms(),
            asset.decode_path(),
            asset.is_trimmable(),
            started.elapsed()
        );
        Ok(asset)
    }

    /// Cached asset for `path` without triggering a decode
    pub fn get(&self, path: &Path) -> Option<Arc<AudioAsset>> {
        match self.entries.lock().get(path) {
            Some(Slot::Ready(asset)) => {
                asset.touch();
                Some(Arc::clone(asset))
            }
            _ => None,
        }
    }

    /// True if a decoded asset for `path` is cached
    pub fn contains(&self, path: &Path) -> bool {
        matches!(self.entries.lock().get(path), Some(Slot::Ready(_)))
    }

    /// Drop the cached asset for `path`
    ///
    /// Channels still holding the asset keep it alive until they release it.
    /// In-flight decodes are not affected.
    pub fn evict(&self, path: &Path) -> bool {
        let mut entries = self.entries.lock();
        if matches!(entries.get(path), Some(Slot::Ready(_))) {
            entries.remove(path);
            log::debug!("Evicted {:?} from asset cache", path);
            true
        } else {
            false
        }
    }

    /// Drop every decoded asset (in-flight decodes finish normally)
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, slot| matches!(slot, Slot::Loading(_)));
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        entries.values().fold(CacheStats::default(), |mut stats, slot| {
            match slot {
                Slot::Ready(asset) => {
                    stats.entries += 1;
                    stats.total_bytes += asset.playback().size_bytes() as u64;
                }
                Slot::Loading(_) => stats.loading += 1,
            }
            stats
        })
    }
}

/// Publishes the decode result, even if the decoder unwinds
struct LoadGuard<'a> {
    cache: &'a AssetCache,
    path: &'a Path,
    flight: Arc<InFlight>,
    finished: bool,
}

impl LoadGuard<'_> {
    fn finish(&mut self, result: LoadResult) {
        {
            let mut entries = self.cache.entries.lock();
            match &result {
                Ok(asset) => {
                    entries.insert(self.path.to_path_buf(), Slot::Ready(Arc::clone(asset)));
                }
                Err(_) => {
                    entries.remove(self.path);
                }
            }
        }
        self.flight.complete(result);
        self.finished = true;
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let path = self.path.to_path_buf();
            self.finish(Err(DecodeError::Corrupt {
                path,
                message: "decoder aborted".to_string(),
            }));
        }
    }
}
