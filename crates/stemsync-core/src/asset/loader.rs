//! Background asset loader
//!
//! Moves decoding off the scheduling loop. A small pool of worker threads
//! pulls requests from a shared queue, decodes through the [`AssetCache`]
//! (so duplicate requests still decode once) and hands the result to the
//! request's completion callback on the worker thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use super::cache::AssetCache;
use super::decoder::DecodeError;
use super::AudioAsset;

/// Completion callback for a background load (runs on a loader thread)
pub type LoadCallback = Box<dyn FnOnce(Result<Arc<AudioAsset>, DecodeError>) + Send + 'static>;

enum LoaderRequest {
    Load { path: PathBuf, on_complete: LoadCallback },
    Preload { path: PathBuf },
}

/// Handle to the loader worker pool
///
/// Dropping the handle lets queued requests finish, then joins the workers.
pub struct AssetLoader {
    tx: Option<Sender<LoaderRequest>>,
    workers: Vec<JoinHandle<()>>,
}

impl AssetLoader {
    /// Spawn `workers` loader threads decoding into `cache`
    pub fn spawn(cache: Arc<AssetCache>, workers: usize) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded::<LoaderRequest>();

        let workers = (0..workers.max(1))
            .map(|index| {
                let rx = rx.clone();
                let cache = Arc::clone(&cache);
                thread::Builder::new()
                    .name(format!("asset-loader-{}", index))
                    .spawn(move || loader_thread(rx, cache))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        log::info!("AssetLoader spawned with {} workers", workers.len());

        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    /// Decode `path` in the background and call `on_complete` with the result
    pub fn load(&self, path: PathBuf, on_complete: LoadCallback) {
        self.submit(LoaderRequest::Load { path, on_complete });
    }

    /// Warm the cache with `path` without waiting for the result
    pub fn preload(&self, path: PathBuf) {
        self.submit(LoaderRequest::Preload { path });
    }

    fn submit(&self, request: LoaderRequest) {
        let rejected = match &self.tx {
            Some(tx) => tx.send(request).err().map(|e| e.into_inner()),
            None => Some(request),
        };

        // Workers are gone; fail the request instead of leaving it hanging
        if let Some(request) = rejected {
            if let LoaderRequest::Load { path, on_complete } = request {
                log::error!("Asset loader stopped, cannot load {:?}", path);
                on_complete(Err(DecodeError::Io {
                    path,
                    message: "asset loader is not running".to_string(),
                }));
            }
        }
    }
}

impl Drop for AssetLoader {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Asset loader thread panicked");
            }
        }
    }
}

fn loader_thread(rx: Receiver<LoaderRequest>, cache: Arc<AssetCache>) {
    while let Ok(request) = rx.recv() {
        match request {
            LoaderRequest::Load { path, on_complete } => {
                let result = cache.get_or_load(&path);
                if let Err(e) = &result {
                    log::warn!("Background load failed: {}", e);
                }
                on_complete(result);
            }
            LoaderRequest::Preload { path } => match cache.get_or_load(&path) {
                Ok(asset) => log::debug!("Preloaded {:?} ({}ms)", path, asset.duration_ms()),
                Err(e) => log::warn!("Preload failed: {}", e),
            },
        }
    }
    log::debug!("Asset loader thread exiting");
}
