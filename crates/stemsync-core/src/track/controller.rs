//! Track controller
//!
//! One controller per track of a session. It owns the track's backend
//! (a channel on the shared engine, or an independent player), its load
//! state and its volume.
//!
//! ```text
//! Unloaded ──load_*──▶ Loading ──▶ Ready
//!     ▲                   │
//!     │                   └──────▶ Failed
//!     └────── teardown (from any state)
//! ```
//!
//! Independent loads complete on a loader thread. A generation counter,
//! bumped on every load and teardown, lets a late completion recognise that
//! the controller has moved on and drop its result.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use crate::asset::{display_name, AssetCache, AssetLoader, AudioAsset, DecodeError};
use crate::audio::OutputProvider;
use crate::engine::{EngineError, MixerEngine, TransportState};
use crate::error::{FailureReason, PlayerError, PlayerResult};
use crate::session::SessionEvent;
use crate::types::TrackId;

use super::independent::IndependentPlayer;
use super::settings::{TrackVolume, VolumeStore};

/// Load state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed(FailureReason),
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Which playback path a track uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    SharedEngine,
    Independent,
}

enum Backend {
    Shared(Arc<MixerEngine>),
    Independent(IndependentPlayer),
}

/// Collaborators every controller of a session shares
#[derive(Clone)]
pub struct ControllerContext {
    pub cache: Arc<AssetCache>,
    pub loader: Arc<AssetLoader>,
    pub output: Arc<dyn OutputProvider>,
    pub volumes: Arc<dyn VolumeStore>,
    pub events: Sender<SessionEvent>,
}

struct ControllerInner {
    state: LoadState,
    /// Backend being loaded or in use
    kind: Option<BackendKind>,
    backend: Option<Backend>,
    asset: Option<Arc<AudioAsset>>,
    /// Play requested while loading, with its offset
    pending_play: Option<u64>,
    /// Position a loading track should be cued at without playing
    pending_cue: Option<u64>,
    volume: TrackVolume,
    rate: f64,
    generation: u64,
}

impl ControllerInner {
    fn apply_volume(&mut self, track_id: TrackId) {
        let gain = self.volume.gain();
        match self.backend.as_mut() {
            Some(Backend::Shared(engine)) => {
                if let Err(e) = engine.set_volume(track_id, gain) {
                    log::warn!("Volume change for {} not applied: {}", track_id, e);
                }
            }
            Some(Backend::Independent(player)) => player.set_volume(gain),
            None => {}
        }
    }
}

pub struct TrackController {
    track_id: TrackId,
    path: PathBuf,
    name: String,
    context: ControllerContext,
    inner: Arc<Mutex<ControllerInner>>,
}

impl TrackController {
    pub fn new(track_id: TrackId, path: &Path, context: ControllerContext) -> Self {
        let name = display_name(path);
        let volume = context.volumes.load(&name);
        Self {
            track_id,
            path: path.to_path_buf(),
            name,
            context,
            inner: Arc::new(Mutex::new(ControllerInner {
                state: LoadState::Unloaded,
                kind: None,
                backend: None,
                asset: None,
                pending_play: None,
                pending_cue: None,
                volume,
                rate: 1.0,
                generation: 0,
            })),
        }
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Display name (file stem); volume settings are keyed by it
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoadState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LoadState::Ready
    }

    /// Backend in use, `None` unless loading or ready
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.inner.lock().kind
    }

    pub fn volume(&self) -> TrackVolume {
        self.inner.lock().volume
    }

    /// Start a new load, returning its generation
    fn begin_load(&self, kind: BackendKind, operation: &'static str) -> PlayerResult<u64> {
        let mut inner = self.inner.lock();
        if inner.state != LoadState::Unloaded {
            return Err(PlayerError::InvalidTransition {
                track: self.track_id,
                operation,
                state: inner.state,
            });
        }
        inner.state = LoadState::Loading;
        inner.kind = Some(kind);
        inner.generation += 1;
        Ok(inner.generation)
    }

    /// Decode and bind the track to a channel of `engine`
    ///
    /// Runs synchronously: the asset is fully decoded before the channel
    /// exists. Running out of channels returns the controller to `Unloaded`
    /// so it can be loaded another way.
    pub fn load_shared(&self, engine: Arc<MixerEngine>) -> PlayerResult<()> {
        let generation = self.begin_load(BackendKind::SharedEngine, "load on the shared engine")?;

        // Decode without holding the controller lock
        let decoded = self.context.cache.get_or_load(&self.path);

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            log::debug!("{} torn down during shared load, dropping result", self.track_id);
            return Ok(());
        }

        let asset = match decoded {
            Ok(asset) => asset,
            Err(e) => return Err(self.fail(&mut inner, FailureReason::from(&e), &e)),
        };

        match engine.load_track(self.track_id, Arc::clone(&asset), inner.volume.gain()) {
            Ok(()) => {}
            Err(EngineError::ChannelAllocationExhausted { capacity }) => {
                inner.state = LoadState::Unloaded;
                inner.kind = None;
                return Err(PlayerError::ChannelAllocationExhausted { capacity });
            }
            Err(e) => {
                inner.state = LoadState::Unloaded;
                inner.kind = None;
                return Err(e.into());
            }
        }

        inner.backend = Some(Backend::Shared(Arc::clone(&engine)));
        inner.asset = Some(asset);
        inner.state = LoadState::Ready;
        log::info!("{} '{}' ready on shared engine", self.track_id, self.name);
        self.emit(SessionEvent::TrackReady(self.track_id));

        if let Some(offset) = inner.pending_play.take() {
            engine.play(offset)?;
        }
        Ok(())
    }

    /// Decode in the background and play through an independent output
    ///
    /// Returns as soon as the request is queued. The outcome arrives as a
    /// [`SessionEvent`].
    pub fn load_independent(&self) -> PlayerResult<()> {
        let generation = self.begin_load(BackendKind::Independent, "load an independent player")?;

        let slot = Arc::downgrade(&self.inner);
        let completion = LoadCompletion {
            track_id: self.track_id,
            path: self.path.clone(),
            name: self.name.clone(),
            generation,
            output: Arc::clone(&self.context.output),
            events: self.context.events.clone(),
        };
        self.context
            .loader
            .load(self.path.clone(), Box::new(move |result| completion.finish(slot, result)));
        Ok(())
    }

    fn fail(&self, inner: &mut ControllerInner, reason: FailureReason, cause: &DecodeError) -> PlayerError {
        log::warn!("{} '{}' failed to load: {}", self.track_id, self.name, cause);
        inner.state = LoadState::Failed(reason);
        inner.kind = None;
        if inner.pending_play.take().is_some() {
            log::debug!("Discarding pending play for {}", self.track_id);
        }
        inner.pending_cue = None;
        self.emit(SessionEvent::TrackFailed {
            track: self.track_id,
            reason,
        });
        PlayerError::CannotPlay {
            path: self.path.clone(),
            reason,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.context.events.send(event);
    }

    /// Play from `offset_ms`, or remember the request while loading
    pub fn play(&self, offset_ms: u64) -> PlayerResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            LoadState::Loading => {
                inner.pending_play = Some(offset_ms);
                inner.pending_cue = None;
                Ok(())
            }
            LoadState::Ready => match inner.backend.as_mut() {
                Some(Backend::Shared(engine)) => Ok(engine.play(offset_ms)?),
                Some(Backend::Independent(player)) => {
                    player.play_from(offset_ms);
                    Ok(())
                }
                None => Ok(()),
            },
            state => Err(PlayerError::InvalidTransition {
                track: self.track_id,
                operation: "play",
                state,
            }),
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if let Some(offset) = inner.pending_play.take() {
            inner.pending_cue = Some(offset);
        }
        match inner.backend.as_mut() {
            Some(Backend::Shared(engine)) => engine.pause(),
            Some(Backend::Independent(player)) => player.pause(),
            None => {}
        }
    }

    pub fn resume(&self) -> PlayerResult<()> {
        let mut inner = self.inner.lock();
        if let Some(offset) = inner.pending_cue.take() {
            inner.pending_play = Some(offset);
        }
        match inner.backend.as_mut() {
            Some(Backend::Shared(engine)) => engine.resume()?,
            Some(Backend::Independent(player)) => player.resume(),
            None => {}
        }
        Ok(())
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.pending_play = None;
        inner.pending_cue = None;
        match inner.backend.as_mut() {
            Some(Backend::Shared(engine)) => engine.stop(),
            Some(Backend::Independent(player)) => player.stop(),
            None => {}
        }
    }

    pub fn set_position(&self, position_ms: u64) -> PlayerResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == LoadState::Loading {
            match inner.pending_play.as_mut() {
                Some(offset) => *offset = position_ms,
                None => inner.pending_cue = Some(position_ms),
            }
            return Ok(());
        }
        match inner.backend.as_mut() {
            Some(Backend::Shared(engine)) => engine.set_position(position_ms)?,
            Some(Backend::Independent(player)) => player.set_position(position_ms),
            None => {}
        }
        Ok(())
    }

    /// Current position; while loading, the offset playback will start at
    pub fn get_position(&self) -> u64 {
        let inner = self.inner.lock();
        match inner.backend.as_ref() {
            Some(Backend::Shared(engine)) => engine.get_position(),
            Some(Backend::Independent(player)) => player.position_ms(),
            None => inner.pending_play.or(inner.pending_cue).unwrap_or(0),
        }
    }

    /// Duration of this track's asset (0 until loaded)
    pub fn get_duration(&self) -> u64 {
        self.inner.lock().asset.as_ref().map_or(0, |a| a.duration_ms())
    }

    /// Change the playback rate; only independent players support it
    ///
    /// The rate is remembered and applied when an independent load
    /// completes. Returns whether it took effect.
    pub fn set_playback_rate(&self, rate: f64) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.backend.as_mut() {
            Some(Backend::Shared(_)) => {
                log::debug!("{} is on the shared engine; rate stays at 1.0", self.track_id);
                false
            }
            Some(Backend::Independent(player)) => {
                player.set_rate(rate);
                inner.rate = rate;
                true
            }
            None if inner.state == LoadState::Loading => {
                inner.rate = rate;
                true
            }
            None => false,
        }
    }

    /// Set the volume (0..=100)
    ///
    /// While muted only the remembered level changes.
    pub fn set_volume(&self, volume: u8) {
        let mut inner = self.inner.lock();
        inner.volume.volume = volume.min(100);
        if !inner.volume.muted {
            inner.apply_volume(self.track_id);
        }
        self.persist(&inner);
    }

    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.inner.lock();
        if inner.volume.muted == muted {
            return;
        }
        inner.volume.muted = muted;
        inner.apply_volume(self.track_id);
        self.persist(&inner);
    }

    /// Flip the mute state, returning the new one
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.volume().muted;
        self.set_muted(muted);
        muted
    }

    fn persist(&self, inner: &ControllerInner) {
        self.context.volumes.save(&self.name, inner.volume);
    }

    /// Whether this track has played to its end
    pub fn is_ended(&self) -> bool {
        let inner = self.inner.lock();
        match inner.backend.as_ref() {
            Some(Backend::Shared(engine)) => engine.state() == TransportState::Ended,
            Some(Backend::Independent(player)) => player.is_ended(),
            None => false,
        }
    }

    /// True if the backend is an independent player that is not paused
    pub fn is_playing_independently(&self) -> bool {
        matches!(
            self.inner.lock().backend.as_ref(),
            Some(Backend::Independent(player)) if player.is_playing()
        )
    }

    /// Release the backend and return to `Unloaded`
    ///
    /// Any load still in flight is abandoned.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.pending_play = None;
        inner.pending_cue = None;
        inner.asset = None;
        match inner.backend.take() {
            Some(Backend::Shared(engine)) => {
                if let Err(e) = engine.unload_track(self.track_id) {
                    log::debug!("Teardown of {}: {}", self.track_id, e);
                }
            }
            Some(Backend::Independent(mut player)) => player.stop(),
            None => {}
        }
        if inner.state != LoadState::Unloaded {
            log::debug!("{} torn down from {}", self.track_id, inner.state);
        }
        inner.state = LoadState::Unloaded;
        inner.kind = None;
    }
}

impl Drop for TrackController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Everything a background load needs once the decode finishes
struct LoadCompletion {
    track_id: TrackId,
    path: PathBuf,
    name: String,
    generation: u64,
    output: Arc<dyn OutputProvider>,
    events: Sender<SessionEvent>,
}

impl LoadCompletion {
    fn finish(self, slot: Weak<Mutex<ControllerInner>>, result: Result<Arc<AudioAsset>, DecodeError>) {
        let Some(slot) = slot.upgrade() else {
            log::debug!("{} dropped before its load completed", self.track_id);
            return;
        };
        let mut inner = slot.lock();
        if inner.generation != self.generation || inner.state != LoadState::Loading {
            log::debug!("Discarding stale load of {}", self.track_id);
            return;
        }

        let asset = match result {
            Ok(asset) => asset,
            Err(e) => {
                self.fail(&mut inner, FailureReason::from(&e), &e.to_string());
                return;
            }
        };

        let label = self.track_id.to_string();
        let mut player = match IndependentPlayer::open(self.output.as_ref(), &label, Arc::clone(&asset)) {
            Ok(player) => player,
            Err(e) => {
                self.fail(&mut inner, FailureReason::from(&e), &e.to_string());
                return;
            }
        };
        player.set_volume(inner.volume.gain());
        player.set_rate(inner.rate);
        if let Some(offset) = inner.pending_play.take() {
            player.play_from(offset);
        } else if let Some(position) = inner.pending_cue.take() {
            player.set_position(position);
        }

        inner.backend = Some(Backend::Independent(player));
        inner.asset = Some(asset);
        inner.state = LoadState::Ready;
        log::info!("{} '{}' ready on independent output", self.track_id, self.name);
        let _ = self.events.send(SessionEvent::TrackReady(self.track_id));
    }

    fn fail(&self, inner: &mut ControllerInner, reason: FailureReason, cause: &str) {
        log::warn!("{} '{}' failed to load from {:?}: {}", self.track_id, self.name, self.path, cause);
        inner.state = LoadState::Failed(reason);
        inner.kind = None;
        if inner.pending_play.take().is_some() {
            log::debug!("Discarding pending play for {}", self.track_id);
        }
        inner.pending_cue = None;
        let _ = self.events.send(SessionEvent::TrackFailed {
            track: self.track_id,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;

    fn fixture() -> Harness {
        Harness::new()
    }

    /// Start a load by hand and build the completion a loader would run
    fn begin_manual_load(controller: &TrackController) -> LoadCompletion {
        let generation = controller
            .begin_load(BackendKind::Independent, "test load")
            .unwrap();
        LoadCompletion {
            track_id: controller.track_id,
            path: controller.path.clone(),
            name: controller.name.clone(),
            generation,
            output: Arc::clone(&controller.context.output),
            events: controller.context.events.clone(),
        }
    }

    fn decode(fx: &Harness, name: &str, duration_ms: u64) -> Arc<AudioAsset> {
        let path = fx.wav(name, duration_ms);
        fx.context.cache.get_or_load(&path).unwrap()
    }

    #[test]
    fn test_background_load_reports_ready() {
        let fx = fixture();
        let path = fx.wav("vocals.wav", 3_000);
        let controller = TrackController::new(TrackId(0), &path, fx.context.clone());

        controller.load_independent().unwrap();
        assert_eq!(fx.next_event(), SessionEvent::TrackReady(TrackId(0)));
        assert!(controller.is_ready());
        assert_eq!(controller.backend_kind(), Some(BackendKind::Independent));
        assert_eq!(controller.get_duration(), 3_000);

        controller.play(0).unwrap();
        fx.rig.advance(250);
        assert_eq!(controller.get_position(), 250);
    }

    #[test]
    fn test_pending_play_consumed_on_ready() {
        let fx = fixture();
        let asset = decode(&fx, "vocals.wav", 3_000);
        let controller = TrackController::new(TrackId(0), asset.path(), fx.context.clone());

        let completion = begin_manual_load(&controller);
        controller.play(1_000).unwrap();
        assert_eq!(controller.get_position(), 1_000);

        completion.finish(Arc::downgrade(&controller.inner), Ok(asset));
        assert_eq!(fx.next_event(), SessionEvent::TrackReady(TrackId(0)));
        assert!(controller.is_playing_independently());

        fx.rig.advance(500);
        assert_eq!(controller.get_position(), 1_500);
    }

    #[test]
    fn test_pending_play_discarded_on_failure() {
        let fx = fixture();
        let path = fx.dir.path().join("not-audio.ogg");
        std::fs::write(&path, b"garbage").unwrap();
        let controller = TrackController::new(TrackId(1), &path, fx.context.clone());

        let completion = begin_manual_load(&controller);
        controller.play(0).unwrap();
        let error = fx.context.cache.get_or_load(&path).unwrap_err();
        completion.finish(Arc::downgrade(&controller.inner), Err(error));

        assert_eq!(
            fx.next_event(),
            SessionEvent::TrackFailed {
                track: TrackId(1),
                reason: FailureReason::UnsupportedFormat
            }
        );
        assert_eq!(controller.state(), LoadState::Failed(FailureReason::UnsupportedFormat));
        assert_eq!(controller.get_position(), 0);
        assert!(matches!(
            controller.play(0),
            Err(PlayerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_teardown_discards_late_completion() {
        let fx = fixture();
        let asset = decode(&fx, "bass.wav", 2_000);
        let controller = TrackController::new(TrackId(4), asset.path(), fx.context.clone());

        let completion = begin_manual_load(&controller);
        controller.play(0).unwrap();
        controller.teardown();
        completion.finish(Arc::downgrade(&controller.inner), Ok(asset));

        assert_eq!(controller.state(), LoadState::Unloaded);
        assert_eq!(controller.backend_kind(), None);
        assert!(fx.events.try_recv().is_err());
        assert_eq!(fx.rig.output.open_outputs(), 0);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let fx = fixture();
        let path = fx.wav("drums.wav", 500);
        let controller = TrackController::new(TrackId(2), &path, fx.context.clone());

        assert!(matches!(
            controller.play(0),
            Err(PlayerError::InvalidTransition {
                state: LoadState::Unloaded,
                ..
            })
        ));

        let engine = fx.engine();
        controller.load_shared(Arc::clone(&engine)).unwrap();
        assert!(controller.load_independent().is_err());

        controller.teardown();
        assert_eq!(controller.state(), LoadState::Unloaded);
        assert_eq!(engine.channel_count(), 0);
        controller.load_shared(engine).unwrap();
        assert_eq!(controller.backend_kind(), Some(BackendKind::SharedEngine));
    }

    #[test]
    fn test_shared_load_failure_surfaces_reason() {
        let fx = fixture();
        let engine = fx.engine();
        let controller = TrackController::new(TrackId(3), &fx.dir.path().join("gone.wav"), fx.context.clone());

        let err = controller.load_shared(engine).unwrap_err();
        assert!(matches!(
            err,
            PlayerError::CannotPlay {
                reason: FailureReason::MissingFile,
                ..
            }
        ));
        assert_eq!(controller.state(), LoadState::Failed(FailureReason::MissingFile));
    }

    #[test]
    fn test_mute_remembers_level() {
        let fx = fixture();
        let path = fx.wav("other.wav", 500);
        let engine = fx.engine();
        let controller = TrackController::new(TrackId(5), &path, fx.context.clone());
        controller.load_shared(Arc::clone(&engine)).unwrap();
        assert_eq!(engine.volume(TrackId(5)), Some(0.8));

        assert!(controller.toggle_mute());
        assert_eq!(engine.volume(TrackId(5)), Some(0.0));

        controller.set_volume(50);
        assert_eq!(engine.volume(TrackId(5)), Some(0.0));

        assert!(!controller.toggle_mute());
        assert_eq!(engine.volume(TrackId(5)), Some(0.5));
        assert_eq!(fx.volumes.load("other"), TrackVolume::new(50, false));
    }

    #[test]
    fn test_rate_only_applies_to_independent() {
        let fx = fixture();
        let path = fx.wav("vocals.wav", 500);
        let engine = fx.engine();
        let controller = TrackController::new(TrackId(6), &path, fx.context.clone());

        controller.load_shared(Arc::clone(&engine)).unwrap();
        assert!(!controller.set_playback_rate(1.25));

        controller.teardown();
        controller.load_independent().unwrap();
        assert!(controller.set_playback_rate(1.25));
    }
}
