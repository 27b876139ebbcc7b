//! Playback session
//!
//! The application-facing entry point. A session owns the tracks that play
//! together, decides which backend each one uses and forwards transport
//! operations to the [`SyncManager`].
//!
//! Backend policy: tracks share the mixer engine when it is available and
//! more than one track plays. A lone track uses an independent player unless
//! `prefer_independent_for_single_track` is off. Adding a second track to a
//! lone independent one moves both onto the engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver};
use serde::{Deserialize, Serialize};

use crate::asset::{AssetCache, AssetLoader};
use crate::audio::OutputProvider;
use crate::clock::Clock;
use crate::engine::MixerEngine;
use crate::error::{FailureReason, PlayerError, PlayerResult};
use crate::sync::{GroupState, SyncConfig, SyncManager, TickOutcome};
use crate::track::{BackendKind, ControllerContext, LoadState, TrackController, TrackVolume, VolumeStore};
use crate::types::TrackId;

/// Notifications from a session, delivered on [`PlaybackSession::events`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    TrackReady(TrackId),
    TrackFailed { track: TrackId, reason: FailureReason },
    /// Every track played to its end
    PlaybackEnded,
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Play a lone track through its own output instead of the engine
    pub prefer_independent_for_single_track: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            prefer_independent_for_single_track: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub sync: SyncConfig,
    pub backend: BackendConfig,
}

/// Long-lived collaborators a session plays through
pub struct SessionServices {
    /// `None` when the shared engine could not start
    pub engine: Option<Arc<MixerEngine>>,
    pub cache: Arc<AssetCache>,
    pub loader: Arc<AssetLoader>,
    pub output: Arc<dyn OutputProvider>,
    pub volumes: Arc<dyn VolumeStore>,
    pub clock: Arc<dyn Clock>,
}

pub struct PlaybackSession {
    backend: BackendConfig,
    engine: Option<Arc<MixerEngine>>,
    context: ControllerContext,
    manager: SyncManager,
    events: Receiver<SessionEvent>,
    next_id: u32,
}

impl PlaybackSession {
    pub fn new(config: SessionConfig, services: SessionServices) -> Self {
        let (tx, events) = channel::unbounded();
        if services.engine.is_none() {
            log::warn!("Shared mixer engine unavailable; every track will use its own output");
        }
        let context = ControllerContext {
            cache: services.cache,
            loader: services.loader,
            output: services.output,
            volumes: services.volumes,
            events: tx,
        };
        Self {
            backend: config.backend,
            manager: SyncManager::new(config.sync, services.clock, services.engine.clone()),
            engine: services.engine,
            context,
            events,
            next_id: 0,
        }
    }

    pub fn engine_available(&self) -> bool {
        self.engine.is_some()
    }

    /// Session notifications (every clone receives a share of the stream)
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events.clone()
    }

    /// Callback fired once when playback ends naturally (re-armed by `play`)
    pub fn on_end<F>(&mut self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.manager.set_end_callback(Box::new(callback));
    }

    /// Warm the cache with `path` in the background
    pub fn preload(&self, path: impl Into<PathBuf>) {
        self.context.loader.preload(path.into());
    }

    fn backend_for(&self, tracks: usize) -> BackendKind {
        match self.engine {
            Some(_) if tracks > 1 || !self.backend.prefer_independent_for_single_track => BackendKind::SharedEngine,
            _ => BackendKind::Independent,
        }
    }

    /// Add a track to the session
    ///
    /// Fails up front when the file does not exist or the engine has no
    /// channel left for it. Decode failures are reported through
    /// [`SessionEvent::TrackFailed`] and [`Self::track_state`].
    pub fn add_track(&mut self, path: impl AsRef<Path>) -> PlayerResult<TrackId> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PlayerError::CannotPlay {
                path: path.to_path_buf(),
                reason: FailureReason::MissingFile,
            });
        }

        let kind = self.backend_for(self.manager.len() + 1);
        if let (BackendKind::SharedEngine, Some(engine)) = (kind, self.engine.as_ref()) {
            let needed = 1 + self
                .manager
                .controllers()
                .iter()
                .filter(|c| c.backend_kind() == Some(BackendKind::Independent))
                .count();
            if engine.available_channels() < needed {
                return Err(PlayerError::ChannelAllocationExhausted {
                    capacity: engine.capacity(),
                });
            }
        }

        self.migrate(kind);

        let track_id = TrackId(self.next_id);
        self.next_id += 1;
        let controller = TrackController::new(track_id, path, self.context.clone());
        log::info!("Adding {} '{}' ({:?})", track_id, controller.name(), kind);
        if let Err(e) = self.load(&controller, kind) {
            log::warn!("Refusing {} '{}': {}", track_id, controller.name(), e);
            return Err(e);
        }
        self.manager.add(controller);
        Ok(track_id)
    }

    /// Load `controller` on `kind`
    ///
    /// Only a full engine is an error here. Decode failures are recorded on
    /// the controller and sent as events.
    fn load(&self, controller: &TrackController, kind: BackendKind) -> PlayerResult<()> {
        let result = match (kind, self.engine.as_ref()) {
            (BackendKind::SharedEngine, Some(engine)) => controller.load_shared(Arc::clone(engine)),
            _ => controller.load_independent(),
        };
        match result {
            Err(e @ PlayerError::ChannelAllocationExhausted { .. }) => Err(e),
            Err(e) => {
                log::debug!("Load of {} did not complete: {}", controller.track_id(), e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Move existing tracks onto `kind`, keeping the transport where it is
    fn migrate(&mut self, kind: BackendKind) {
        let movers: Vec<TrackId> = self
            .manager
            .controllers()
            .iter()
            .filter(|c| matches!(c.backend_kind(), Some(current) if current != kind))
            .map(TrackController::track_id)
            .collect();
        if movers.is_empty() {
            return;
        }

        let state = self.manager.state();
        let position_ms = self.manager.position_ms();
        for track_id in movers {
            if let Some(controller) = self.manager.controller(track_id) {
                log::info!("Moving {} to {:?}", track_id, kind);
                controller.teardown();
                if let Err(e) = self.load(controller, kind) {
                    log::warn!("{} left unloaded: {}", track_id, e);
                }
            }
        }

        let restored = match state {
            GroupState::Playing => self.manager.play_all(position_ms),
            GroupState::Paused => self.manager.seek_all(position_ms),
            GroupState::Idle | GroupState::Ended => Ok(()),
        };
        if let Err(e) = restored {
            log::warn!("Could not restore transport after backend change: {}", e);
        }
    }

    pub fn play(&mut self, position_ms: u64) -> PlayerResult<()> {
        self.manager.play_all(position_ms)
    }

    pub fn pause(&mut self) {
        self.manager.pause_all();
    }

    pub fn resume(&mut self) -> PlayerResult<()> {
        self.manager.resume_all()
    }

    pub fn stop(&mut self) {
        self.manager.stop_all();
    }

    pub fn seek(&mut self, position_ms: u64) -> PlayerResult<()> {
        self.manager.seek_all(position_ms)
    }

    fn controller(&self, track_id: TrackId) -> PlayerResult<&TrackController> {
        self.manager
            .controller(track_id)
            .ok_or(PlayerError::UnknownTrack(track_id))
    }

    /// Set a track's volume (0..=100)
    pub fn set_volume(&self, track_id: TrackId, volume: u8) -> PlayerResult<()> {
        self.controller(track_id)?.set_volume(volume);
        Ok(())
    }

    pub fn set_muted(&self, track_id: TrackId, muted: bool) -> PlayerResult<()> {
        self.controller(track_id)?.set_muted(muted);
        Ok(())
    }

    /// Flip a track's mute state, returning the new one
    pub fn toggle_mute(&self, track_id: TrackId) -> PlayerResult<bool> {
        Ok(self.controller(track_id)?.toggle_mute())
    }

    pub fn track_volume(&self, track_id: TrackId) -> Option<TrackVolume> {
        self.manager.controller(track_id).map(TrackController::volume)
    }

    /// Change the playback rate of every track; returns whether it applied
    pub fn set_playback_rate(&mut self, rate: f64) -> bool {
        self.manager.set_playback_rate_all(rate)
    }

    pub fn remove_track(&mut self, track_id: TrackId) -> PlayerResult<()> {
        if self.manager.remove(track_id) {
            log::info!("Removed {}", track_id);
            Ok(())
        } else {
            Err(PlayerError::UnknownTrack(track_id))
        }
    }

    /// Tear down every track
    pub fn clear(&mut self) {
        self.manager.clear();
    }

    pub fn get_position_ms(&self) -> u64 {
        self.manager.position_ms()
    }

    pub fn get_duration_ms(&self) -> u64 {
        self.manager.duration_ms()
    }

    /// Largest drift between independent tracks and the reference track
    pub fn max_divergence_ms(&self) -> u64 {
        self.manager.max_divergence_ms()
    }

    pub fn state(&self) -> GroupState {
        self.manager.state()
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.manager.track_ids()
    }

    pub fn track_state(&self, track_id: TrackId) -> Option<LoadState> {
        self.manager.controller(track_id).map(TrackController::state)
    }

    pub fn track_name(&self, track_id: TrackId) -> Option<&str> {
        self.manager.controller(track_id).map(TrackController::name)
    }

    pub fn backend_kind(&self, track_id: TrackId) -> Option<BackendKind> {
        self.manager
            .controller(track_id)
            .and_then(TrackController::backend_kind)
    }

    /// Drive correction and end detection; call periodically
    pub fn tick(&mut self) -> TickOutcome {
        let outcome = self.manager.tick();
        if outcome == TickOutcome::Ended {
            let _ = self.context.events.send(SessionEvent::PlaybackEnded);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::HeadlessOutput;
    use crate::engine::MixerConfig;
    use crate::test_support::Harness;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session(fx: &Harness, engine: Option<Arc<MixerEngine>>, prefer_independent: bool) -> PlaybackSession {
        PlaybackSession::new(
            SessionConfig {
                sync: SyncConfig::default(),
                backend: BackendConfig {
                    prefer_independent_for_single_track: prefer_independent,
                },
            },
            SessionServices {
                engine,
                cache: Arc::clone(&fx.context.cache),
                loader: Arc::clone(&fx.context.loader),
                output: Arc::clone(&fx.context.output),
                volumes: Arc::clone(&fx.context.volumes),
                clock: fx.rig.clock(),
            },
        )
    }

    fn wait_ready(events: &Receiver<SessionEvent>, count: usize) {
        for _ in 0..count {
            let event = events.recv_timeout(std::time::Duration::from_secs(10)).unwrap();
            assert!(matches!(event, SessionEvent::TrackReady(_)), "got {:?}", event);
        }
    }

    fn run(fx: &Harness, session: &mut PlaybackSession, ms: u64) {
        for _ in 0..ms / 50 {
            fx.rig.advance(50);
            session.tick();
        }
    }

    #[test]
    fn test_group_shares_engine() {
        let fx = Harness::new();
        let engine = fx.engine();
        let mut session = session(&fx, Some(Arc::clone(&engine)), true);

        let ids: Vec<_> = ["vocals", "drums", "bass", "other"]
            .iter()
            .map(|name| session.add_track(fx.wav(&format!("{}.wav", name), 10_000)).unwrap())
            .collect();
        assert_eq!(engine.channel_count(), 4);
        for id in &ids {
            assert_eq!(session.backend_kind(*id), Some(BackendKind::SharedEngine));
            assert_eq!(session.track_state(*id), Some(LoadState::Ready));
        }

        session.play(0).unwrap();
        run(&fx, &mut session, 2_000);
        assert_eq!(session.get_position_ms(), 2_000);

        session.seek(6_000).unwrap();
        run(&fx, &mut session, 500);
        assert_eq!(session.get_position_ms(), 6_500);
        assert_eq!(session.get_duration_ms(), 10_000);
    }

    #[test]
    fn test_single_track_prefers_independent() {
        let fx = Harness::new();
        let engine = fx.engine();
        {
            let mut session = session(&fx, Some(Arc::clone(&engine)), true);
            let events = session.events();
            let id = session.add_track(fx.wav("vocals.wav", 2_000)).unwrap();
            assert_eq!(session.backend_kind(id), Some(BackendKind::Independent));
            wait_ready(&events, 1);
            assert!(session.set_playback_rate(1.25));
        }

        let mut session = session(&fx, Some(engine), false);
        let id = session.add_track(fx.wav("drums.wav", 2_000)).unwrap();
        assert_eq!(session.backend_kind(id), Some(BackendKind::SharedEngine));
        assert!(!session.set_playback_rate(1.25));
    }

    #[test]
    fn test_second_track_moves_group_to_engine() {
        let fx = Harness::new();
        let engine = fx.engine();
        let mut session = session(&fx, Some(Arc::clone(&engine)), true);
        let events = session.events();

        let first = session.add_track(fx.wav("vocals.wav", 5_000)).unwrap();
        wait_ready(&events, 1);
        session.play(0).unwrap();
        run(&fx, &mut session, 1_000);

        let second = session.add_track(fx.wav("drums.wav", 5_000)).unwrap();
        assert_eq!(session.backend_kind(first), Some(BackendKind::SharedEngine));
        assert_eq!(session.backend_kind(second), Some(BackendKind::SharedEngine));
        assert_eq!(engine.channel_count(), 2);
        assert_eq!(session.state(), GroupState::Playing);
        assert_eq!(session.get_position_ms(), 1_000);

        run(&fx, &mut session, 500);
        assert_eq!(session.get_position_ms(), 1_500);
    }

    #[test]
    fn test_engine_unavailable_falls_back_to_independent() {
        let fx = Harness::new();
        let output = HeadlessOutput::new(48_000);
        output.set_unavailable(true);
        let engine = MixerEngine::start(&output, fx.rig.clock(), MixerConfig::default())
            .ok()
            .map(Arc::new);
        assert!(engine.is_none());

        let mut session = session(&fx, engine, true);
        assert!(!session.engine_available());
        let events = session.events();
        let a = session.add_track(fx.wav("vocals.wav", 3_000)).unwrap();
        let b = session.add_track(fx.wav("drums.wav", 3_000)).unwrap();
        wait_ready(&events, 2);
        assert_eq!(session.backend_kind(a), Some(BackendKind::Independent));
        assert_eq!(session.backend_kind(b), Some(BackendKind::Independent));

        session.play(0).unwrap();
        run(&fx, &mut session, 1_000);
        assert_eq!(session.get_position_ms(), 1_000);
        assert_eq!(session.max_divergence_ms(), 0);
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let fx = Harness::new();
        let mut session = session(&fx, Some(fx.engine()), true);
        let err = session.add_track(fx.dir.path().join("missing.wav")).unwrap_err();
        assert!(matches!(
            err,
            PlayerError::CannotPlay {
                reason: FailureReason::MissingFile,
                ..
            }
        ));
        assert!(session.track_ids().is_empty());
    }

    #[test]
    fn test_channel_capacity_is_enforced() {
        let fx = Harness::new();
        let engine = Arc::new(
            MixerEngine::start(
                fx.rig.output.as_ref(),
                fx.rig.clock(),
                MixerConfig {
                    max_channels: 2,
                    ..MixerConfig::default()
                },
            )
            .unwrap(),
        );
        let mut session = session(&fx, Some(engine), false);
        session.add_track(fx.wav("a.wav", 500)).unwrap();
        session.add_track(fx.wav("b.wav", 500)).unwrap();

        let err = session.add_track(fx.wav("c.wav", 500)).unwrap_err();
        assert!(matches!(err, PlayerError::ChannelAllocationExhausted { capacity: 2 }));
        assert_eq!(session.track_ids().len(), 2);
    }

    #[test]
    fn test_full_engine_refuses_track_without_independent_output() {
        let fx = Harness::new();
        let engine = Arc::new(
            MixerEngine::start(
                fx.rig.output.as_ref(),
                fx.rig.clock(),
                MixerConfig {
                    max_channels: 2,
                    ..MixerConfig::default()
                },
            )
            .unwrap(),
        );
        let mut first = session(&fx, Some(Arc::clone(&engine)), false);
        first.add_track(fx.wav("vocals.wav", 500)).unwrap();
        first.add_track(fx.wav("drums.wav", 500)).unwrap();
        assert_eq!(engine.available_channels(), 0);

        let outputs = fx.rig.output.open_outputs();
        let mut second = session(&fx, Some(Arc::clone(&engine)), true);
        let events = second.events();
        second.add_track(fx.wav("bass.wav", 500)).unwrap();
        wait_ready(&events, 1);
        assert_eq!(fx.rig.output.open_outputs(), outputs + 1);

        // Joining the lone track would need the engine; nothing is opened instead
        let err = second.add_track(fx.wav("other.wav", 500)).unwrap_err();
        assert!(matches!(err, PlayerError::ChannelAllocationExhausted { capacity: 2 }));
        assert_eq!(second.track_ids().len(), 1);
        assert_eq!(fx.rig.output.open_outputs(), outputs + 1);
        assert_eq!(engine.channel_count(), 2);
    }

    #[test]
    fn test_track_added_mid_playback_joins_and_group_ends_once() {
        let fx = Harness::new();
        let mut session = session(&fx, None, true);
        let events = session.events();
        let ended = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&ended);
        session.on_end(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        session.add_track(fx.wav("vocals.wav", 2_000)).unwrap();
        session.add_track(fx.wav("drums.wav", 2_000)).unwrap();
        wait_ready(&events, 2);
        session.play(0).unwrap();
        run(&fx, &mut session, 500);

        let late = session.add_track(fx.wav("keys.wav", 2_000)).unwrap();
        wait_ready(&events, 1);
        assert_eq!(session.get_position_ms(), 500);

        run(&fx, &mut session, 5_000);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), GroupState::Ended);
        assert!(session.manager.controller(late).unwrap().is_ended());
    }

    #[test]
    fn test_undecodable_track_fails_alone() {
        let fx = Harness::new();
        let mut session = session(&fx, Some(fx.engine()), true);
        let events = session.events();

        let good = session.add_track(fx.wav("vocals.wav", 1_000)).unwrap();
        let bad_path = fx.dir.path().join("broken.flac");
        std::fs::write(&bad_path, b"not flac at all").unwrap();
        let bad = session.add_track(&bad_path).unwrap();

        let failed = events
            .try_iter()
            .find(|e| matches!(e, SessionEvent::TrackFailed { .. }));
        assert_eq!(
            failed,
            Some(SessionEvent::TrackFailed {
                track: bad,
                reason: FailureReason::UnsupportedFormat
            })
        );
        assert_eq!(
            session.track_state(bad),
            Some(LoadState::Failed(FailureReason::UnsupportedFormat))
        );
        assert_eq!(session.track_state(good), Some(LoadState::Ready));

        session.play(0).unwrap();
        run(&fx, &mut session, 500);
        assert_eq!(session.get_position_ms(), 500);
    }

    #[test]
    fn test_end_event_and_callback_fire_once() {
        let fx = Harness::new();
        let mut session = session(&fx, Some(fx.engine()), true);
        let events = session.events();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        session.on_end(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        session.add_track(fx.wav("vocals.wav", 800)).unwrap();
        session.add_track(fx.wav("drums.wav", 800)).unwrap();
        while events.try_recv().is_ok() {}

        session.play(0).unwrap();
        run(&fx, &mut session, 2_000);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let ended: Vec<_> = events.try_iter().collect();
        assert_eq!(ended, vec![SessionEvent::PlaybackEnded]);
    }

    #[test]
    fn test_volume_and_mute_by_track() {
        let fx = Harness::new();
        let mut session = session(&fx, Some(fx.engine()), false);
        let id = session.add_track(fx.wav("bass.wav", 500)).unwrap();

        session.set_volume(id, 30).unwrap();
        assert!(session.toggle_mute(id).unwrap());
        assert_eq!(session.track_volume(id), Some(TrackVolume::new(30, true)));
        session.set_muted(id, false).unwrap();
        assert_eq!(fx.volumes.load("bass"), TrackVolume::new(30, false));

        assert!(matches!(
            session.set_volume(TrackId(99), 10),
            Err(PlayerError::UnknownTrack(TrackId(99)))
        ));
    }

    #[test]
    fn test_remove_and_clear() {
        let fx = Harness::new();
        let engine = fx.engine();
        let mut session = session(&fx, Some(Arc::clone(&engine)), true);
        let a = session.add_track(fx.wav("a.wav", 500)).unwrap();
        session.add_track(fx.wav("b.wav", 500)).unwrap();

        session.remove_track(a).unwrap();
        assert!(session.remove_track(a).is_err());
        assert_eq!(engine.channel_count(), 1);

        session.clear();
        assert!(session.track_ids().is_empty());
        assert_eq!(engine.channel_count(), 0);
        assert_eq!(session.get_position_ms(), 0);
    }
}
