//! Sync manager
//!
//! Applies transport operations to every track of a session. Tracks on the
//! shared engine are driven through a single engine call; each independent
//! track gets its own call, issued back to back.
//!
//! Two poll timers run while the group plays:
//!
//! - correction: compares every independent track with the reference
//!   (the first ready track that has not ended) and reseeks any that drifted
//!   past the tolerance
//! - end poll: detects natural completion and fires the end callback once
//!   per play session

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::engine::{MixerEngine, TransportState};
use crate::error::PlayerResult;
use crate::track::{BackendKind, LoadState, TrackController};
use crate::types::TrackId;

use super::timer::PollTimer;
use super::SyncConfig;

/// Callback invoked when the group plays to its end
pub type EndCallback = Box<dyn FnMut() + Send + 'static>;

/// Transport state of the whole group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupState {
    #[default]
    Idle,
    Playing,
    Paused,
    /// Played to the end; seeking makes the group paused again
    Ended,
}

/// What a [`SyncManager::tick`] observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not playing, nothing to do
    Idle,
    Playing,
    /// The group reached its natural end during this tick
    Ended,
}

pub struct SyncManager {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    engine: Option<Arc<MixerEngine>>,
    controllers: Vec<TrackController>,
    correction: PollTimer,
    end_poll: PollTimer,
    on_end: Option<EndCallback>,
    end_fired: bool,
    state: GroupState,
    /// Last position reported while playing; the group clock never steps back
    last_position: Cell<u64>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, clock: Arc<dyn Clock>, engine: Option<Arc<MixerEngine>>) -> Self {
        let correction = PollTimer::new(Duration::from_millis(config.correction_interval_ms));
        let end_poll = PollTimer::new(Duration::from_millis(config.end_poll_interval_ms));
        Self {
            config,
            clock,
            engine,
            controllers: Vec::new(),
            correction,
            end_poll,
            on_end: None,
            end_fired: false,
            state: GroupState::Idle,
            last_position: Cell::new(0),
        }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    /// Add a track, joining the group's transport
    ///
    /// Tracks on the shared engine join through the engine itself. Any other
    /// track is started (or cued, while paused) at the group position; one
    /// that is still loading starts there once ready.
    pub fn add(&mut self, controller: TrackController) {
        let joins = controller.backend_kind() == Some(BackendKind::Independent)
            && matches!(controller.state(), LoadState::Ready | LoadState::Loading);
        if joins {
            let position_ms = self.position_ms();
            let joined = match self.state {
                GroupState::Playing => controller.play(position_ms),
                GroupState::Paused => controller.set_position(position_ms),
                GroupState::Idle | GroupState::Ended => Ok(()),
            };
            if let Err(e) = joined {
                log::warn!("{} could not join at {}ms: {}", controller.track_id(), position_ms, e);
            }
        }

        self.controllers.push(controller);
        if self.state == GroupState::Playing && self.needs_correction() && !self.correction.is_armed() {
            self.correction.start(self.clock.now());
        }
    }

    pub fn controllers(&self) -> &[TrackController] {
        &self.controllers
    }

    pub fn controller(&self, track_id: TrackId) -> Option<&TrackController> {
        self.controllers.iter().find(|c| c.track_id() == track_id)
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.controllers.iter().map(TrackController::track_id).collect()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Register the callback fired when playback ends naturally
    pub fn set_end_callback(&mut self, callback: EndCallback) {
        self.on_end = Some(callback);
    }

    /// Tracks that are loading or ready
    fn live(&self) -> impl Iterator<Item = &TrackController> {
        self.controllers
            .iter()
            .filter(|c| matches!(c.state(), LoadState::Ready | LoadState::Loading))
    }

    /// First ready track still playing out, or the furthest one once all ended
    fn reference(&self) -> Option<&TrackController> {
        let ready = self.controllers.iter().filter(|c| c.is_ready());
        ready
            .clone()
            .find(|c| !c.is_ended())
            .or_else(|| ready.max_by_key(|c| c.get_position()))
    }

    /// Run `op` once for the shared engine and once per other live track
    fn dispatch<F>(&self, mut op: F) -> PlayerResult<()>
    where
        F: FnMut(&TrackController) -> PlayerResult<()>,
    {
        let mut engine_done = false;
        let mut first_error = None;
        for controller in self.live() {
            if controller.backend_kind() == Some(BackendKind::SharedEngine) {
                if engine_done {
                    continue;
                }
                engine_done = true;
            }
            if let Err(e) = op(controller) {
                log::warn!("{}: {}", controller.track_id(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Two or more tracks with at least one on its own clock
    fn needs_correction(&self) -> bool {
        let mut live = 0;
        let mut independent = false;
        for controller in self.live() {
            live += 1;
            independent |= controller.backend_kind() != Some(BackendKind::SharedEngine);
        }
        live >= 2 && independent
    }

    fn arm_timers(&mut self) {
        let now = self.clock.now();
        if self.needs_correction() {
            self.correction.start(now);
        } else {
            self.correction.cancel();
        }
        self.end_poll.start(now);
    }

    fn cancel_timers(&mut self) {
        self.correction.cancel();
        self.end_poll.cancel();
    }

    /// Start every track at `offset_ms`
    ///
    /// Starts a new play session, so the end callback may fire again.
    /// A track that fails to start is logged and the first error returned;
    /// the rest of the group still plays.
    pub fn play_all(&mut self, offset_ms: u64) -> PlayerResult<()> {
        self.correction.cancel();
        self.end_fired = false;
        self.last_position.set(0);

        let result = self.dispatch(|c| c.play(offset_ms));
        if result.is_err() && self.live().all(|c| c.backend_kind() == Some(BackendKind::SharedEngine)) {
            // The engine refused; nothing started
            return result;
        }

        self.state = GroupState::Playing;
        self.arm_timers();
        log::info!("Playing {} tracks from {}ms", self.controllers.len(), offset_ms);
        result
    }

    pub fn pause_all(&mut self) {
        self.cancel_timers();
        let _ = self.dispatch(|c| {
            c.pause();
            Ok(())
        });
        if self.state == GroupState::Playing {
            self.state = GroupState::Paused;
        }
    }

    /// Continue a paused group (no-op otherwise)
    pub fn resume_all(&mut self) -> PlayerResult<()> {
        if self.state != GroupState::Paused {
            return Ok(());
        }
        let result = self.dispatch(TrackController::resume);
        self.state = GroupState::Playing;
        self.arm_timers();
        result
    }

    /// Stop every track and rewind; cancels pending correction
    pub fn stop_all(&mut self) {
        self.cancel_timers();
        self.last_position.set(0);
        let _ = self.dispatch(|c| {
            c.stop();
            Ok(())
        });
        self.state = GroupState::Idle;
    }

    /// Move every track to `position_ms`
    ///
    /// A playing group keeps playing and its correction interval restarts.
    /// A stopped or ended group becomes paused at the new position.
    pub fn seek_all(&mut self, position_ms: u64) -> PlayerResult<()> {
        self.last_position.set(0);
        let result = self.dispatch(|c| c.set_position(position_ms));
        match self.state {
            GroupState::Playing => {
                if self.needs_correction() {
                    self.correction.start(self.clock.now());
                }
            }
            GroupState::Idle | GroupState::Ended => {
                if result.is_ok() {
                    self.state = GroupState::Paused;
                }
            }
            GroupState::Paused => {}
        }
        result
    }

    /// Change the rate of every track
    ///
    /// Only applied when no track is on the shared engine, which always
    /// plays at 1.0. Returns whether the rate took effect.
    pub fn set_playback_rate_all(&mut self, rate: f64) -> bool {
        if self.live().any(|c| c.backend_kind() == Some(BackendKind::SharedEngine)) {
            log::info!("Playback rate is fixed at 1.0 on the shared engine");
            return false;
        }
        let mut applied = false;
        for controller in self.live() {
            applied |= controller.set_playback_rate(rate);
        }
        if applied && self.state == GroupState::Playing && self.needs_correction() {
            self.correction.start(self.clock.now());
        }
        applied
    }

    /// Group position: the reference track's, or the requested start offset
    /// while every track is still loading
    ///
    /// While playing the reported value never decreases, even when the
    /// reference moves to another track.
    pub fn position_ms(&self) -> u64 {
        let position = self
            .reference()
            .or_else(|| self.live().next())
            .map_or(0, TrackController::get_position);
        if self.state != GroupState::Playing {
            return position;
        }
        let position = position.max(self.last_position.get());
        self.last_position.set(position);
        position
    }

    /// Length of the longest loaded track
    pub fn duration_ms(&self) -> u64 {
        self.controllers
            .iter()
            .map(TrackController::get_duration)
            .max()
            .unwrap_or(0)
    }

    /// Largest distance between the reference and any independent track
    pub fn max_divergence_ms(&self) -> u64 {
        let Some(reference) = self.reference() else {
            return 0;
        };
        let reference_ms = reference.get_position();
        self.controllers
            .iter()
            .filter(|c| c.is_ready() && c.backend_kind() == Some(BackendKind::Independent))
            .filter(|c| !c.is_ended())
            .map(|c| c.get_position().abs_diff(reference_ms))
            .max()
            .unwrap_or(0)
    }

    /// Remove and tear down one track
    pub fn remove(&mut self, track_id: TrackId) -> bool {
        let Some(index) = self.controllers.iter().position(|c| c.track_id() == track_id) else {
            return false;
        };
        self.controllers.remove(index).teardown();
        if self.controllers.is_empty() {
            self.cancel_timers();
            self.state = GroupState::Idle;
        } else if self.state == GroupState::Playing && !self.needs_correction() {
            self.correction.cancel();
        }
        true
    }

    /// Tear down every track
    pub fn clear(&mut self) {
        self.cancel_timers();
        self.last_position.set(0);
        for controller in self.controllers.drain(..) {
            controller.teardown();
        }
        self.state = GroupState::Idle;
    }

    /// Run whatever polling is due
    pub fn tick(&mut self) -> TickOutcome {
        if self.state != GroupState::Playing {
            return TickOutcome::Idle;
        }

        let now = self.clock.now();
        if self.correction.fire_if_due(now) {
            self.correct_drift();
        }

        if self.end_poll.fire_if_due(now) && self.detect_end() {
            self.cancel_timers();
            let _ = self.dispatch(|c| {
                c.pause();
                Ok(())
            });
            self.state = GroupState::Ended;
            if !self.end_fired {
                self.end_fired = true;
                log::info!("Playback ended at {}ms", self.duration_ms());
                if let Some(callback) = self.on_end.as_mut() {
                    callback();
                }
            }
            return TickOutcome::Ended;
        }

        TickOutcome::Playing
    }

    fn correct_drift(&self) {
        let Some(reference) = self.reference() else {
            return;
        };
        let reference_ms = reference.get_position();

        for controller in &self.controllers {
            if controller.track_id() == reference.track_id()
                || !controller.is_ready()
                || controller.backend_kind() != Some(BackendKind::Independent)
                || reference_ms >= controller.get_duration()
            {
                continue;
            }
            let position = controller.get_position();
            let drift = position.abs_diff(reference_ms);
            if drift > self.config.tolerance_ms {
                log::debug!(
                    "{} drifted {}ms from {} ({} vs {}ms), reseeking",
                    controller.track_id(),
                    drift,
                    reference.track_id(),
                    position,
                    reference_ms
                );
                if let Err(e) = controller.set_position(reference_ms) {
                    log::debug!("Correction of {} failed: {}", controller.track_id(), e);
                }
            }
        }
    }

    /// Natural completion of every ready track
    fn detect_end(&self) -> bool {
        let mut ready = 0;
        let mut shared = false;
        for controller in self.live() {
            if !controller.is_ready() {
                return false;
            }
            ready += 1;
            match controller.backend_kind() {
                Some(BackendKind::SharedEngine) => shared = true,
                _ => {
                    if !controller.is_ended() {
                        return false;
                    }
                }
            }
        }
        if ready == 0 {
            return false;
        }
        if !shared {
            return true;
        }
        match self.engine.as_ref() {
            Some(engine) => engine.check_ended() || engine.state() == TransportState::Ended,
            None => false,
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.clear();
    }
}
