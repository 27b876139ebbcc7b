//! Shared mixer engine
//!
//! Plays N assets as one transport on a single output. Transport operations
//! hold the engine lock and then the voice-table lock, so callers never
//! observe a half-applied transition and every channel starts within the
//! same audio block.
//!
//! Reading the position never takes the engine lock: each transition stores
//! a fresh [`TransportSnapshot`] and readers derive the position from it and
//! the clock.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::asset::AudioAsset;
use crate::audio::{OutputMixer, OutputProvider};
use crate::clock::Clock;
use crate::types::TrackId;

use super::channel::Channel;
use super::error::{EngineError, EngineResult};
use super::transport::{TransportSnapshot, TransportState};

/// Label of the engine's output
pub const ENGINE_OUTPUT_LABEL: &str = "mixer-engine";

/// Shared engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Voices reserved on the engine's output (one per track)
    pub max_channels: usize,
    /// How close to the end the clock position must be before the
    /// transport may report natural completion
    pub end_threshold_ms: u64,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            max_channels: 32,
            end_threshold_ms: 100,
        }
    }
}

#[derive(Default)]
struct EngineInner {
    channels: BTreeMap<TrackId, Channel>,
    /// A seek happened while paused; resume must restart the channels
    restart_on_resume: bool,
}

/// N channels on one output, driven as one transport
pub struct MixerEngine {
    output: OutputMixer,
    clock: Arc<dyn Clock>,
    config: MixerConfig,
    inner: Mutex<EngineInner>,
    transport: AtomicCell<TransportSnapshot>,
}

impl MixerEngine {
    pub fn new(output: OutputMixer, clock: Arc<dyn Clock>, config: MixerConfig) -> Self {
        Self {
            output,
            clock,
            config,
            inner: Mutex::new(EngineInner::default()),
            transport: AtomicCell::new(TransportSnapshot::default()),
        }
    }

    /// Open the engine's output through `provider`
    ///
    /// Fails with [`EngineError::EngineUnavailable`] when the output cannot
    /// be opened; callers then fall back to independent players.
    pub fn start(
        provider: &dyn OutputProvider,
        clock: Arc<dyn Clock>,
        config: MixerConfig,
    ) -> EngineResult<Self> {
        let output = provider
            .open(ENGINE_OUTPUT_LABEL, config.max_channels)
            .map_err(EngineError::EngineUnavailable)?;
        log::info!(
            "Mixer engine started: {} channels at {}Hz",
            config.max_channels,
            output.sample_rate()
        );
        Ok(Self::new(output, clock, config))
    }

    pub fn sample_rate(&self) -> u32 {
        self.output.sample_rate()
    }

    /// Total channel capacity
    pub fn capacity(&self) -> usize {
        self.output.voices().capacity()
    }

    /// Channels that can still be allocated
    pub fn available_channels(&self) -> usize {
        self.output.voices().available()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub fn contains(&self, track_id: TrackId) -> bool {
        self.inner.lock().channels.contains_key(&track_id)
    }

    /// Bind `asset` to a new channel for `track_id`
    ///
    /// A track added while the transport plays (or is paused) joins at the
    /// current position when its asset allows it.
    pub fn load_track(&self, track_id: TrackId, asset: Arc<AudioAsset>, volume: f32) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if inner.channels.contains_key(&track_id) {
            return Err(EngineError::DuplicateTrack(track_id));
        }

        let mut voices = self.output.voices();
        let voice = voices
            .allocate()
            .map_err(|_| EngineError::ChannelAllocationExhausted {
                capacity: voices.capacity(),
            })?;
        let channel = Channel::new(track_id, asset, volume, voice);

        let snapshot = self.transport.load();
        let position = snapshot.position_ms(self.clock.now());
        match (snapshot.state, channel.asset().buffer_from(position)) {
            (TransportState::Playing, Some(buffer)) => channel.start(&mut voices, buffer),
            (TransportState::Paused, Some(buffer)) => channel.cue(&mut voices, buffer),
            (TransportState::Playing | TransportState::Paused, None) => {
                log::debug!("{} cannot join at {}ms, waits for the next play", track_id, position)
            }
            _ => {}
        }
        drop(voices);

        log::debug!(
            "Loaded {} on mixer channel ({}ms, {:?})",
            track_id,
            channel.asset().duration_ms(),
            channel.asset().path()
        );
        inner.channels.insert(track_id, channel);
        self.refresh_duration(&inner);
        Ok(())
    }

    /// Stop and release the channel for `track_id`
    pub fn unload_track(&self, track_id: TrackId) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let channel = inner
            .channels
            .remove(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?;
        self.output.voices().release(channel.voice());

        if inner.channels.is_empty() {
            inner.restart_on_resume = false;
            self.transport.store(TransportSnapshot::stopped(0));
        } else {
            self.refresh_duration(&inner);
        }
        log::debug!("Unloaded {} from mixer", track_id);
        Ok(())
    }

    /// Release every channel and reset the transport
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        {
            let mut voices = self.output.voices();
            for channel in inner.channels.values() {
                voices.release(channel.voice());
            }
        }
        inner.channels.clear();
        inner.restart_on_resume = false;
        self.transport.store(TransportSnapshot::stopped(0));
    }

    fn refresh_duration(&self, inner: &EngineInner) {
        let duration_ms = inner
            .channels
            .values()
            .map(|c| c.asset().duration_ms())
            .max()
            .unwrap_or(0);
        let snapshot = self.transport.load();
        self.transport.store(snapshot.with_duration(duration_ms));
    }

    /// Start every channel at `offset_ms`
    ///
    /// Fails with [`EngineError::NotSeekable`] before touching any channel
    /// if a non-zero offset is requested for an asset that cannot be trimmed.
    pub fn play(&self, offset_ms: u64) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        self.play_locked(&mut inner, offset_ms)
    }

    fn play_locked(&self, inner: &mut EngineInner, offset_ms: u64) -> EngineResult<()> {
        let snapshot = self.transport.load();
        let offset_ms = offset_ms.min(snapshot.duration_ms);

        // Resolve every buffer first so a failure leaves the transport untouched
        let buffers = inner
            .channels
            .values()
            .map(|channel| {
                channel
                    .asset()
                    .buffer_from(offset_ms)
                    .ok_or(EngineError::NotSeekable {
                        track: channel.track_id(),
                        position_ms: offset_ms,
                    })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let mut voices = self.output.voices();
        for channel in inner.channels.values() {
            channel.stop(&mut voices);
        }
        for (channel, buffer) in inner.channels.values().zip(buffers) {
            channel.start(&mut voices, buffer);
        }
        self.transport
            .store(snapshot.playing(self.clock.now(), offset_ms));
        drop(voices);

        inner.restart_on_resume = false;
        log::debug!(
            "Mixer playing {} channels from {}ms",
            inner.channels.len(),
            offset_ms
        );
        Ok(())
    }

    /// Pause every channel, capturing the position (no-op unless playing)
    pub fn pause(&self) {
        let inner = self.inner.lock();
        let snapshot = self.transport.load();
        if snapshot.state != TransportState::Playing {
            return;
        }

        let mut voices = self.output.voices();
        let position = snapshot.position_ms(self.clock.now());
        for channel in inner.channels.values() {
            channel.pause(&mut voices);
        }
        self.transport.store(snapshot.paused(position));
        log::debug!("Mixer paused at {}ms", position);
    }

    /// Continue from the paused position (no-op unless paused)
    pub fn resume(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let snapshot = self.transport.load();
        if snapshot.state != TransportState::Paused {
            return Ok(());
        }

        if inner.restart_on_resume {
            return self.play_locked(&mut inner, snapshot.paused_position_ms);
        }

        let mut voices = self.output.voices();
        for channel in inner.channels.values() {
            channel.resume(&mut voices);
        }
        self.transport
            .store(snapshot.playing(self.clock.now(), snapshot.paused_position_ms));
        log::debug!("Mixer resumed at {}ms", snapshot.paused_position_ms);
        Ok(())
    }

    /// Stop every channel and rewind to 0
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        {
            let mut voices = self.output.voices();
            for channel in inner.channels.values() {
                channel.stop(&mut voices);
            }
        }
        inner.restart_on_resume = false;
        let snapshot = self.transport.load();
        self.transport
            .store(TransportSnapshot::stopped(snapshot.duration_ms));
    }

    /// Move the transport to `position_ms`
    ///
    /// While playing the channels restart in place. Otherwise only the
    /// position is recorded and the transport becomes paused there; the
    /// channels restart on the next resume.
    pub fn set_position(&self, position_ms: u64) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let snapshot = self.transport.load();
        let position_ms = position_ms.min(snapshot.duration_ms);

        if position_ms > 0 {
            if let Some(channel) = inner.channels.values().find(|c| !c.asset().is_trimmable()) {
                return Err(EngineError::NotSeekable {
                    track: channel.track_id(),
                    position_ms,
                });
            }
        }

        match snapshot.state {
            TransportState::Playing => self.play_locked(&mut inner, position_ms),
            TransportState::Paused => {
                self.transport.store(snapshot.paused(position_ms));
                inner.restart_on_resume = true;
                Ok(())
            }
            TransportState::Stopped | TransportState::Ended => {
                {
                    let mut voices = self.output.voices();
                    for channel in inner.channels.values() {
                        channel.stop(&mut voices);
                    }
                }
                self.transport.store(snapshot.paused(position_ms));
                inner.restart_on_resume = true;
                Ok(())
            }
        }
    }

    /// Current transport position in milliseconds
    pub fn get_position(&self) -> u64 {
        self.transport.load().position_ms(self.clock.now())
    }

    /// Length of the longest loaded asset
    pub fn duration_ms(&self) -> u64 {
        self.transport.load().duration_ms
    }

    pub fn state(&self) -> TransportState {
        self.transport.load().state
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        self.transport.load()
    }

    /// Set a channel's volume (clamped to [0, 1]) with immediate effect
    pub fn set_volume(&self, track_id: TrackId, volume: f32) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let channel = inner
            .channels
            .get_mut(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?;
        channel.set_volume(&mut self.output.voices(), volume);
        Ok(())
    }

    pub fn volume(&self, track_id: TrackId) -> Option<f32> {
        self.inner.lock().channels.get(&track_id).map(Channel::volume)
    }

    /// True while any channel is producing audio
    pub fn is_busy(&self) -> bool {
        let inner = self.inner.lock();
        let voices = self.output.voices();
        inner.channels.values().any(|c| c.is_busy(&voices))
    }

    /// Detect natural completion
    ///
    /// True when the transport is playing, the clock position is within the
    /// end threshold of the duration and no channel is still busy. The
    /// transport then latches to [`TransportState::Ended`], so this returns
    /// true once per completion. Always false while paused.
    pub fn check_ended(&self) -> bool {
        let inner = self.inner.lock();
        let snapshot = self.transport.load();
        if snapshot.state != TransportState::Playing || inner.channels.is_empty() {
            return false;
        }

        let position = snapshot.position_ms(self.clock.now());
        if position + self.config.end_threshold_ms < snapshot.duration_ms {
            return false;
        }

        let busy = {
            let voices = self.output.voices();
            inner.channels.values().any(|c| c.is_busy(&voices))
        };
        if busy {
            return false;
        }

        self.transport.store(snapshot.ended());
        log::info!("Mixer reached end of playback at {}ms", snapshot.duration_ms);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::HeadlessOutput;
    use crate::test_support::{synthetic_asset, Rig};

    fn engine(rig: &Rig, max_channels: usize) -> MixerEngine {
        MixerEngine::start(
            rig.output.as_ref(),
            rig.clock(),
            MixerConfig {
                max_channels,
                ..MixerConfig::default()
            },
        )
        .unwrap()
    }

    fn voice_cursors(engine: &MixerEngine) -> Vec<f64> {
        let inner = engine.inner.lock();
        let voices = engine.output.voices();
        inner.channels.values().map(|c| voices.cursor(c.voice())).collect()
    }

    #[test]
    fn test_ten_second_track_seek_to_end() {
        let rig = Rig::new();
        let engine = engine(&rig, 4);
        engine
            .load_track(TrackId(0), synthetic_asset("vocals", 10_000, true), 0.8)
            .unwrap();

        engine.play(0).unwrap();
        rig.advance(5_000);
        assert_eq!(engine.get_position(), 5_000);

        engine.set_position(8_000).unwrap();
        assert_eq!(engine.get_position(), 8_000);

        rig.advance(2_500);
        assert_eq!(engine.get_position(), 10_000);
        assert!(engine.check_ended());
        assert!(!engine.check_ended());
        assert_eq!(engine.state(), TransportState::Ended);
        assert_eq!(engine.get_position(), 10_000);
    }

    #[test]
    fn test_channels_start_together() {
        let rig = Rig::new();
        let engine = engine(&rig, 4);
        for (i, name) in ["vocals", "drums", "bass"].iter().enumerate() {
            engine
                .load_track(TrackId(i as u32), synthetic_asset(name, 30_000, true), 1.0)
                .unwrap();
        }

        engine.play(0).unwrap();
        rig.advance(1_234);
        let cursors = voice_cursors(&engine);
        assert!(cursors.windows(2).all(|w| w[0] == w[1]), "{:?}", cursors);

        engine.set_position(12_000).unwrap();
        rig.advance(100);
        let cursors = voice_cursors(&engine);
        assert!(cursors.windows(2).all(|w| w[0] == w[1]), "{:?}", cursors);
    }

    #[test]
    fn test_pause_resume_preserves_position() {
        let rig = Rig::new();
        let engine = engine(&rig, 2);
        engine
            .load_track(TrackId(0), synthetic_asset("drums", 20_000, true), 1.0)
            .unwrap();

        engine.play(0).unwrap();
        rig.advance(3_000);
        engine.pause();
        engine.pause();
        assert_eq!(engine.state(), TransportState::Paused);
        assert_eq!(engine.get_position(), 3_000);

        rig.advance(5_000);
        assert_eq!(engine.get_position(), 3_000);

        engine.resume().unwrap();
        rig.advance(1_000);
        assert_eq!(engine.get_position(), 4_000);
        assert!(engine.is_busy());
    }

    #[test]
    fn test_track_added_while_paused_joins_on_resume() {
        let rig = Rig::new();
        let engine = engine(&rig, 4);
        for id in 0..2 {
            engine
                .load_track(TrackId(id), synthetic_asset("stem", 10_000, true), 1.0)
                .unwrap();
        }

        engine.play(0).unwrap();
        rig.advance(1_000);
        engine.pause();
        engine
            .load_track(TrackId(2), synthetic_asset("late", 10_000, true), 1.0)
            .unwrap();
        engine.resume().unwrap();
        rig.advance(500);

        assert_eq!(engine.get_position(), 1_500);
        {
            let inner = engine.inner.lock();
            let voices = engine.output.voices();
            assert!(inner.channels.values().all(|c| voices.is_busy(c.voice())));
        }
        // The late track's buffer starts at the paused position
        assert_eq!(voice_cursors(&engine), vec![72_000.0, 72_000.0, 24_000.0]);
    }

    #[test]
    fn test_seek_while_paused_is_lazy() {
        let rig = Rig::new();
        let engine = engine(&rig, 2);
        engine
            .load_track(TrackId(0), synthetic_asset("bass", 20_000, true), 1.0)
            .unwrap();

        engine.play(0).unwrap();
        rig.advance(1_000);
        engine.pause();
        engine.set_position(15_000).unwrap();
        assert_eq!(engine.get_position(), 15_000);
        // Voice still holds the pre-seek cursor
        assert_eq!(voice_cursors(&engine), vec![48_000.0]);

        engine.resume().unwrap();
        rig.advance(500);
        assert_eq!(engine.get_position(), 15_500);
        assert_eq!(voice_cursors(&engine), vec![24_000.0]);
    }

    #[test]
    fn test_seek_while_stopped_reports_position() {
        let rig = Rig::new();
        let engine = engine(&rig, 2);
        engine
            .load_track(TrackId(0), synthetic_asset("other", 9_000, true), 1.0)
            .unwrap();

        engine.set_position(4_000).unwrap();
        assert_eq!(engine.get_position(), 4_000);
        engine.resume().unwrap();
        rig.advance(1_000);
        assert_eq!(engine.get_position(), 5_000);
    }

    #[test]
    fn test_zero_volume_does_not_pause() {
        let rig = Rig::new();
        let engine = engine(&rig, 2);
        engine
            .load_track(TrackId(7), synthetic_asset("vocals", 10_000, true), 0.8)
            .unwrap();

        engine.play(0).unwrap();
        engine.set_volume(TrackId(7), 0.0).unwrap();
        rig.advance(2_000);
        assert_eq!(engine.state(), TransportState::Playing);
        assert_eq!(engine.get_position(), 2_000);
        assert!(engine.is_busy());
        assert_eq!(engine.volume(TrackId(7)), Some(0.0));

        engine.set_volume(TrackId(7), 3.0).unwrap();
        assert_eq!(engine.volume(TrackId(7)), Some(1.0));
    }

    #[test]
    fn test_offset_without_trimmable_fails_cleanly() {
        let rig = Rig::new();
        let engine = engine(&rig, 2);
        engine
            .load_track(TrackId(0), synthetic_asset("vocals", 10_000, true), 1.0)
            .unwrap();
        engine
            .load_track(TrackId(1), synthetic_asset("drums", 10_000, false), 1.0)
            .unwrap();

        let err = engine.play(2_000).unwrap_err();
        assert!(matches!(err, EngineError::NotSeekable { track: TrackId(1), .. }));
        assert_eq!(engine.state(), TransportState::Stopped);
        assert!(!engine.is_busy());

        engine.play(0).unwrap();
        rig.advance(1_000);
        assert!(engine.set_position(5_000).is_err());
        assert_eq!(engine.get_position(), 1_000);
    }

    #[test]
    fn test_channel_allocation_exhausted() {
        let rig = Rig::new();
        let engine = engine(&rig, 2);
        engine.load_track(TrackId(0), synthetic_asset("a", 1_000, true), 1.0).unwrap();
        engine.load_track(TrackId(1), synthetic_asset("b", 1_000, true), 1.0).unwrap();

        let err = engine
            .load_track(TrackId(2), synthetic_asset("c", 1_000, true), 1.0)
            .unwrap_err();
        assert!(matches!(err, EngineError::ChannelAllocationExhausted { capacity: 2 }));

        engine.unload_track(TrackId(0)).unwrap();
        assert!(engine.load_track(TrackId(2), synthetic_asset("c", 1_000, true), 1.0).is_ok());
    }

    #[test]
    fn test_not_ended_while_paused_or_busy() {
        let rig = Rig::new();
        let engine = engine(&rig, 2);
        engine
            .load_track(TrackId(0), synthetic_asset("vocals", 2_000, true), 1.0)
            .unwrap();

        engine.play(0).unwrap();
        // Clock reaches the end but the voice has not rendered yet
        rig.clock.advance_ms(2_000);
        assert!(!engine.check_ended());

        rig.output.render(2_000 * 48);
        engine.pause();
        assert!(!engine.check_ended());

        engine.resume().unwrap();
        assert!(engine.check_ended());
    }

    #[test]
    fn test_duration_is_longest_channel() {
        let rig = Rig::new();
        let engine = engine(&rig, 4);
        engine.load_track(TrackId(0), synthetic_asset("a", 4_000, true), 1.0).unwrap();
        engine.load_track(TrackId(1), synthetic_asset("b", 9_000, true), 1.0).unwrap();
        assert_eq!(engine.duration_ms(), 9_000);

        engine.unload_track(TrackId(1)).unwrap();
        assert_eq!(engine.duration_ms(), 4_000);
        assert!(matches!(
            engine.unload_track(TrackId(1)),
            Err(EngineError::UnknownTrack(_))
        ));

        engine.clear();
        assert_eq!(engine.channel_count(), 0);
        assert_eq!(engine.duration_ms(), 0);
    }

    #[test]
    fn test_stop_rewinds() {
        let rig = Rig::new();
        let engine = engine(&rig, 2);
        engine.load_track(TrackId(0), synthetic_asset("a", 5_000, true), 1.0).unwrap();
        engine.play(1_000).unwrap();
        rig.advance(500);
        engine.stop();
        assert_eq!(engine.get_position(), 0);
        assert_eq!(engine.state(), TransportState::Stopped);
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_unavailable_output() {
        let output = HeadlessOutput::new(48_000);
        output.set_unavailable(true);
        let rig = Rig::new();
        let result = MixerEngine::start(&output, rig.clock(), MixerConfig::default());
        assert!(matches!(result, Err(EngineError::EngineUnavailable(_))));
    }
}
