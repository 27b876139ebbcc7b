//! One track bound to one voice of the shared output

use std::sync::Arc;

use crate::asset::AudioAsset;
use crate::audio::{VoiceId, VoiceTable};
use crate::types::{PcmBuffer, TrackId};

/// A mixer channel: one asset, one voice, one volume
#[derive(Debug)]
pub struct Channel {
    track_id: TrackId,
    asset: Arc<AudioAsset>,
    volume: f32,
    voice: VoiceId,
}

impl Channel {
    pub(super) fn new(track_id: TrackId, asset: Arc<AudioAsset>, volume: f32, voice: VoiceId) -> Self {
        Self {
            track_id,
            asset,
            volume: volume.clamp(0.0, 1.0),
            voice,
        }
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn asset(&self) -> &Arc<AudioAsset> {
        &self.asset
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub(super) fn voice(&self) -> VoiceId {
        self.voice
    }

    #[inline]
    pub(super) fn start(&self, voices: &mut VoiceTable, buffer: PcmBuffer) {
        voices.set_volume(self.voice, self.volume);
        voices.play(self.voice, buffer);
    }

    /// Bind `buffer` without starting it; the next resume starts it
    pub(super) fn cue(&self, voices: &mut VoiceTable, buffer: PcmBuffer) {
        voices.set_volume(self.voice, self.volume);
        voices.cue(self.voice, buffer);
    }

    #[inline]
    pub(super) fn pause(&self, voices: &mut VoiceTable) {
        voices.pause(self.voice);
    }

    #[inline]
    pub(super) fn resume(&self, voices: &mut VoiceTable) {
        voices.resume(self.voice);
    }

    #[inline]
    pub(super) fn stop(&self, voices: &mut VoiceTable) {
        voices.stop(self.voice);
    }

    pub(super) fn set_volume(&mut self, voices: &mut VoiceTable, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        voices.set_volume(self.voice, self.volume);
    }

    #[inline]
    pub(super) fn is_busy(&self, voices: &VoiceTable) -> bool {
        voices.is_busy(self.voice)
    }
}
