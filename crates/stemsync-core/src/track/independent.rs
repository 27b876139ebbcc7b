//! Per-track player with its own output
//!
//! Used when the shared engine is unavailable or a track plays alone. Each
//! player owns a one-voice output with its own clock; its position is read
//! from the voice cursor, so independent players drift apart and rely on the
//! sync manager's periodic correction.

use std::sync::Arc;

use crate::asset::AudioAsset;
use crate::audio::{AudioResult, OutputMixer, OutputProvider, VoiceId, VoiceState};
use crate::types::{frames_to_ms, ms_to_frames};

pub struct IndependentPlayer {
    output: OutputMixer,
    voice: VoiceId,
    asset: Arc<AudioAsset>,
    /// Whether the player should be producing audio
    playing: bool,
}

impl IndependentPlayer {
    /// Open an output named `label` and cue `asset` at its start
    pub fn open(provider: &dyn OutputProvider, label: &str, asset: Arc<AudioAsset>) -> AudioResult<Self> {
        let output = provider.open(label, 1)?;
        let voice = {
            let mut voices = output.voices();
            let voice = voices.allocate()?;
            voices.cue(voice, asset.playback().clone());
            voice
        };
        Ok(Self {
            output,
            voice,
            asset,
            playing: false,
        })
    }

    pub fn duration_ms(&self) -> u64 {
        self.asset.duration_ms()
    }

    /// Start playing at `position_ms`
    pub fn play_from(&mut self, position_ms: u64) {
        let mut voices = self.output.voices();
        if voices.state(self.voice) == VoiceState::Stopped {
            voices.cue(self.voice, self.asset.playback().clone());
        }
        voices.seek(self.voice, self.frame_at(position_ms));
        voices.resume(self.voice);
        self.playing = true;
    }

    pub fn pause(&mut self) {
        self.output.voices().pause(self.voice);
        self.playing = false;
    }

    pub fn resume(&mut self) {
        self.output.voices().resume(self.voice);
        self.playing = true;
    }

    /// Pause and rewind to the start
    pub fn stop(&mut self) {
        let mut voices = self.output.voices();
        voices.pause(self.voice);
        voices.seek(self.voice, 0);
        self.playing = false;
    }

    /// Move to `position_ms`, keeping the play/pause state
    pub fn set_position(&mut self, position_ms: u64) {
        let mut voices = self.output.voices();
        voices.seek(self.voice, self.frame_at(position_ms));
        if self.playing {
            voices.resume(self.voice);
        }
    }

    pub fn position_ms(&self) -> u64 {
        let cursor = self.output.voices().cursor(self.voice);
        frames_to_ms(cursor as u64, self.asset.playback().sample_rate()).min(self.duration_ms())
    }

    /// Varispeed rate multiplier (1.0 = original speed)
    pub fn set_rate(&mut self, rate: f64) {
        self.output.voices().set_rate(self.voice, rate);
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.output.voices().set_volume(self.voice, volume);
    }

    /// Native end-of-stream flag
    pub fn is_ended(&self) -> bool {
        self.output.voices().state(self.voice) == VoiceState::Finished
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    fn frame_at(&self, position_ms: u64) -> u64 {
        ms_to_frames(position_ms.min(self.duration_ms()), self.asset.playback().sample_rate())
    }
}

impl Drop for IndependentPlayer {
    fn drop(&mut self) {
        self.output.voices().release(self.voice);
        log::debug!("Closed independent output '{}'", self.output.label());
    }
}
