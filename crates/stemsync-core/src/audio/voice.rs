//! Mixing voices
//!
//! A [`VoiceTable`] is the state shared between an output's audio callback
//! and the control side: a fixed number of voice slots, each playing one
//! [`PcmBuffer`] with its own volume, rate and cursor. The callback locks the
//! table once per block and mixes every playing voice into the output.
//!
//! Because all voices of one table advance inside the same callback, voices
//! started under a single lock begin on the same block boundary.

use crate::types::{PcmBuffer, StereoSample};

use super::error::{AudioError, AudioResult};

/// Handle to an allocated voice slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(usize);

/// Playback state of a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// No buffer bound
    #[default]
    Stopped,
    Playing,
    Paused,
    /// Cursor ran past the end of the buffer
    Finished,
}

#[derive(Debug)]
struct Voice {
    in_use: bool,
    state: VoiceState,
    buffer: Option<PcmBuffer>,
    /// Read position in buffer frames (fractional for varispeed)
    cursor: f64,
    volume: f32,
    rate: f64,
}

impl Voice {
    fn empty() -> Self {
        Self {
            in_use: false,
            state: VoiceState::Stopped,
            buffer: None,
            cursor: 0.0,
            volume: 1.0,
            rate: 1.0,
        }
    }

    fn buffer_len(&self) -> usize {
        self.buffer.as_ref().map_or(0, PcmBuffer::len)
    }

    /// Mix this voice into `out`, advancing the cursor
    fn mix_into(&mut self, out: &mut [StereoSample], output_rate: u32) {
        let Some(buffer) = self.buffer.as_ref() else {
            self.state = VoiceState::Stopped;
            return;
        };
        let len = buffer.len();
        let step = self.rate * buffer.sample_rate() as f64 / output_rate as f64;
        let unity = (step - 1.0).abs() < f64::EPSILON;
        let samples = buffer.as_slice();

        for frame in out.iter_mut() {
            let index = self.cursor as usize;
            if index >= len {
                self.state = VoiceState::Finished;
                return;
            }
            let sample = if unity {
                samples[index]
            } else {
                let next = samples.get(index + 1).unwrap_or(&samples[index]);
                let frac = (self.cursor - index as f64) as f32;
                samples[index].lerp(next, frac)
            };
            *frame += sample * self.volume;
            self.cursor += step;
        }

        if self.cursor as usize >= len {
            self.state = VoiceState::Finished;
        }
    }
}

/// Fixed-capacity set of voices mixed into one output
#[derive(Debug)]
pub struct VoiceTable {
    voices: Vec<Voice>,
    output_rate: u32,
}

impl VoiceTable {
    /// Create a table with `capacity` voice slots rendering at `output_rate`
    pub fn new(capacity: usize, output_rate: u32) -> Self {
        Self {
            voices: (0..capacity).map(|_| Voice::empty()).collect(),
            output_rate,
        }
    }

    /// Total number of voice slots
    pub fn capacity(&self) -> usize {
        self.voices.len()
    }

    /// Number of unallocated voice slots
    pub fn available(&self) -> usize {
        self.voices.iter().filter(|v| !v.in_use).count()
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Reserve a free voice slot
    pub fn allocate(&mut self) -> AudioResult<VoiceId> {
        let capacity = self.voices.len();
        let (index, voice) = self
            .voices
            .iter_mut()
            .enumerate()
            .find(|(_, v)| !v.in_use)
            .ok_or(AudioError::ChannelAllocationExhausted { capacity })?;
        *voice = Voice::empty();
        voice.in_use = true;
        Ok(VoiceId(index))
    }

    /// Stop a voice and return its slot to the pool
    pub fn release(&mut self, id: VoiceId) {
        if let Some(voice) = self.voices.get_mut(id.0) {
            *voice = Voice::empty();
        }
    }

    fn voice_mut(&mut self, id: VoiceId) -> Option<&mut Voice> {
        self.voices.get_mut(id.0).filter(|v| v.in_use)
    }

    fn voice(&self, id: VoiceId) -> Option<&Voice> {
        self.voices.get(id.0).filter(|v| v.in_use)
    }

    /// Bind `buffer` to the voice and start it from the buffer's first frame
    pub fn play(&mut self, id: VoiceId, buffer: PcmBuffer) {
        if let Some(voice) = self.voice_mut(id) {
            voice.state = if buffer.is_empty() {
                VoiceState::Finished
            } else {
                VoiceState::Playing
            };
            voice.buffer = Some(buffer);
            voice.cursor = 0.0;
        }
    }

    /// Bind `buffer` to the voice without starting it
    pub fn cue(&mut self, id: VoiceId, buffer: PcmBuffer) {
        if let Some(voice) = self.voice_mut(id) {
            voice.buffer = Some(buffer);
            voice.cursor = 0.0;
            voice.state = VoiceState::Paused;
        }
    }

    pub fn pause(&mut self, id: VoiceId) {
        if let Some(voice) = self.voice_mut(id) {
            if voice.state == VoiceState::Playing {
                voice.state = VoiceState::Paused;
            }
        }
    }

    pub fn resume(&mut self, id: VoiceId) {
        if let Some(voice) = self.voice_mut(id) {
            if voice.state == VoiceState::Paused {
                voice.state = if (voice.cursor as usize) < voice.buffer_len() {
                    VoiceState::Playing
                } else {
                    VoiceState::Finished
                };
            }
        }
    }

    /// Stop the voice and drop its buffer (the slot stays allocated)
    pub fn stop(&mut self, id: VoiceId) {
        if let Some(voice) = self.voice_mut(id) {
            voice.state = VoiceState::Stopped;
            voice.buffer = None;
            voice.cursor = 0.0;
        }
    }

    /// Move the cursor to `frame`; a finished voice becomes paused again
    pub fn seek(&mut self, id: VoiceId, frame: u64) {
        if let Some(voice) = self.voice_mut(id) {
            let len = voice.buffer_len();
            voice.cursor = (frame as usize).min(len) as f64;
            if voice.state == VoiceState::Finished && (frame as usize) < len {
                voice.state = VoiceState::Paused;
            }
        }
    }

    pub fn set_volume(&mut self, id: VoiceId, volume: f32) {
        if let Some(voice) = self.voice_mut(id) {
            voice.volume = volume.clamp(0.0, 1.0);
        }
    }

    /// Set the playback rate multiplier (1.0 = original speed)
    pub fn set_rate(&mut self, id: VoiceId, rate: f64) {
        if let Some(voice) = self.voice_mut(id) {
            voice.rate = rate.max(0.0);
        }
    }

    pub fn state(&self, id: VoiceId) -> VoiceState {
        self.voice(id).map_or(VoiceState::Stopped, |v| v.state)
    }

    /// True while the voice is actively producing audio
    pub fn is_busy(&self, id: VoiceId) -> bool {
        self.state(id) == VoiceState::Playing
    }

    /// Current read position in buffer frames
    pub fn cursor(&self, id: VoiceId) -> f64 {
        self.voice(id).map_or(0.0, |v| v.cursor)
    }

    /// Mix every playing voice into `out` (which is expected to be silent)
    pub fn render(&mut self, out: &mut [StereoSample]) {
        let output_rate = self.output_rate;
        for voice in self.voices.iter_mut() {
            if voice.in_use && voice.state == VoiceState::Playing {
                voice.mix_into(out, output_rate);
            }
        }
    }
}
