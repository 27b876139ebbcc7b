//! Common types for Stemsync
//!
//! Fundamental audio types shared by the decoder, the output voices and the
//! transport: stereo frames, decoded PCM views and track identifiers.

use std::fmt;
use std::sync::Arc;

/// Audio sample type (32-bit float for mixing)
pub type Sample = f32;

/// Identifier of one stem in a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// A single stereo sample (left and right channels)
///
/// Uses `#[repr(C)]` to ensure predictable memory layout: [left, right].
/// This enables zero-copy conversion between `&[StereoSample]` and `&[f32]`
/// (interleaved format) using bytemuck.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    /// Create a new stereo sample
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// Create a silent stereo sample
    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Create a mono sample (same value in both channels)
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Linear interpolation towards `other` by `t` in [0, 1]
    #[inline]
    pub fn lerp(&self, other: &Self, t: Sample) -> Self {
        Self {
            left: self.left + (other.left - self.left) * t,
            right: self.right + (other.right - self.right) * t,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

/// A pre-allocated scratch buffer of stereo samples
///
/// Used by output callbacks; never reallocates once created.
#[derive(Debug, Clone)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Create a buffer filled with silence
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Number of stereo samples in the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Working slice of `n` frames, cleared to silence
    ///
    /// `n` is clamped to the allocated length, so this never allocates.
    #[inline]
    pub fn cleared(&mut self, n: usize) -> &mut [StereoSample] {
        let n = n.min(self.samples.len());
        let slice = &mut self.samples[..n];
        slice.fill(StereoSample::silence());
        slice
    }
}

/// Decoded stereo PCM at a known sample rate
///
/// The sample storage is shared: trimming produces a new view over the same
/// allocation, so starting playback mid-file never copies audio.
#[derive(Clone)]
pub struct PcmBuffer {
    samples: Arc<[StereoSample]>,
    start: usize,
    sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<StereoSample>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            start: 0,
            sample_rate,
        }
    }

    /// Number of frames in this view
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len() - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frame at `index` relative to the start of this view
    #[inline]
    pub fn frame(&self, index: usize) -> Option<StereoSample> {
        self.samples.get(self.start + index).copied()
    }

    /// Frames of this view as a slice
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples[self.start..]
    }

    /// Duration of this view in milliseconds
    pub fn duration_ms(&self) -> u64 {
        frames_to_ms(self.len() as u64, self.sample_rate)
    }

    /// A view starting `frames` into this one (empty when past the end)
    pub fn skip_frames(&self, frames: usize) -> Self {
        Self {
            samples: Arc::clone(&self.samples),
            start: (self.start + frames).min(self.samples.len()),
            sample_rate: self.sample_rate,
        }
    }

    /// A view starting at `position_ms` into this one
    pub fn skip_ms(&self, position_ms: u64) -> Self {
        self.skip_frames(ms_to_frames(position_ms, self.sample_rate) as usize)
    }

    /// Approximate heap footprint of the shared samples
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of_val(&*self.samples)
    }
}

impl fmt::Debug for PcmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmBuffer")
            .field("frames", &self.len())
            .field("start", &self.start)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Convert a frame count at `sample_rate` to whole milliseconds
#[inline]
pub fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames * 1000 / sample_rate as u64
}

/// Convert milliseconds to a frame count at `sample_rate`
#[inline]
pub fn ms_to_frames(ms: u64, sample_rate: u32) -> u64 {
    ms * sample_rate as u64 / 1000
}
