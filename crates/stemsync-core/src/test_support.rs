//! Shared fixtures for unit tests

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver};

use crate::asset::{AssetCache, AssetLoader, AudioAsset, DecodeOptions, DecodePath, DecodedAudio, TrimmableSamples};
use crate::audio::{HeadlessOutput, OutputProvider};
use crate::clock::{Clock, ManualClock};
use crate::engine::{MixerConfig, MixerEngine};
use crate::session::SessionEvent;
use crate::track::{ControllerContext, MemoryVolumeStore, VolumeStore};
use crate::types::{PcmBuffer, StereoSample};

/// Output rate used by every test rig
pub const TEST_RATE: u32 = 48_000;

/// Write interleaved `samples` as a 16-bit WAV file
pub fn write_wav(dir: &Path, name: &str, channels: u16, sample_rate: u32, samples: &[f32]) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for sample in samples {
        writer
            .write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
    path
}

/// Write a stereo 440 Hz sine of `duration_ms`
pub fn write_sine_wav(dir: &Path, name: &str, duration_ms: u64, sample_rate: u32) -> PathBuf {
    let frames = (duration_ms * sample_rate as u64 / 1000) as usize;
    let samples: Vec<f32> = (0..frames)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            let v = 0.25 * (2.0 * std::f32::consts::PI * 440.0 * t).sin();
            [v, v]
        })
        .collect();
    write_wav(dir, name, 2, sample_rate, &samples)
}

/// In-memory asset of `duration_ms` at [`TEST_RATE`]
pub fn synthetic_asset(name: &str, duration_ms: u64, trimmable: bool) -> Arc<AudioAsset> {
    let frames = (duration_ms * TEST_RATE as u64 / 1000) as usize;
    let playback = PcmBuffer::new(vec![StereoSample::mono(0.1); frames], TEST_RATE);
    let decoded = DecodedAudio {
        trimmable: trimmable.then(|| TrimmableSamples::new(playback.clone())),
        playback,
        path: if trimmable {
            DecodePath::Primary
        } else {
            DecodePath::Transcode
        },
        source_sample_rate: TEST_RATE,
        source_channels: 2,
    };
    let path = PathBuf::from(format!("/synthetic/{}.wav", name));
    Arc::new(AudioAsset::from_decoded(&path, decoded, 0))
}

/// Manual clock plus a headless output rendered in lockstep
pub struct Rig {
    pub clock: Arc<ManualClock>,
    pub output: Arc<HeadlessOutput>,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::new()),
            output: Arc::new(HeadlessOutput::new(TEST_RATE)),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock) as Arc<dyn Clock>
    }

    /// Advance the clock and render the same span of audio on every output
    pub fn advance(&self, ms: u64) {
        self.clock.advance_ms(ms);
        self.output.render((ms * TEST_RATE as u64 / 1000) as usize);
    }
}

/// Rig plus the collaborators a controller or session needs
pub struct Harness {
    pub rig: Rig,
    pub context: ControllerContext,
    pub events: Receiver<SessionEvent>,
    pub volumes: Arc<MemoryVolumeStore>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let rig = Rig::new();
        let cache = Arc::new(AssetCache::new(DecodeOptions {
            target_sample_rate: TEST_RATE,
            keep_trimmable: true,
        }));
        let loader = Arc::new(AssetLoader::spawn(Arc::clone(&cache), 2).unwrap());
        let volumes = Arc::new(MemoryVolumeStore::new());
        let (tx, events) = channel::unbounded();
        let context = ControllerContext {
            cache,
            loader,
            output: Arc::clone(&rig.output) as Arc<dyn OutputProvider>,
            volumes: Arc::clone(&volumes) as Arc<dyn VolumeStore>,
            events: tx,
        };
        Self {
            rig,
            context,
            events,
            volumes,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Shared engine on the rig's output
    pub fn engine(&self) -> Arc<MixerEngine> {
        Arc::new(MixerEngine::start(self.rig.output.as_ref(), self.rig.clock(), MixerConfig::default()).unwrap())
    }

    /// Stereo sine WAV in the harness directory
    pub fn wav(&self, name: &str, duration_ms: u64) -> PathBuf {
        write_sine_wav(self.dir.path(), name, duration_ms, TEST_RATE)
    }

    pub fn next_event(&self) -> SessionEvent {
        self.events.recv_timeout(Duration::from_secs(10)).unwrap()
    }
}
