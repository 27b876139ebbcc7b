//! Audio file decoding
//!
//! Two decode paths feed the same output format (stereo f32 at the output
//! sample rate):
//!
//! - **Primary**: WAV files through `hound`. Exact sample counts, so the
//!   result always carries a trimmable representation.
//! - **Transcode**: everything else (and WAVs `hound` rejects) through
//!   `symphonia`, fully decoded into memory. The frame count is known once
//!   the whole stream is decoded, so the result is trimmable as well.
//!
//! Decoding never hangs: the packet loop stops on end of stream, on a fatal
//! error, or after a bounded run of consecutive corrupt packets.

use std::fs::File;
use std::path::{Path, PathBuf};

use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::types::{PcmBuffer, StereoSample};

/// Give up on a stream after this many undecodable packets in a row
const MAX_CONSECUTIVE_DECODE_ERRORS: usize = 16;

/// Input chunk size for the FFT resampler (frames)
const RESAMPLE_CHUNK: usize = 1024;

/// Why a file could not be turned into playable audio
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The file does not exist
    #[error("Audio file not found: {0:?}")]
    NotFound(PathBuf),

    /// The file exists but could not be read
    #[error("Failed to read {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    /// Neither decode path understands the container or codec
    #[error("Unsupported audio format {path:?}: {message}")]
    Unsupported { path: PathBuf, message: String },

    /// The stream was recognized but produced no usable audio
    #[error("Corrupt audio data in {path:?}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// Sample rate conversion failed
    #[error("Failed to resample {path:?}: {message}")]
    Resample { path: PathBuf, message: String },
}

impl DecodeError {
    /// True when the failure is a missing file rather than bad content
    pub fn is_missing_file(&self) -> bool {
        matches!(self, DecodeError::NotFound(_))
    }
}

/// Which decode path produced an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePath {
    Primary,
    Transcode,
}

/// Decoder settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
    /// Output sample rate; decoded audio is resampled to it
    pub target_sample_rate: u32,
    /// Produce a trimmable representation when offsets are reliable
    pub keep_trimmable: bool,
}

/// Decoded samples that can be started at an arbitrary offset
///
/// Only present when the decoder knows the exact sample count of the
/// source, so offset math is trustworthy.
#[derive(Debug, Clone)]
pub struct TrimmableSamples {
    samples: PcmBuffer,
}

impl TrimmableSamples {
    /// Wrap samples whose length is known to be exact
    pub fn new(samples: PcmBuffer) -> Self {
        Self { samples }
    }

    /// Playback buffer starting `position_ms` into the asset
    pub fn from_position(&self, position_ms: u64) -> PcmBuffer {
        self.samples.skip_ms(position_ms)
    }
}

/// Result of decoding one file
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub playback: PcmBuffer,
    pub trimmable: Option<TrimmableSamples>,
    pub path: DecodePath,
    pub source_sample_rate: u32,
    pub source_channels: u16,
}

/// Interleaved PCM straight out of a decoder
struct RawPcm {
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
}

/// Decode `path` into stereo PCM at `options.target_sample_rate`
pub fn decode_file(path: &Path, options: &DecodeOptions) -> Result<DecodedAudio, DecodeError> {
    if !path.exists() {
        return Err(DecodeError::NotFound(path.to_path_buf()));
    }

    let (raw, decode_path) = if is_wav(path) {
        match decode_wav(path) {
            Ok(raw) => (raw, DecodePath::Primary),
            Err(e) => {
                log::debug!("Primary WAV decode failed for {:?} ({}), transcoding", path, e);
                (transcode(path)?, DecodePath::Transcode)
            }
        }
    } else {
        (transcode(path)?, DecodePath::Transcode)
    };

    if raw.channels == 0 || raw.sample_rate == 0 {
        return Err(DecodeError::Corrupt {
            path: path.to_path_buf(),
            message: format!("invalid stream layout ({} ch @ {}Hz)", raw.channels, raw.sample_rate),
        });
    }

    let mut frames = to_stereo(&raw.samples, raw.channels);
    if frames.is_empty() {
        return Err(DecodeError::Corrupt {
            path: path.to_path_buf(),
            message: "no audio frames decoded".to_string(),
        });
    }

    if raw.sample_rate != options.target_sample_rate {
        log::debug!(
            "Resampling {:?} from {}Hz to {}Hz",
            path,
            raw.sample_rate,
            options.target_sample_rate
        );
        frames = resample(&frames, raw.sample_rate, options.target_sample_rate).map_err(|message| {
            DecodeError::Resample {
                path: path.to_path_buf(),
                message,
            }
        })?;
    }

    let playback = PcmBuffer::new(frames, options.target_sample_rate);
    let trimmable = options.keep_trimmable.then(|| TrimmableSamples {
        samples: playback.clone(),
    });

    Ok(DecodedAudio {
        playback,
        trimmable,
        path: decode_path,
        source_sample_rate: raw.sample_rate,
        source_channels: raw.channels as u16,
    })
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("wave"))
        .unwrap_or(false)
}

/// Primary path: WAV via hound
fn decode_wav(path: &Path) -> Result<RawPcm, hound::Error> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<f32>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<Vec<f32>, _>>()?
        }
    };

    Ok(RawPcm {
        samples,
        channels: spec.channels as usize,
        sample_rate: spec.sample_rate,
    })
}

/// Fallback path: probe and fully decode with symphonia
fn transcode(path: &Path) -> Result<RawPcm, DecodeError> {
    let file = File::open(path).map_err(|e| DecodeError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let unsupported = |message: String| DecodeError::Unsupported {
        path: path.to_path_buf(),
        message,
    };

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| unsupported("no audio track found".to_string()))?;

    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut consecutive_errors = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => {
                log::debug!("Stream reset requested in {:?}, stopping decode", path);
                break;
            }
            Err(e) => {
                log::warn!("Error reading packet from {:?}: {}", path, e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => {
                consecutive_errors = 0;
                decoded
            }
            Err(SymphoniaError::DecodeError(e)) => {
                consecutive_errors += 1;
                log::debug!("Skipping undecodable packet in {:?}: {}", path, e);
                if consecutive_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
                    return Err(DecodeError::Corrupt {
                        path: path.to_path_buf(),
                        message: format!("{} consecutive undecodable packets", consecutive_errors),
                    });
                }
                continue;
            }
            Err(e) => {
                log::warn!("Decoder error in {:?}: {}", path, e);
                break;
            }
        };

        let spec = *decoded.spec();
        if sample_rate == 0 {
            sample_rate = spec.rate;
        }
        if channels == 0 {
            channels = spec.channels.count();
        }

        let buf = sample_buf.get_or_insert_with(|| SampleBuffer::new(decoded.capacity() as u64, spec));
        if buf.capacity() < decoded.capacity() * spec.channels.count() {
            *buf = SampleBuffer::new(decoded.capacity() as u64, spec);
        }
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }

    Ok(RawPcm {
        samples,
        channels,
        sample_rate,
    })
}

/// Interleaved samples with `channels` channels to stereo frames
///
/// Mono is duplicated to both sides; extra channels beyond two are dropped.
fn to_stereo(samples: &[f32], channels: usize) -> Vec<StereoSample> {
    match channels {
        1 => samples.iter().map(|&s| StereoSample::mono(s)).collect(),
        _ => samples
            .chunks_exact(channels)
            .map(|frame| StereoSample::new(frame[0], frame[1]))
            .collect(),
    }
}

/// Convert stereo frames from `from` Hz to `to` Hz
fn resample(frames: &[StereoSample], from: u32, to: u32) -> Result<Vec<StereoSample>, String> {
    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 2)
        .map_err(|e| e.to_string())?;

    let left: Vec<f32> = frames.iter().map(|s| s.left).collect();
    let right: Vec<f32> = frames.iter().map(|s| s.right).collect();

    let expected = (frames.len() as u64 * to as u64 / from as u64) as usize;
    let delay = resampler.output_delay();
    let mut out_left: Vec<f32> = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK * 2);
    let mut out_right: Vec<f32> = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK * 2);

    let mut pos = 0;
    loop {
        let need = resampler.input_frames_next();
        if frames.len() - pos < need {
            break;
        }
        let chunk = [&left[pos..pos + need], &right[pos..pos + need]];
        let out = resampler.process(&chunk[..], None).map_err(|e| e.to_string())?;
        out_left.extend_from_slice(&out[0]);
        out_right.extend_from_slice(&out[1]);
        pos += need;
    }

    if pos < frames.len() {
        let chunk = [&left[pos..], &right[pos..]];
        let out = resampler
            .process_partial(Some(&chunk[..]), None)
            .map_err(|e| e.to_string())?;
        out_left.extend_from_slice(&out[0]);
        out_right.extend_from_slice(&out[1]);
    }

    // Flush the resampler's internal delay
    while out_left.len() < expected + delay {
        let out = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| e.to_string())?;
        if out[0].is_empty() {
            break;
        }
        out_left.extend_from_slice(&out[0]);
        out_right.extend_from_slice(&out[1]);
    }

    Ok(out_left
        .into_iter()
        .zip(out_right)
        .skip(delay)
        .take(expected)
        .map(|(l, r)| StereoSample::new(l, r))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_sine_wav, write_wav};

    fn options(rate: u32) -> DecodeOptions {
        DecodeOptions {
            target_sample_rate: rate,
            keep_trimmable: true,
        }
    }

    #[test]
    fn test_wav_primary_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "vocals.wav", 1500, 48_000);

        let decoded = decode_file(&path, &options(48_000)).unwrap();
        assert_eq!(decoded.path, DecodePath::Primary);
        assert_eq!(decoded.playback.duration_ms(), 1500);
        assert_eq!(decoded.source_channels, 2);

        let tail = decoded.trimmable.unwrap().from_position(500);
        assert_eq!(tail.duration_ms(), 1000);
    }

    #[test]
    fn test_mono_wav_is_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "mono.wav", 1, 8_000, &[0.5; 800]);

        let decoded = decode_file(&path, &options(8_000)).unwrap();
        let frame = decoded.playback.frame(10).unwrap();
        assert!((frame.left - 0.5).abs() < 1e-3);
        assert_eq!(frame.left, frame.right);
    }

    #[test]
    fn test_resampled_duration_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "drums.wav", 2000, 44_100);

        let decoded = decode_file(&path, &options(48_000)).unwrap();
        assert_eq!(decoded.source_sample_rate, 44_100);
        assert_eq!(decoded.playback.sample_rate(), 48_000);
        assert_eq!(decoded.playback.len(), 96_000);
    }

    #[test]
    fn test_trimmable_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "bass.wav", 100, 48_000);

        let decoded = decode_file(
            &path,
            &DecodeOptions {
                target_sample_rate: 48_000,
                keep_trimmable: false,
            },
        )
        .unwrap();
        assert!(decoded.trimmable.is_none());
    }

    #[test]
    fn test_transcode_path_decodes_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let wav = write_sine_wav(dir.path(), "other.wav", 1000, 48_000);
        let path = dir.path().join("other.stem");
        std::fs::rename(&wav, &path).unwrap();

        let decoded = decode_file(&path, &options(48_000)).unwrap();
        assert_eq!(decoded.path, DecodePath::Transcode);
        assert_eq!(decoded.source_channels, 2);
        assert_eq!(decoded.playback.duration_ms(), 1000);

        let tail = decoded.trimmable.unwrap().from_position(400);
        assert_eq!(tail.duration_ms(), 600);
    }

    #[test]
    fn test_missing_file_is_distinguishable() {
        let err = decode_file(Path::new("/nonexistent/stem.wav"), &options(48_000)).unwrap_err();
        assert!(err.is_missing_file());
    }

    #[test]
    fn test_garbage_file_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-audio.mp3");
        std::fs::write(&path, b"this is definitely not an mp3 stream").unwrap();

        let err = decode_file(&path, &options(48_000)).unwrap_err();
        assert!(!err.is_missing_file());
        assert!(matches!(err, DecodeError::Unsupported { .. }), "got {:?}", err);
    }

    #[test]
    fn test_empty_wav_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "empty.wav", 2, 48_000, &[]);

        let err = decode_file(&path, &options(48_000)).unwrap_err();
        assert!(matches!(err, DecodeError::Corrupt { .. }), "got {:?}", err);
    }
}
