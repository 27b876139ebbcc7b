//! CPAL audio backend implementation
//!
//! Each output is one CPAL stream whose callback owns a pre-allocated scratch
//! buffer and locks the shared [`VoiceTable`] once per block.
//!
//! ```text
//! ┌──────────────────┐   lock, mutate    ┌─────────────────────┐
//! │  Control side    │──────────────────►│  Arc<Mutex<         │
//! │  (engine/player) │                   │     VoiceTable>>    │
//! └──────────────────┘                   └──────────┬──────────┘
//!                                                   │ lock, render
//!                                                   ▼
//!                                        ┌─────────────────────┐
//!                                        │  CPAL Audio Thread  │
//!                                        └─────────────────────┘
//! ```
//!
//! CPAL streams are not `Send` on every platform, so each stream is built on
//! and owned by a small output thread. [`AudioHandle`] keeps that thread alive
//! and shuts it down on drop.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;

use crate::types::StereoBuffer;

use super::config::{AudioConfig, MAX_BUFFER_SIZE};
use super::device::{find_device_by_id, get_cpal_default_device};
use super::error::{AudioError, AudioResult};
use super::output::OutputMixer;
use super::voice::VoiceTable;

/// Keeps one output stream alive. Drop this to stop audio.
pub struct AudioHandle {
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
    buffer_size: u32,
}

impl AudioHandle {
    /// Get the sample rate of the stream
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Get the requested buffer size in frames
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Get the audio latency in milliseconds (one-way, output only)
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

impl Drop for AudioHandle {
    fn drop(&mut self) {
        // Dropping the sender wakes the output thread, which drops the stream
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Audio output thread panicked during shutdown");
            }
        }
    }
}

/// Negotiated stream parameters reported back by the output thread
struct StreamInfo {
    sample_rate: u32,
    buffer_size: u32,
    table: Arc<Mutex<VoiceTable>>,
}

/// Open an output stream on the configured device
///
/// The returned mixer has `voices` slots; the stream runs until the last
/// clone of the mixer is dropped.
pub fn start_output(config: &AudioConfig, label: &str, voices: usize) -> AudioResult<OutputMixer> {
    let (ready_tx, ready_rx) = mpsc::sync_channel::<AudioResult<StreamInfo>>(1);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let thread_config = config.clone();
    let thread_label = label.to_string();
    let thread = thread::Builder::new()
        .name(format!("audio-out-{}", label))
        .spawn(move || {
            let stream = match open_stream(&thread_config, &thread_label, voices) {
                Ok((stream, info)) => {
                    // Receiver may already be gone if the caller bailed out
                    let _ = ready_tx.send(Ok(info));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Park until the handle is dropped
            let _ = shutdown_rx.recv();
            drop(stream);
            log::debug!("Audio output '{}' closed", thread_label);
        })
        .map_err(|e| AudioError::ThreadError(e.to_string()))?;

    let info = ready_rx
        .recv()
        .map_err(|e| AudioError::ThreadError(e.to_string()))??;

    let handle = AudioHandle {
        shutdown: Some(shutdown_tx),
        thread: Some(thread),
        sample_rate: info.sample_rate,
        buffer_size: info.buffer_size,
    };

    log::info!(
        "Audio output '{}' started: {}Hz, {} frames (~{:.1}ms latency), {} voices",
        label,
        handle.sample_rate(),
        handle.buffer_size(),
        handle.latency_ms(),
        voices
    );

    Ok(OutputMixer::with_stream(
        label,
        info.table,
        info.sample_rate,
        handle,
    ))
}

/// Build and start the stream (runs on the output thread)
fn open_stream(
    config: &AudioConfig,
    label: &str,
    voices: usize,
) -> AudioResult<(Stream, StreamInfo)> {
    let device = match &config.device {
        Some(id) => find_device_by_id(id)?,
        None => get_cpal_default_device()?,
    };

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Output '{}' using audio device: {}", label, device_name);

    let (supported_config, buffer_size) = get_output_config(&device, config)?;
    let sample_rate = supported_config.sample_rate().0;

    let stream_config = StreamConfig {
        channels: supported_config.channels(),
        sample_rate: supported_config.sample_rate(),
        buffer_size: CpalBufferSize::Fixed(buffer_size),
    };

    log::info!(
        "Audio config: {} channels, {}Hz, {} frames",
        stream_config.channels,
        sample_rate,
        buffer_size
    );

    let table = Arc::new(Mutex::new(VoiceTable::new(voices, sample_rate)));
    let stream = build_output_stream(&device, &stream_config, Arc::clone(&table), label)?;
    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    Ok((
        stream,
        StreamInfo {
            sample_rate,
            buffer_size,
            table,
        },
    ))
}

/// Get the best output configuration for a device
///
/// Returns (SupportedStreamConfig, buffer_size_in_frames)
fn get_output_config(
    device: &cpal::Device,
    config: &AudioConfig,
) -> AudioResult<(cpal::SupportedStreamConfig, u32)> {
    let supported_configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .collect();

    let target_sample_rate = config.target_sample_rate();

    // The callback only writes f32; prefer stereo at the requested rate
    let f32_configs: Vec<_> = supported_configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if f32_configs.is_empty() {
        return Err(AudioError::UnsupportedFormat(
            "device offers no f32 output configuration".to_string(),
        ));
    }

    let best_config = f32_configs
        .iter()
        .find(|c| {
            c.channels() >= 2
                && target_sample_rate >= c.min_sample_rate().0
                && target_sample_rate <= c.max_sample_rate().0
        })
        .or_else(|| f32_configs.iter().find(|c| c.channels() >= 2))
        .or_else(|| f32_configs.first())
        .ok_or_else(|| {
            AudioError::ConfigError("No suitable output configuration found".to_string())
        })?;

    let sample_rate = if target_sample_rate >= best_config.min_sample_rate().0
        && target_sample_rate <= best_config.max_sample_rate().0
    {
        cpal::SampleRate(target_sample_rate)
    } else {
        let fallback = best_config.max_sample_rate();
        log::warn!(
            "Audio device doesn't support {}Hz, falling back to {}Hz (stems play varispeed-corrected)",
            target_sample_rate,
            fallback.0
        );
        fallback
    };

    let stream_config = (*best_config).clone().with_sample_rate(sample_rate);
    let buffer_size = config.buffer_size.as_frames();

    log::debug!(
        "Selected buffer size: {} frames for {:?}",
        buffer_size,
        config.buffer_size
    );

    Ok((stream_config, buffer_size))
}

/// Build the output stream
fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    table: Arc<Mutex<VoiceTable>>,
    label: &str,
) -> AudioResult<Stream> {
    let channels = config.channels as usize;
    let mut scratch = StereoBuffer::silence(MAX_BUFFER_SIZE);
    let error_label = label.to_string();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                for block in data.chunks_mut(MAX_BUFFER_SIZE * channels) {
                    let n_frames = block.len() / channels;
                    let mix = scratch.cleared(n_frames);
                    table.lock().render(mix);

                    if channels == 2 {
                        block.copy_from_slice(bytemuck::cast_slice(mix));
                        continue;
                    }
                    for (frame, sample) in block.chunks_mut(channels).zip(mix.iter()) {
                        frame[0] = sample.left;
                        if channels > 1 {
                            frame[1] = sample.right;
                        }
                        // Fill additional channels with silence
                        for ch in frame.iter_mut().skip(2) {
                            *ch = 0.0;
                        }
                    }
                }
            },
            move |err| {
                log::error!("Audio stream '{}' error: {}", error_label, err);
            },
            None, // No timeout (blocking)
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    Ok(stream)
}
