//! Output handles shared by the transport and the audio callback

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::types::StereoSample;

use super::config::AudioConfig;
use super::cpal_backend::{self, AudioHandle};
use super::error::AudioResult;
use super::voice::VoiceTable;

/// Control-side handle to one opened output
///
/// Cloning shares the same voice table. The underlying stream stays open
/// until the last clone is dropped.
#[derive(Clone)]
pub struct OutputMixer {
    label: Arc<str>,
    table: Arc<Mutex<VoiceTable>>,
    sample_rate: u32,
    _stream: Option<Arc<AudioHandle>>,
}

impl OutputMixer {
    /// Create a mixer with no stream attached (rendered by the caller)
    pub fn detached(label: &str, voices: usize, sample_rate: u32) -> Self {
        Self {
            label: label.into(),
            table: Arc::new(Mutex::new(VoiceTable::new(voices, sample_rate))),
            sample_rate,
            _stream: None,
        }
    }

    pub(crate) fn with_stream(
        label: &str,
        table: Arc<Mutex<VoiceTable>>,
        sample_rate: u32,
        stream: AudioHandle,
    ) -> Self {
        Self {
            label: label.into(),
            table,
            sample_rate,
            _stream: Some(Arc::new(stream)),
        }
    }

    /// Lock the voice table
    ///
    /// Everything done under one guard is seen atomically by the callback.
    pub fn voices(&self) -> MutexGuard<'_, VoiceTable> {
        self.table.lock()
    }

    pub(crate) fn table(&self) -> &Arc<Mutex<VoiceTable>> {
        &self.table
    }

    /// Mix all playing voices into `out`
    pub fn render(&self, out: &mut [StereoSample]) {
        self.table.lock().render(out);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sample rate negotiated with the device
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl fmt::Debug for OutputMixer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputMixer")
            .field("label", &self.label)
            .field("sample_rate", &self.sample_rate)
            .field("streaming", &self._stream.is_some())
            .finish()
    }
}

/// Factory for audio outputs
///
/// Each opened output runs on its own clock. The shared mixer engine opens
/// one output with many voices; every independent player opens its own.
pub trait OutputProvider: Send + Sync {
    /// Open an output with `voices` mixing slots
    fn open(&self, label: &str, voices: usize) -> AudioResult<OutputMixer>;

    /// Sample rate new outputs are expected to run at
    fn preferred_sample_rate(&self) -> u32;
}

/// Opens real device streams through CPAL
#[derive(Debug, Clone, Default)]
pub struct CpalOutputProvider {
    config: AudioConfig,
}

impl CpalOutputProvider {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl OutputProvider for CpalOutputProvider {
    fn open(&self, label: &str, voices: usize) -> AudioResult<OutputMixer> {
        cpal_backend::start_output(&self.config, label, voices)
    }

    fn preferred_sample_rate(&self) -> u32 {
        self.config.target_sample_rate()
    }
}
