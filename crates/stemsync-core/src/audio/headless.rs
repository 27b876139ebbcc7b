//! Outputs without an audio device
//!
//! [`HeadlessOutput`] hands out detached mixers and renders them on demand:
//! tests advance every output by exact frame counts (or skew one output to
//! simulate clock drift), and `--headless` runs use [`Pacer`] to render in
//! real time on a background thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::StereoBuffer;

use super::config::MAX_BUFFER_SIZE;
use super::error::{AudioError, AudioResult};
use super::output::{OutputMixer, OutputProvider};
use super::voice::VoiceTable;

struct Registered {
    label: String,
    table: Weak<Mutex<VoiceTable>>,
}

/// Output provider that renders into a discard buffer
pub struct HeadlessOutput {
    sample_rate: u32,
    outputs: Mutex<Vec<Registered>>,
    unavailable: AtomicBool,
}

impl HeadlessOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            outputs: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make subsequent `open` calls fail as if no device were present
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Number of outputs still alive
    pub fn open_outputs(&self) -> usize {
        let mut outputs = self.outputs.lock();
        outputs.retain(|o| o.table.strong_count() > 0);
        outputs.len()
    }

    /// Render `frames` frames on every live output
    pub fn render(&self, frames: usize) {
        for table in self.live_tables(|_| true) {
            render_frames(&table, frames);
        }
    }

    /// Render `frames` frames only on outputs opened with `label`
    ///
    /// Returns false when no such output is alive.
    pub fn render_output(&self, label: &str, frames: usize) -> bool {
        let tables = self.live_tables(|l| l == label);
        for table in &tables {
            render_frames(table, frames);
        }
        !tables.is_empty()
    }

    fn live_tables(&self, filter: impl Fn(&str) -> bool) -> Vec<Arc<Mutex<VoiceTable>>> {
        let mut outputs = self.outputs.lock();
        outputs.retain(|o| o.table.strong_count() > 0);
        outputs
            .iter()
            .filter(|o| filter(&o.label))
            .filter_map(|o| o.table.upgrade())
            .collect()
    }

    /// Render all outputs in real time from a background thread
    pub fn spawn_pacer(self: &Arc<Self>, period: Duration) -> Pacer {
        let output = Arc::clone(self);
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("headless-pacer".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                let mut carry = 0.0f64;
                while thread_running.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    let now = Instant::now();
                    let exact = now.duration_since(last).as_secs_f64() * output.sample_rate as f64 + carry;
                    let frames = exact.floor();
                    carry = exact - frames;
                    last = now;
                    output.render(frames as usize);
                }
            })
            .ok();

        if thread.is_none() {
            log::error!("Failed to spawn headless pacer thread; outputs will not advance");
        }

        Pacer { running, thread }
    }
}

impl OutputProvider for HeadlessOutput {
    fn open(&self, label: &str, voices: usize) -> AudioResult<OutputMixer> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(AudioError::NoDevices);
        }
        let mixer = OutputMixer::detached(label, voices, self.sample_rate);
        self.outputs.lock().push(Registered {
            label: label.to_string(),
            table: Arc::downgrade(mixer.table()),
        });
        log::debug!("Headless output '{}' opened with {} voices", label, voices);
        Ok(mixer)
    }

    fn preferred_sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn render_frames(table: &Mutex<VoiceTable>, frames: usize) {
    let mut scratch = StereoBuffer::silence(frames.clamp(1, MAX_BUFFER_SIZE));
    let mut remaining = frames;
    while remaining > 0 {
        let n = remaining.min(scratch.len());
        table.lock().render(scratch.cleared(n));
        remaining -= n;
    }
}

/// Background renderer for a [`HeadlessOutput`]; stops on drop
pub struct Pacer {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Pacer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
