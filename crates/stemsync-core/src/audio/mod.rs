//! Audio outputs for Stemsync
//!
//! Every output owns one device stream (one hardware clock) and a
//! [`VoiceTable`] of mixing slots:
//!
//! - **Shared mixer engine**: one output, one voice per stem. All voices
//!   advance in the same callback, so they cannot drift apart.
//! - **Independent players**: one output per stem, each on its own clock.
//!   These drift and are corrected by the sync manager.
//!
//! # Example Usage
//!
//! ```ignore
//! use stemsync_core::audio::{AudioConfig, CpalOutputProvider, OutputProvider};
//!
//! let provider = CpalOutputProvider::new(AudioConfig::default());
//! let mixer = provider.open("mixer-engine", 32)?;
//! let voice = mixer.voices().allocate()?;
//! mixer.voices().play(voice, buffer);
//! ```

mod config;
mod cpal_backend;
mod device;
mod error;
mod headless;
mod output;
mod voice;

pub use config::{AudioConfig, BufferSize, DeviceId, DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, MAX_BUFFER_SIZE};
pub use cpal_backend::{start_output, AudioHandle};
pub use device::{find_device_by_id, get_cpal_default_device, get_output_devices, AudioDevice};
pub use error::{AudioError, AudioResult};
pub use headless::{HeadlessOutput, Pacer};
pub use output::{CpalOutputProvider, OutputMixer, OutputProvider};
pub use voice::{VoiceId, VoiceState, VoiceTable};
