//! Configuration files
//!
//! Every configuration type is plain serde YAML with `#[serde(default)]`, so
//! partial files are valid and missing keys take their defaults.

mod io;
mod paths;

pub use io::{load_config, read_config, save_config};
pub use paths::{config_dir, default_config_path, default_volumes_path};
