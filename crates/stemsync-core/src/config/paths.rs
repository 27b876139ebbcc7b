//! Standard locations of stemsync files

use std::path::PathBuf;

const APP_DIR: &str = "stemsync";

/// `~/.config/stemsync` (or the platform equivalent)
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(APP_DIR)
}

/// Main configuration file: `~/.config/stemsync/config.yaml`
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

/// Per-track volume settings: `~/.config/stemsync/volumes.yaml`
pub fn default_volumes_path() -> PathBuf {
    config_dir().join("volumes.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_live_in_app_dir() {
        assert!(default_config_path().ends_with("stemsync/config.yaml"));
        assert!(default_volumes_path().ends_with("stemsync/volumes.yaml"));
    }
}
