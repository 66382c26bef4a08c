//! Player configuration with persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mpv::TransportKind;
use crate::platform::WslPolicy;

const CONFIG_DIR_NAME: &str = "mpvctl";
const CONFIG_FILE_NAME: &str = "player.json";

/// Player configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub mpv_path: Option<String>,

  /// Additional MPV command-line arguments for every launch.
  #[serde(default)]
  pub mpv_args: Vec<String>,

  /// Prefix for IPC socket and pipe names.
  #[serde(default = "default_app_name")]
  pub app_name: String,

  /// Let mpv read the user's mpv.conf and scripts.
  #[serde(default)]
  pub load_user_config: bool,

  /// Keep mpv's own logging enabled.
  #[serde(default)]
  pub debug: bool,

  /// mpv log file, only used in debug mode.
  #[serde(default)]
  pub mpv_log_file: Option<String>,

  /// Which binary to drive under WSL.
  #[serde(default)]
  pub wsl_policy: WslPolicy,

  /// Force a transport kind instead of the platform default.
  #[serde(default)]
  pub ipc_transport: Option<TransportKind>,

  /// Overall deadline for spawn-to-connected, in seconds.
  #[serde(default = "default_init_timeout")]
  pub init_timeout_secs: u32,

  /// Override of the per-transport readiness deadline, in seconds.
  #[serde(default)]
  pub ready_timeout_secs: Option<u32>,

  /// Deadline for a single IPC request, in seconds.
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u32,

  /// Progress polling interval in milliseconds.
  #[serde(default = "default_progress_interval")]
  pub progress_interval_ms: u64,

  /// How long `stop` waits for mpv to acknowledge `quit`, in milliseconds.
  #[serde(default = "default_quit_timeout")]
  pub quit_timeout_ms: u64,

  /// Directory for IPC sockets (None = system temp directory).
  #[serde(default)]
  pub temp_dir: Option<String>,
}

fn default_app_name() -> String {
  "mpvctl".to_string()
}

fn default_init_timeout() -> u32 {
  15
}

fn default_request_timeout() -> u32 {
  5
}

fn default_progress_interval() -> u64 {
  1000
}

fn default_quit_timeout() -> u64 {
  500
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self {
      mpv_path: None,
      mpv_args: Vec::new(),
      app_name: default_app_name(),
      load_user_config: false,
      debug: false,
      mpv_log_file: None,
      wsl_policy: WslPolicy::default(),
      ipc_transport: None,
      init_timeout_secs: default_init_timeout(),
      ready_timeout_secs: None,
      request_timeout_secs: default_request_timeout(),
      progress_interval_ms: default_progress_interval(),
      quit_timeout_ms: default_quit_timeout(),
      temp_dir: None,
    }
  }
}

impl PlayerConfig {
  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if self.app_name.trim().is_empty() {
      return Err("App name cannot be empty".to_string());
    }
    if !self
      .app_name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
      return Err("App name may only contain letters, digits, '-' and '_'".to_string());
    }
    if self.init_timeout_secs < 1 || self.init_timeout_secs > 120 {
      return Err("Init timeout must be between 1 and 120 seconds".to_string());
    }
    if let Some(ready) = self.ready_timeout_secs {
      if ready < 1 || ready > self.init_timeout_secs {
        return Err("Ready timeout must be between 1 second and the init timeout".to_string());
      }
    }
    if self.request_timeout_secs < 1 || self.request_timeout_secs > 60 {
      return Err("Request timeout must be between 1 and 60 seconds".to_string());
    }
    if self.progress_interval_ms < 50 || self.progress_interval_ms > 60_000 {
      return Err("Progress interval must be between 50 ms and 60 seconds".to_string());
    }
    if self.quit_timeout_ms > 10_000 {
      return Err("Quit timeout must be at most 10 seconds".to_string());
    }
    if self.ipc_transport == Some(TransportKind::NamedPipe) && !cfg!(windows) {
      return Err("Named pipes are only available on Windows".to_string());
    }
    Ok(())
  }

  pub fn init_timeout(&self) -> Duration {
    Duration::from_secs(self.init_timeout_secs.into())
  }

  pub fn ready_timeout(&self) -> Option<Duration> {
    self.ready_timeout_secs.map(|s| Duration::from_secs(s.into()))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs.into())
  }

  pub fn progress_interval(&self) -> Duration {
    Duration::from_millis(self.progress_interval_ms)
  }

  pub fn quit_timeout(&self) -> Duration {
    Duration::from_millis(self.quit_timeout_ms)
  }

  /// Default config file location, e.g. `~/.config/mpvctl/player.json`.
  pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
  }

  /// Load and validate a config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let config: PlayerConfig = serde_json::from_str(&text)?;
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
  }

  /// Load from the default location, falling back to defaults when missing or invalid.
  pub fn load_or_default() -> Self {
    let Some(path) = Self::default_path() else {
      return Self::default();
    };
    if !path.exists() {
      log::debug!("No config at {:?}, using defaults", path);
      return Self::default();
    }
    match Self::load(&path) {
      Ok(config) => {
        log::info!("Loaded config from {:?}", path);
        config
      }
      Err(e) => {
        log::warn!("Ignoring config at {:?}: {}", path, e);
        Self::default()
      }
    }
  }

  /// Write the config as pretty JSON, creating parent directories.
  pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(self)?;
    std::fs::write(path, json)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = PlayerConfig::default();
    config.validate().unwrap();
    assert_eq!(config.progress_interval(), Duration::from_secs(1));
    assert_eq!(config.app_name, "mpvctl");
    assert_eq!(config.wsl_policy, WslPolicy::LinuxBinary);
  }

  #[test]
  fn test_partial_json_uses_defaults() {
    let config: PlayerConfig =
      serde_json::from_str(r#"{"mpvArgs":["--hwdec=auto"],"wslPolicy":"windows-binary"}"#).unwrap();
    assert_eq!(config.mpv_args, vec!["--hwdec=auto".to_string()]);
    assert_eq!(config.wsl_policy, WslPolicy::WindowsBinary);
    assert_eq!(config.init_timeout_secs, 15);
    assert_eq!(config.request_timeout_secs, 5);
  }

  #[test]
  fn test_validation() {
    let bad_name = PlayerConfig {
      app_name: "../evil".into(),
      ..PlayerConfig::default()
    };
    assert!(bad_name.validate().is_err());

    let bad_interval = PlayerConfig {
      progress_interval_ms: 10,
      ..PlayerConfig::default()
    };
    assert!(bad_interval.validate().is_err());

    let bad_ready = PlayerConfig {
      ready_timeout_secs: Some(30),
      ..PlayerConfig::default()
    };
    assert!(bad_ready.validate().is_err());
  }

  #[test]
  fn test_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("player.json");
    let config = PlayerConfig {
      mpv_path: Some("/usr/bin/mpv".into()),
      debug: true,
      ..PlayerConfig::default()
    };
    config.save(&path).unwrap();
    assert_eq!(PlayerConfig::load(&path).unwrap(), config);
  }

  #[test]
  fn test_load_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player.json");
    std::fs::write(&path, r#"{"initTimeoutSecs":0}"#).unwrap();
    assert!(matches!(PlayerConfig::load(&path), Err(ConfigError::Invalid(_))));
  }
}
