//! Per-request playback options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Options for a single `play` request. Never mutated by the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayOptions {
  /// Start offset in seconds.
  #[serde(default)]
  pub start: Option<f64>,

  /// Volume (0-100).
  #[serde(default)]
  pub volume: Option<u8>,

  /// Playback speed multiplier.
  #[serde(default)]
  pub speed: Option<f64>,

  #[serde(default)]
  pub fullscreen: bool,

  /// External subtitle file path or URL.
  #[serde(default)]
  pub subtitle_file: Option<String>,

  /// Preferred subtitle language (e.g. "eng").
  #[serde(default)]
  pub subtitle_lang: Option<String>,

  /// Subtitle delay in seconds.
  #[serde(default)]
  pub subtitle_delay: Option<f64>,

  /// Audio track id.
  #[serde(default)]
  pub audio_track: Option<u32>,

  /// Raw mpv arguments, passed through after the option-derived flags.
  #[serde(default)]
  pub extra_args: Vec<String>,

  /// Additional HTTP headers for the stream request.
  #[serde(default)]
  pub http_headers: BTreeMap<String, String>,

  #[serde(default)]
  pub referer: Option<String>,

  #[serde(default)]
  pub user_agent: Option<String>,

  /// Title shown in the mpv window and OSD.
  #[serde(default)]
  pub title: Option<String>,
}

impl PlayOptions {
  pub fn with_start(mut self, seconds: f64) -> Self {
    self.start = Some(seconds);
    self
  }

  pub fn with_volume(mut self, volume: u8) -> Self {
    self.volume = Some(volume.min(100));
    self
  }

  pub fn with_title(mut self, title: impl Into<String>) -> Self {
    self.title = Some(title.into());
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.http_headers.insert(name.into(), value.into());
    self
  }
}
