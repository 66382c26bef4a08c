//! Playback progress snapshots.

use serde::Serialize;

use crate::error::PlayerError;
use crate::mpv::{IpcClient, IpcError, PropertyValue};

const DEFAULT_VOLUME: f64 = 100.0;
const DEFAULT_SPEED: f64 = 1.0;

/// Failures among the four core properties at which the connection is considered dead.
const DEAD_TRANSPORT_FAILURES: usize = 3;

/// Complete playback state at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackProgress {
  /// Position in seconds.
  pub current_time: f64,
  /// Total duration in seconds, 0 when unknown.
  pub duration: f64,
  /// 0-100, 0 when the duration is unknown.
  pub percentage: f64,
  pub paused: bool,
  pub volume: f64,
  pub speed: f64,
  pub eof_reached: bool,
}

impl PlaybackProgress {
  pub fn new(
    current_time: f64,
    duration: f64,
    paused: bool,
    volume: f64,
    speed: f64,
    eof_reached: bool,
  ) -> Self {
    Self {
      current_time,
      duration,
      percentage: percentage(current_time, duration),
      paused,
      volume,
      speed,
      eof_reached,
    }
  }
}

fn percentage(current_time: f64, duration: f64) -> f64 {
  if duration > 0.0 && current_time.is_finite() {
    (current_time / duration) * 100.0
  } else {
    0.0
  }
}

/// Counts failed reads of the core properties.
#[derive(Default)]
struct Reads {
  failures: usize,
}

impl Reads {
  fn core(&mut self, name: &str, result: Result<PropertyValue, IpcError>) -> PropertyValue {
    match result {
      Ok(value) => value,
      Err(e) => {
        log::debug!("Reading {} failed: {}", name, e);
        self.failures += 1;
        PropertyValue::Null
      }
    }
  }
}

/// Read time-pos, duration, pause, eof-reached, volume and speed, in that order.
///
/// Volume and speed fall back to 100 and 1.0. Three or more failures among the
/// first four reads mean the connection is dead and no snapshot is produced.
pub async fn fetch_progress(ipc: &IpcClient) -> Result<PlaybackProgress, PlayerError> {
  let mut reads = Reads::default();

  let time_pos = reads.core("time-pos", ipc.get_property("time-pos").await);
  let duration = reads.core("duration", ipc.get_property("duration").await);
  let pause = reads.core("pause", ipc.get_property("pause").await);
  let eof = reads.core("eof-reached", ipc.get_property("eof-reached").await);

  if reads.failures >= DEAD_TRANSPORT_FAILURES {
    return Err(PlayerError::DeadTransport {
      failures: reads.failures,
    });
  }

  let volume = ipc
    .get_property("volume")
    .await
    .map(|v| v.as_f64_or(DEFAULT_VOLUME))
    .unwrap_or(DEFAULT_VOLUME);
  let speed = ipc
    .get_property("speed")
    .await
    .map(|v| v.as_f64_or(DEFAULT_SPEED))
    .unwrap_or(DEFAULT_SPEED);

  Ok(PlaybackProgress::new(
    time_pos.as_f64_or(0.0),
    duration.as_f64_or(0.0),
    pause.as_bool_or(false),
    volume,
    speed,
    eof.as_bool_or(false),
  ))
}
