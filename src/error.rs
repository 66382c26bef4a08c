//! Player error types.

use thiserror::Error;

use crate::mpv::{IpcError, TransportKind};

const NAMED_PIPE_HINT: &str = "the mpv named pipe never accepted a connection; make sure mpv.exe is a recent \
   build, is not blocked by antivirus software and is not running with different privileges";

/// Errors surfaced by the playback supervisor.
///
/// Pre-flight errors (`ExecutableNotFound`, `AddressGenerationFailed`, `SpawnFailed`) are returned from
/// `play`. Everything that happens after `play` returned is delivered as a `PlayerEvent::Error`.
#[derive(Debug, Clone, Error)]
pub enum PlayerError {
  #[error("mpv executable not found (looked for {0})")]
  ExecutableNotFound(String),

  #[error("Failed to generate IPC address: {0}")]
  AddressGenerationFailed(String),

  #[error("Failed to spawn mpv: {0}")]
  SpawnFailed(String),

  #[error("mpv IPC endpoint was not ready in time: {0}")]
  ReadinessTimeout(String),

  #[error("Failed to connect to mpv IPC: {0}")]
  ConnectFailed(String),

  #[error("IPC error: {0}")]
  Transport(#[from] IpcError),

  #[error("mpv is not responding ({failures} of 4 property reads failed)")]
  DeadTransport { failures: usize },

  #[error("Player not initialized")]
  NotInitialized,

  #[error("mpv exited unexpectedly: {0}")]
  UnexpectedExit(String),

  #[error("Operation cancelled")]
  Cancelled,

  #[error("Invalid configuration: {0}")]
  Config(String),
}

impl PlayerError {
  /// Append installation advice to readiness/connect failures on the named-pipe transport.
  pub(crate) fn with_transport_hint(self, kind: TransportKind) -> Self {
    if kind != TransportKind::NamedPipe {
      return self;
    }
    match self {
      PlayerError::ReadinessTimeout(msg) => {
        PlayerError::ReadinessTimeout(format!("{}; {}", msg, NAMED_PIPE_HINT))
      }
      PlayerError::ConnectFailed(msg) => PlayerError::ConnectFailed(format!("{}; {}", msg, NAMED_PIPE_HINT)),
      other => other,
    }
  }

  /// True for errors that mean the IPC connection is gone rather than a single failed request.
  pub fn is_connection_failure(&self) -> bool {
    matches!(
      self,
      PlayerError::DeadTransport { .. }
        | PlayerError::ConnectFailed(_)
        | PlayerError::Transport(IpcError::Disconnected)
    )
  }
}

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Failed to read config: {0}")]
  Io(#[from] std::io::Error),

  #[error("Invalid config JSON: {0}")]
  Json(#[from] serde_json::Error),

  #[error("{0}")]
  Invalid(String),
}
