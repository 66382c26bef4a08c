//! Supervision of an external mpv player.
//!
//! [`Supervisor`] launches mpv detached from the terminal, connects to its JSON IPC
//! over a Unix socket, named pipe or loopback TCP, and exposes play/stop/seek/progress
//! plus an event stream, independent of the host OS.

mod config;
mod error;
mod events;
pub mod mpv;
mod options;
mod platform;
mod progress;
mod supervisor;
pub mod testing;

pub use config::PlayerConfig;
pub use error::{ConfigError, PlayerError};
pub use events::{
  ErrorCallback, PlaybackEndCallback, PlayerEvent, ProgressCallback, Subscription, SUBSCRIPTION_CAPACITY,
};
pub use options::PlayOptions;
pub use platform::{Environment, Platform, SystemEnvironment, WslPolicy};
pub use progress::{fetch_progress, PlaybackProgress};
pub use supervisor::{PlayerState, Supervisor};
