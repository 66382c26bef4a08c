//! MPV IPC module - spawns and controls an external MPV player via JSON IPC.
//!
//! Architecture:
//! - `process.rs` - MPV binary lookup, argument building and process spawning
//! - `transport.rs` - Per-session IPC endpoints (Unix sockets, Named Pipes, TCP loopback)
//! - `probe.rs` - Waits for the endpoint to accept connections
//! - `ipc.rs` - Async request/response client over a connected endpoint
//! - `protocol.rs` - JSON command/response types and serialization

mod ipc;
mod probe;
mod process;
mod protocol;
mod transport;

pub use ipc::{IpcClient, IpcError};
pub use probe::wait_ready;
pub use process::{
  build_args, launch, locate_executable, ChildProcess, Launcher, ProcessExit, SystemLauncher,
  DEFAULT_USER_AGENT, SPAWN_GRACE,
};
pub(crate) use process::redact_url;
pub use protocol::{MpvCommand, MpvMessage, MpvResponse, PropertyValue};
pub use transport::{Endpoint, IpcStream, TransportConfig, TransportKind};
