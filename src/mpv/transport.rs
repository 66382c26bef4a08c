//! Local IPC transports: address generation, readiness checks and connections.
//!
//! Each transport kind has one `Endpoint` implementation, chosen when the
//! `TransportConfig` is built.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::PlayerError;

/// Boxed read/write halves of a connected IPC stream.
pub type IpcStream = (
  Box<dyn AsyncRead + Send + Unpin>,
  Box<dyn AsyncWrite + Send + Unpin>,
);

/// Local IPC mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
  UnixSocket,
  NamedPipe,
  Tcp,
}

/// Transport-specific readiness check and connection.
#[async_trait]
pub trait Endpoint: Send + Sync {
  /// One readiness check. Must not leave a connection open.
  async fn is_ready(&self) -> bool;

  /// Extra wait after the first successful check, so the listener is fully bound.
  fn settle_delay(&self) -> Duration;

  /// Default deadline for the endpoint to become ready.
  fn ready_timeout(&self) -> Duration;

  async fn connect(&self) -> io::Result<IpcStream>;
}

/// Endpoint for one playback session.
#[derive(Clone)]
pub struct TransportConfig {
  kind: TransportKind,
  address: String,
  file_backed: bool,
  endpoint: Arc<dyn Endpoint>,
}

impl fmt::Debug for TransportConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TransportConfig")
      .field("kind", &self.kind)
      .field("address", &self.address)
      .field("file_backed", &self.file_backed)
      .finish()
  }
}

impl TransportConfig {
  /// Generate a fresh, unique endpoint of the given kind.
  ///
  /// Unix sockets live at `<temp_dir>/<app>-mpv-<suffix>.sock`, named pipes at
  /// `\\.\pipe\<app>-mpv-<suffix>`. TCP endpoints take a free loopback port.
  pub fn generate(kind: TransportKind, app_name: &str, temp_dir: &Path) -> Result<Self, PlayerError> {
    match kind {
      TransportKind::UnixSocket => {
        let path = temp_dir.join(format!("{}-mpv-{}.sock", app_name, random_suffix()?));
        Ok(Self::unix_socket(path))
      }
      TransportKind::NamedPipe => {
        let name = format!(r"\\.\pipe\{}-mpv-{}", app_name, random_suffix()?);
        Ok(Self::named_pipe(name))
      }
      TransportKind::Tcp => {
        let port = free_loopback_port()?;
        Ok(Self::tcp(format!("127.0.0.1:{}", port)))
      }
    }
  }

  pub fn unix_socket(path: PathBuf) -> Self {
    Self {
      kind: TransportKind::UnixSocket,
      address: path.to_string_lossy().into_owned(),
      file_backed: true,
      endpoint: Arc::new(UnixSocketEndpoint { path }),
    }
  }

  pub fn named_pipe(name: String) -> Self {
    Self {
      kind: TransportKind::NamedPipe,
      address: name.clone(),
      file_backed: false,
      endpoint: Arc::new(NamedPipeEndpoint { name }),
    }
  }

  pub fn tcp(address: String) -> Self {
    Self {
      kind: TransportKind::Tcp,
      address: address.clone(),
      file_backed: false,
      endpoint: Arc::new(TcpEndpoint { address }),
    }
  }

  pub fn kind(&self) -> TransportKind {
    self.kind
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  pub fn is_file_backed(&self) -> bool {
    self.file_backed
  }

  /// mpv argument that starts its IPC server on this endpoint.
  pub fn ipc_server_arg(&self) -> String {
    format!("--input-ipc-server={}", self.address)
  }

  pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
    &self.endpoint
  }

  /// Remove the filesystem artifact, if any.
  pub fn release(&self) {
    if !self.file_backed {
      return;
    }
    match std::fs::remove_file(&self.address) {
      Ok(()) => log::debug!("Removed IPC socket {}", self.address),
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => log::warn!("Failed to remove IPC socket {}: {}", self.address, e),
    }
  }
}

/// 8 random bytes from the OS CSPRNG, hex encoded.
fn random_suffix() -> Result<String, PlayerError> {
  let mut bytes = [0u8; 8];
  getrandom::getrandom(&mut bytes).map_err(|e| PlayerError::AddressGenerationFailed(e.to_string()))?;
  Ok(hex::encode(bytes))
}

fn free_loopback_port() -> Result<u16, PlayerError> {
  let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
    .map_err(|e| PlayerError::AddressGenerationFailed(e.to_string()))?;
  let addr = listener
    .local_addr()
    .map_err(|e| PlayerError::AddressGenerationFailed(e.to_string()))?;
  Ok(addr.port())
}

struct UnixSocketEndpoint {
  path: PathBuf,
}

#[async_trait]
impl Endpoint for UnixSocketEndpoint {
  async fn is_ready(&self) -> bool {
    tokio::fs::try_exists(&self.path).await.unwrap_or(false)
  }

  fn settle_delay(&self) -> Duration {
    Duration::from_millis(100)
  }

  fn ready_timeout(&self) -> Duration {
    Duration::from_secs(5)
  }

  #[cfg(unix)]
  async fn connect(&self) -> io::Result<IpcStream> {
    let stream = tokio::net::UnixStream::connect(&self.path).await?;
    let (reader, writer) = stream.into_split();
    Ok((Box::new(reader), Box::new(writer)))
  }

  #[cfg(not(unix))]
  async fn connect(&self) -> io::Result<IpcStream> {
    Err(io::Error::new(
      io::ErrorKind::Unsupported,
      "Unix sockets are not available on this platform",
    ))
  }
}

struct NamedPipeEndpoint {
  name: String,
}

#[async_trait]
impl Endpoint for NamedPipeEndpoint {
  #[cfg(windows)]
  async fn is_ready(&self) -> bool {
    use tokio::net::windows::named_pipe::ClientOptions;

    // Dropping the client closes the trial connection
    ClientOptions::new().open(&self.name).is_ok()
  }

  #[cfg(not(windows))]
  async fn is_ready(&self) -> bool {
    false
  }

  fn settle_delay(&self) -> Duration {
    Duration::from_millis(300)
  }

  fn ready_timeout(&self) -> Duration {
    Duration::from_secs(10)
  }

  #[cfg(windows)]
  async fn connect(&self) -> io::Result<IpcStream> {
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;

    let client = loop {
      match ClientOptions::new().open(&self.name) {
        Ok(client) => break client,
        Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
          tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(e) => return Err(e),
      }
    };
    let (reader, writer) = tokio::io::split(client);
    Ok((Box::new(reader), Box::new(writer)))
  }

  #[cfg(not(windows))]
  async fn connect(&self) -> io::Result<IpcStream> {
    Err(io::Error::new(
      io::ErrorKind::Unsupported,
      format!("named pipe {} is not reachable from this platform", self.name),
    ))
  }
}

struct TcpEndpoint {
  address: String,
}

#[async_trait]
impl Endpoint for TcpEndpoint {
  async fn is_ready(&self) -> bool {
    tokio::net::TcpStream::connect(&self.address).await.is_ok()
  }

  fn settle_delay(&self) -> Duration {
    Duration::from_millis(300)
  }

  fn ready_timeout(&self) -> Duration {
    Duration::from_secs(10)
  }

  async fn connect(&self) -> io::Result<IpcStream> {
    let stream = tokio::net::TcpStream::connect(&self.address).await?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    Ok((Box::new(reader), Box::new(writer)))
  }
}
