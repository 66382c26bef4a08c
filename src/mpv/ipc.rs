//! Async IPC connection to MPV.
//!
//! Requests are matched to responses by `request_id`. Losing the connection fails every pending
//! and future request with `IpcError::Disconnected`; nothing is retried here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::protocol::{MpvCommand, MpvMessage, MpvResponse, PropertyValue};
use super::transport::TransportConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Write failed: {0}")]
  WriteFailed(String),
  #[error("Command timeout")]
  Timeout,
  #[error("MPV error: {0}")]
  MpvError(String),
  #[error("Disconnected")]
  Disconnected,
}

/// Pending request waiting for response.
type PendingRequest = oneshot::Sender<Result<MpvResponse, IpcError>>;

/// IPC connection state shared between the client and the reader task.
struct IpcState {
  pending: HashMap<u64, PendingRequest>,
}

/// Writer channel message.
enum WriteMessage {
  Command(Vec<u8>),
  Close,
}

/// MPV IPC client bound to one connection.
pub struct IpcClient {
  state: Arc<Mutex<IpcState>>,
  closed: Arc<AtomicBool>,
  write_tx: async_channel::Sender<WriteMessage>,
  request_timeout: Duration,
  reader_handle: JoinHandle<()>,
  _writer_handle: JoinHandle<()>,
}

impl IpcClient {
  /// Connect to the endpoint described by `transport`.
  pub async fn connect(transport: &TransportConfig, request_timeout: Duration) -> Result<Self, IpcError> {
    let (reader, writer) = transport
      .endpoint()
      .connect()
      .await
      .map_err(|e| IpcError::ConnectionFailed(format!("{}: {}", transport.address(), e)))?;
    log::info!("Connected to mpv IPC at {}", transport.address());
    Ok(Self::from_stream(reader, writer, request_timeout))
  }

  /// Wrap an already-connected stream. Must be called inside a tokio runtime.
  pub fn from_stream<R, W>(reader: R, writer: W, request_timeout: Duration) -> Self
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    let state = Arc::new(Mutex::new(IpcState {
      pending: HashMap::new(),
    }));
    let closed = Arc::new(AtomicBool::new(false));

    let (write_tx, write_rx) = async_channel::unbounded::<WriteMessage>();

    let reader_state = state.clone();
    let reader_closed = closed.clone();
    let reader_handle = tokio::spawn(async move {
      Self::reader_loop(reader, reader_state.clone()).await;
      reader_closed.store(true, Ordering::SeqCst);
      // Fail everything still waiting
      let pending: Vec<_> = reader_state.lock().pending.drain().collect();
      for (_, tx) in pending {
        let _ = tx.send(Err(IpcError::Disconnected));
      }
    });

    let writer_closed = closed.clone();
    let writer_handle = tokio::spawn(async move {
      Self::writer_loop(writer, write_rx).await;
      writer_closed.store(true, Ordering::SeqCst);
    });

    Self {
      state,
      closed,
      write_tx,
      request_timeout,
      reader_handle,
      _writer_handle: writer_handle,
    }
  }

  async fn reader_loop<R: AsyncRead + Unpin>(reader: R, state: Arc<Mutex<IpcState>>) {
    log::debug!("MPV IPC reader loop started");
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
      line.clear();
      match buf_reader.read_line(&mut line).await {
        Ok(0) => {
          log::info!("MPV IPC connection closed");
          break;
        }
        Ok(_) => {
          let trimmed = line.trim();
          if trimmed.is_empty() {
            continue;
          }

          match MpvMessage::parse(trimmed) {
            Ok(MpvMessage::Response(response)) => {
              let tx = state.lock().pending.remove(&response.request_id);
              if let Some(tx) = tx {
                let _ = tx.send(Ok(response));
              }
            }
            Ok(MpvMessage::Event(name)) => log::trace!("MPV event: {}", name),
            Err(e) => {
              log::warn!("Failed to parse MPV message: {} - {}", e, trimmed);
            }
          }
        }
        Err(e) => {
          log::error!("MPV IPC read error: {}", e);
          break;
        }
      }
    }
  }

  async fn writer_loop<W: AsyncWrite + Unpin>(mut writer: W, write_rx: async_channel::Receiver<WriteMessage>) {
    while let Ok(msg) = write_rx.recv().await {
      match msg {
        WriteMessage::Command(mut data) => {
          data.push(b'\n');
          if let Err(e) = writer.write_all(&data).await {
            log::error!("MPV IPC write error: {}", e);
            break;
          }
          if let Err(e) = writer.flush().await {
            log::error!("MPV IPC flush error: {}", e);
            break;
          }
        }
        WriteMessage::Close => {
          log::debug!("MPV IPC writer closing");
          let _ = writer.shutdown().await;
          break;
        }
      }
    }
  }

  /// True once the connection is gone. Terminal.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Send a command to MPV and wait for the raw response.
  async fn send_command(&self, cmd: MpvCommand) -> Result<MpvResponse, IpcError> {
    if self.is_closed() {
      return Err(IpcError::Disconnected);
    }
    let request_id = cmd.request_id;

    let (tx, rx) = oneshot::channel();
    self.state.lock().pending.insert(request_id, tx);
    // The reader marks the connection closed before draining `pending`
    if self.is_closed() {
      self.state.lock().pending.remove(&request_id);
      return Err(IpcError::Disconnected);
    }

    let json = match serde_json::to_string(&cmd) {
      Ok(json) => json,
      Err(e) => {
        self.state.lock().pending.remove(&request_id);
        return Err(IpcError::WriteFailed(e.to_string()));
      }
    };
    log::trace!("Sending MPV command: {}", json);

    if self.write_tx.send(WriteMessage::Command(json.into_bytes())).await.is_err() {
      self.state.lock().pending.remove(&request_id);
      return Err(IpcError::Disconnected);
    }

    match tokio::time::timeout(self.request_timeout, rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(IpcError::Disconnected),
      Err(_) => {
        log::debug!("MPV command timeout, request_id={}", request_id);
        self.state.lock().pending.remove(&request_id);
        Err(IpcError::Timeout)
      }
    }
  }

  /// Issue a command and return its data. A non-success reply is an `MpvError`.
  pub async fn request(&self, args: Vec<serde_json::Value>) -> Result<Option<serde_json::Value>, IpcError> {
    let response = self.send_command(MpvCommand::new(args)).await?;
    response.into_result().map_err(IpcError::MpvError)
  }

  /// Get a property value.
  pub async fn get_property(&self, name: &str) -> Result<PropertyValue, IpcError> {
    let response = self.send_command(MpvCommand::get_property(name)).await?;
    let data = response.into_result().map_err(IpcError::MpvError)?;
    Ok(data.map_or(PropertyValue::Null, PropertyValue::from))
  }

  /// Set a property value.
  pub async fn set_property(&self, name: &str, value: serde_json::Value) -> Result<(), IpcError> {
    let response = self.send_command(MpvCommand::set_property(name, value)).await?;
    response.into_result().map(|_| ()).map_err(IpcError::MpvError)
  }

  /// Ask MPV to quit.
  pub async fn quit(&self) -> Result<(), IpcError> {
    match self.send_command(MpvCommand::quit()).await {
      Ok(_) => Ok(()),
      // mpv may close the connection before replying to quit
      Err(IpcError::Disconnected) => Ok(()),
      Err(e) => Err(e),
    }
  }

  /// Close the connection.
  pub fn close(&self) {
    let _ = self.write_tx.try_send(WriteMessage::Close);
  }
}

impl Drop for IpcClient {
  fn drop(&mut self) {
    self.write_tx.close();
    self.reader_handle.abort();
  }
}
