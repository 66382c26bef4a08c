//! Fakes for exercising the supervisor without a real mpv binary.
//!
//! - `FakeMpv`: in-process JSON IPC server answering `get_property`, `set_property` and `quit`
//! - `FakeLauncher`: `Launcher` whose "processes" are tasks serving `FakeMpv` on the requested endpoint
//! - `FakeEnvironment`: `Environment` with a fixed temp dir, kernel string and executable table

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::mpv::{ChildProcess, Launcher, ProcessExit};
use crate::platform::Environment;

static NEXT_PID: AtomicU32 = AtomicU32::new(40_000);

const KILLED: ProcessExit = ProcessExit {
  code: None,
  success: false,
};

const QUIT: ProcessExit = ProcessExit {
  code: Some(0),
  success: true,
};

struct FakeMpvState {
  properties: Mutex<HashMap<String, Value>>,
  failing: Mutex<HashSet<String>>,
  quit: AtomicBool,
  disconnect: CancellationToken,
  on_quit: Mutex<Option<Box<dyn Fn() + Send>>>,
}

/// Builder for a fake mpv IPC server.
pub struct FakeMpv {
  properties: HashMap<String, Value>,
  failing: HashSet<String>,
}

impl FakeMpv {
  /// A player that has a two-minute file loaded and is playing.
  pub fn new() -> Self {
    let properties = [
      ("time-pos", json!(0.0)),
      ("duration", json!(120.0)),
      ("pause", json!(false)),
      ("eof-reached", json!(false)),
      ("volume", json!(100.0)),
      ("speed", json!(1.0)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    Self {
      properties,
      failing: HashSet::new(),
    }
  }

  pub fn with_property(mut self, name: &str, value: impl Into<Value>) -> Self {
    self.properties.insert(name.to_string(), value.into());
    self
  }

  /// Reads of `name` answer "property unavailable".
  pub fn failing(mut self, name: &str) -> Self {
    self.failing.insert(name.to_string());
    self
  }

  fn into_state(self) -> Arc<FakeMpvState> {
    Arc::new(FakeMpvState {
      properties: Mutex::new(self.properties),
      failing: Mutex::new(self.failing),
      quit: AtomicBool::new(false),
      disconnect: CancellationToken::new(),
      on_quit: Mutex::new(None),
    })
  }

  /// Serve a single connection, e.g. one half of `tokio::io::duplex`.
  pub fn serve<S>(self, io: S) -> FakeMpvHandle
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let state = self.into_state();
    tokio::spawn(serve_connection(state.clone(), io));
    FakeMpvHandle { state }
  }
}

impl Default for FakeMpv {
  fn default() -> Self {
    Self::new()
  }
}

/// Control handle for a running `FakeMpv`.
#[derive(Clone)]
pub struct FakeMpvHandle {
  state: Arc<FakeMpvState>,
}

impl FakeMpvHandle {
  pub fn property(&self, name: &str) -> Option<Value> {
    self.state.properties.lock().get(name).cloned()
  }

  pub fn set_property(&self, name: &str, value: impl Into<Value>) {
    self.state.properties.lock().insert(name.to_string(), value.into());
  }

  pub fn set_failing(&self, name: &str, failing: bool) {
    let mut set = self.state.failing.lock();
    if failing {
      set.insert(name.to_string());
    } else {
      set.remove(name);
    }
  }

  pub fn quit_received(&self) -> bool {
    self.state.quit.load(Ordering::SeqCst)
  }

  /// Drop every open connection and refuse to answer further requests.
  pub fn disconnect(&self) {
    self.state.disconnect.cancel();
  }
}

async fn serve_connection<S>(state: Arc<FakeMpvState>, io: S)
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  let (reader, mut writer) = tokio::io::split(io);
  let mut lines = BufReader::new(reader).lines();

  loop {
    let line = tokio::select! {
      biased;
      _ = state.disconnect.cancelled() => break,
      line = lines.next_line() => line,
    };
    let line = match line {
      Ok(Some(line)) => line,
      _ => break,
    };
    if line.trim().is_empty() {
      continue;
    }

    let (reply, quit) = handle_request(&state, &line);
    let mut out = reply.to_string();
    out.push('\n');
    if writer.write_all(out.as_bytes()).await.is_err() {
      break;
    }
    if quit {
      state.quit.store(true, Ordering::SeqCst);
      if let Some(on_quit) = state.on_quit.lock().as_ref() {
        on_quit();
      }
      break;
    }
  }
}

fn handle_request(state: &FakeMpvState, line: &str) -> (Value, bool) {
  let request: Value = match serde_json::from_str(line) {
    Ok(v) => v,
    Err(_) => return (json!({"error": "invalid parameter"}), false),
  };
  let request_id = request.get("request_id").cloned().unwrap_or(Value::Null);
  let command = request
    .get("command")
    .and_then(Value::as_array)
    .cloned()
    .unwrap_or_default();

  let reply = |error: &str, data: Option<Value>| {
    let mut reply = json!({"error": error, "request_id": request_id});
    if let Some(data) = data {
      reply["data"] = data;
    }
    reply
  };

  match command.first().and_then(Value::as_str) {
    Some("get_property") => {
      let name = command.get(1).and_then(Value::as_str).unwrap_or_default();
      if state.failing.lock().contains(name) {
        return (reply("property unavailable", None), false);
      }
      match state.properties.lock().get(name) {
        Some(value) => (reply("success", Some(value.clone())), false),
        None => (reply("property unavailable", None), false),
      }
    }
    Some("set_property") => {
      let name = command.get(1).and_then(Value::as_str).unwrap_or_default();
      let value = command.get(2).cloned().unwrap_or(Value::Null);
      state.properties.lock().insert(name.to_string(), value);
      (reply("success", None), false)
    }
    Some("quit") => (reply("success", None), true),
    _ => (reply("invalid parameter", None), false),
  }
}

/// One fake player process started by `FakeLauncher`.
#[derive(Clone)]
pub struct FakeProcess {
  pub pid: u32,
  pub args: Vec<String>,
  /// IPC address taken from `--input-ipc-server`.
  pub address: String,
  pub mpv: FakeMpvHandle,
  exit: Arc<watch::Sender<Option<ProcessExit>>>,
}

impl FakeProcess {
  /// Simulate the process being killed from outside.
  pub fn crash(&self) {
    exit_with(&self.exit, KILLED);
  }

  pub fn is_running(&self) -> bool {
    self.exit.borrow().is_none()
  }

  pub fn exit_status(&self) -> Option<ProcessExit> {
    *self.exit.borrow()
  }
}

fn exit_with(exit: &watch::Sender<Option<ProcessExit>>, status: ProcessExit) {
  exit.send_if_modified(|current| {
    if current.is_none() {
      *current = Some(status);
      true
    } else {
      false
    }
  });
}

#[derive(Default)]
struct LaunchBehavior {
  fail_spawn: bool,
  exit_immediately: bool,
  never_listen: bool,
  startup_delay: Duration,
}

/// `Launcher` that serves a `FakeMpv` instead of spawning a binary.
#[derive(Clone, Default)]
pub struct FakeLauncher {
  behavior: Arc<Mutex<LaunchBehavior>>,
  processes: Arc<Mutex<Vec<FakeProcess>>>,
}

impl FakeLauncher {
  pub fn new() -> Self {
    Self::default()
  }

  /// `spawn` itself fails, as with a missing binary.
  pub fn fail_spawn(self) -> Self {
    self.behavior.lock().fail_spawn = true;
    self
  }

  /// The process dies before the spawn grace period ends.
  pub fn exit_immediately(self) -> Self {
    self.behavior.lock().exit_immediately = true;
    self
  }

  /// The process runs but never opens its IPC endpoint.
  pub fn never_listen(self) -> Self {
    self.behavior.lock().never_listen = true;
    self
  }

  /// Delay before the IPC endpoint is opened.
  pub fn startup_delay(self, delay: Duration) -> Self {
    self.behavior.lock().startup_delay = delay;
    self
  }

  /// Every process spawned so far, oldest first.
  pub fn processes(&self) -> Vec<FakeProcess> {
    self.processes.lock().clone()
  }

  pub fn last(&self) -> Option<FakeProcess> {
    self.processes.lock().last().cloned()
  }
}

impl Launcher for FakeLauncher {
  fn spawn(&self, executable: &Path, args: &[String]) -> io::Result<Box<dyn ChildProcess>> {
    let (fail_spawn, exit_immediately, never_listen, startup_delay) = {
      let b = self.behavior.lock();
      (b.fail_spawn, b.exit_immediately, b.never_listen, b.startup_delay)
    };
    if fail_spawn {
      return Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", executable.display()),
      ));
    }

    let address = args
      .iter()
      .find_map(|a| a.strip_prefix("--input-ipc-server="))
      .unwrap_or_default()
      .to_string();

    let state = FakeMpv::new().into_state();
    // Reflect the option flags mpv would honour
    for (flag, property) in [("--volume=", "volume"), ("--start=", "time-pos"), ("--speed=", "speed")] {
      let value = args
        .iter()
        .find_map(|a| a.strip_prefix(flag))
        .and_then(|v| v.parse::<f64>().ok());
      if let Some(value) = value {
        state.properties.lock().insert(property.to_string(), json!(value));
      }
    }
    let (exit_tx, exit_rx) = watch::channel(None);
    let exit = Arc::new(exit_tx);

    let quit_exit = exit.clone();
    *state.on_quit.lock() = Some(Box::new(move || exit_with(&quit_exit, QUIT)));

    let process = FakeProcess {
      pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
      args: args.to_vec(),
      address: address.clone(),
      mpv: FakeMpvHandle {
        state: state.clone(),
      },
      exit: exit.clone(),
    };

    if exit_immediately {
      exit_with(&exit, ProcessExit {
        code: Some(1),
        success: false,
      });
    } else {
      tokio::spawn(run_process(state, address, exit_rx.clone(), never_listen, startup_delay));
    }

    self.processes.lock().push(process.clone());
    Ok(Box::new(FakeChild {
      pid: process.pid,
      exit,
      exit_rx,
    }))
  }
}

/// Lifetime of a fake process: open the endpoint, serve clients, clean up on exit.
async fn run_process(
  state: Arc<FakeMpvState>,
  address: String,
  mut exit_rx: watch::Receiver<Option<ProcessExit>>,
  never_listen: bool,
  startup_delay: Duration,
) {
  let serve = async {
    if never_listen {
      return std::future::pending::<()>().await;
    }
    tokio::time::sleep(startup_delay).await;
    if let Err(e) = accept_loop(&state, &address).await {
      log::warn!("Fake mpv failed to listen on {}: {}", address, e);
      std::future::pending::<()>().await;
    }
  };

  tokio::select! {
    _ = serve => {}
    _ = exit_rx.wait_for(|exit| exit.is_some()) => {}
  }

  state.disconnect.cancel();
  if address.parse::<std::net::SocketAddr>().is_err() {
    let _ = std::fs::remove_file(&address);
  }
}

async fn accept_loop(state: &Arc<FakeMpvState>, address: &str) -> io::Result<()> {
  if let Ok(addr) = address.parse::<std::net::SocketAddr>() {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    loop {
      let (stream, _) = listener.accept().await?;
      tokio::spawn(serve_connection(state.clone(), stream));
    }
  }
  accept_unix(state, address).await
}

#[cfg(unix)]
async fn accept_unix(state: &Arc<FakeMpvState>, address: &str) -> io::Result<()> {
  let listener = tokio::net::UnixListener::bind(address)?;
  loop {
    let (stream, _) = listener.accept().await?;
    tokio::spawn(serve_connection(state.clone(), stream));
  }
}

#[cfg(not(unix))]
async fn accept_unix(_state: &Arc<FakeMpvState>, _address: &str) -> io::Result<()> {
  Err(io::Error::new(
    io::ErrorKind::Unsupported,
    "fake mpv only listens on TCP here",
  ))
}

struct FakeChild {
  pid: u32,
  exit: Arc<watch::Sender<Option<ProcessExit>>>,
  exit_rx: watch::Receiver<Option<ProcessExit>>,
}

#[async_trait]
impl ChildProcess for FakeChild {
  fn id(&self) -> Option<u32> {
    Some(self.pid)
  }

  fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
    Ok(*self.exit_rx.borrow())
  }

  async fn wait(&mut self) -> io::Result<ProcessExit> {
    let exit = self
      .exit_rx
      .wait_for(|exit| exit.is_some())
      .await
      .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok((*exit).unwrap_or(KILLED))
  }

  fn start_kill(&mut self) -> io::Result<()> {
    exit_with(&self.exit, KILLED);
    Ok(())
  }
}

/// `Environment` with fixed answers.
#[derive(Debug, Clone)]
pub struct FakeEnvironment {
  temp_dir: PathBuf,
  kernel_identification: Option<String>,
  executables: HashMap<String, PathBuf>,
}

impl FakeEnvironment {
  pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
    Self {
      temp_dir: temp_dir.into(),
      kernel_identification: None,
      executables: HashMap::new(),
    }
  }

  pub fn with_kernel_identification(mut self, ident: &str) -> Self {
    self.kernel_identification = Some(ident.to_string());
    self
  }

  pub fn with_executable(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
    self.executables.insert(name.to_string(), path.into());
    self
  }

  /// Registers both `mpv` and `mpv.exe`.
  pub fn with_mpv(self) -> Self {
    self
      .with_executable("mpv", "/usr/bin/mpv")
      .with_executable("mpv.exe", r"C:\mpv\mpv.exe")
  }
}

impl Environment for FakeEnvironment {
  fn kernel_identification(&self) -> Option<String> {
    self.kernel_identification.clone()
  }

  fn temp_dir(&self) -> PathBuf {
    self.temp_dir.clone()
  }

  fn find_executable(&self, name: &str) -> Option<PathBuf> {
    self.executables.get(name).cloned()
  }
}
