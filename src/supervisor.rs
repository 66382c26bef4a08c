//! Playback supervisor - owns the lifecycle of one mpv session at a time.
//!
//! `play` spawns mpv and returns while the session is still `Loading`. Three tasks
//! run per session:
//! - the initializer waits for the IPC endpoint and connects (then `Playing`)
//! - the progress monitor polls a snapshot every interval
//! - the exit watcher reaps the process and reports unexpected exits
//!
//! Session state lives behind one `RwLock`. Teardown takes the session out of it,
//! so it runs exactly once per session no matter who triggers it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::PlayerConfig;
use crate::error::PlayerError;
use crate::events::{Listeners, PlayerEvent, Subscription};
use crate::mpv::{
  build_args, launch, locate_executable, redact_url, wait_ready, ChildProcess, IpcClient, IpcError, Launcher,
  SystemLauncher, TransportConfig, TransportKind,
};
use crate::options::PlayOptions;
use crate::platform::{Environment, Platform, SystemEnvironment};
use crate::progress::{fetch_progress, PlaybackProgress};

/// How long the progress monitor leaves a lost connection to the exit watcher.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Transport for new sessions: the configured override, else the platform's choice.
fn transport_kind(config: &PlayerConfig, platform: Platform) -> TransportKind {
  config
    .ipc_transport
    .unwrap_or_else(|| platform.transport_kind(config.wsl_policy))
}

/// Playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlayerState {
  Stopped,
  Loading,
  Playing,
  Paused,
  Error,
}

impl std::fmt::Display for PlayerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      PlayerState::Stopped => "stopped",
      PlayerState::Loading => "loading",
      PlayerState::Playing => "playing",
      PlayerState::Paused => "paused",
      PlayerState::Error => "error",
    };
    f.write_str(name)
  }
}

/// Resources of the live session.
struct Session {
  id: u64,
  /// Stops the initializer and the progress monitor.
  cancel: CancellationToken,
  /// Tells the exit watcher to kill the process.
  kill: CancellationToken,
  pid: Option<u32>,
  transport: TransportConfig,
  ipc: Option<Arc<IpcClient>>,
  url: String,
  options: PlayOptions,
}

struct Shared {
  state: PlayerState,
  session: Option<Session>,
  listeners: Listeners,
}

struct Inner {
  config: PlayerConfig,
  env: Arc<dyn Environment>,
  launcher: Arc<dyn Launcher>,
  platform: Platform,
  shutdown: CancellationToken,
  /// Serializes `play` and `stop` so sessions never overlap.
  lifecycle: tokio::sync::Mutex<()>,
  shared: RwLock<Shared>,
  next_session: AtomicU64,
}

/// Controls an external mpv process.
pub struct Supervisor {
  inner: Arc<Inner>,
}

impl Supervisor {
  /// Supervisor for the real OS.
  pub fn new(config: PlayerConfig) -> Result<Self, PlayerError> {
    Self::with_collaborators(config, Arc::new(SystemEnvironment), Arc::new(SystemLauncher))
  }

  /// Supervisor with injected OS collaborators.
  pub fn with_collaborators(
    config: PlayerConfig,
    env: Arc<dyn Environment>,
    launcher: Arc<dyn Launcher>,
  ) -> Result<Self, PlayerError> {
    config.validate().map_err(PlayerError::Config)?;
    let platform = Platform::resolve(env.as_ref());
    log::info!("Player platform: {}", platform);

    if transport_kind(&config, platform) == TransportKind::NamedPipe && !cfg!(windows) {
      return Err(PlayerError::Config(format!(
        "{} with the {:?} policy needs a named pipe, which this build cannot open; set ipcTransport or use the linux-binary policy",
        platform, config.wsl_policy
      )));
    }

    Ok(Self {
      inner: Arc::new(Inner {
        config,
        env,
        launcher,
        platform,
        shutdown: CancellationToken::new(),
        lifecycle: tokio::sync::Mutex::new(()),
        shared: RwLock::new(Shared {
          state: PlayerState::Stopped,
          session: None,
          listeners: Listeners::default(),
        }),
        next_session: AtomicU64::new(1),
      }),
    })
  }

  pub fn platform(&self) -> Platform {
    self.inner.platform
  }

  /// Start playing `url`, replacing any current session.
  ///
  /// Returns once mpv is spawned. Connection failures after that arrive as
  /// `PlayerEvent::Error`.
  pub async fn play(&self, url: &str, options: PlayOptions) -> Result<(), PlayerError> {
    let inner = &self.inner;
    let _guard = inner.lifecycle.lock().await;
    if inner.shutdown.is_cancelled() {
      return Err(PlayerError::Cancelled);
    }

    inner.stop_current().await;

    let policy = inner.config.wsl_policy;
    let executable = locate_executable(
      &inner.config,
      inner.env.as_ref(),
      inner.platform.executable_name(policy),
    )?;
    let kind = transport_kind(&inner.config, inner.platform);
    let temp_dir = inner
      .config
      .temp_dir
      .as_ref()
      .map(PathBuf::from)
      .unwrap_or_else(|| inner.env.temp_dir());
    let transport = TransportConfig::generate(kind, &inner.config.app_name, &temp_dir)?;
    let args = build_args(&transport, url, &options, &inner.config);

    let child = match launch(inner.launcher.as_ref(), &executable, &args).await {
      Ok(child) => child,
      Err(e) => {
        transport.release();
        return Err(e);
      }
    };

    let id = inner.next_session.fetch_add(1, Ordering::SeqCst);
    let cancel = inner.shutdown.child_token();
    let kill = CancellationToken::new();
    let pid = child.id();
    {
      let mut shared = inner.shared.write();
      shared.session = Some(Session {
        id,
        cancel: cancel.clone(),
        kill: kill.clone(),
        pid,
        transport: transport.clone(),
        ipc: None,
        url: url.to_string(),
        options,
      });
      shared.state = PlayerState::Loading;
    }
    log::info!(
      "Session {} loading {} (pid: {:?}, ipc: {})",
      id,
      redact_url(url),
      pid,
      transport.address()
    );
    inner.emit(PlayerEvent::StateChanged(PlayerState::Loading));

    tokio::spawn(inner.clone().watch_process(id, child, kill));
    tokio::spawn(inner.clone().initialize(id, transport, cancel));
    Ok(())
  }

  /// Stop playback. Idempotent.
  pub async fn stop(&self) -> Result<(), PlayerError> {
    let _guard = self.inner.lifecycle.lock().await;
    self.inner.stop_current().await;
    Ok(())
  }

  /// Seek to an absolute position.
  pub async fn seek(&self, position: Duration) -> Result<(), PlayerError> {
    let ipc = self.inner.client()?;
    ipc
      .set_property("time-pos", position.as_secs_f64().into())
      .await?;
    Ok(())
  }

  /// Current playback snapshot.
  pub async fn get_progress(&self) -> Result<PlaybackProgress, PlayerError> {
    let ipc = self.inner.client()?;
    fetch_progress(&ipc).await
  }

  /// Replace the event subscription. The previous subscription's stream ends.
  pub fn subscribe(&self) -> Subscription {
    let (tx, subscription) = Subscription::channel();
    self.inner.shared.write().listeners.subscriber = Some(tx);
    subscription
  }

  pub fn on_progress_update<F>(&self, callback: F)
  where
    F: Fn(PlaybackProgress) + Send + Sync + 'static,
  {
    self.inner.shared.write().listeners.on_progress = Some(Arc::new(callback));
  }

  pub fn on_playback_end<F>(&self, callback: F)
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.inner.shared.write().listeners.on_end = Some(Arc::new(callback));
  }

  pub fn on_error<F>(&self, callback: F)
  where
    F: Fn(PlayerError) + Send + Sync + 'static,
  {
    self.inner.shared.write().listeners.on_error = Some(Arc::new(callback));
  }

  pub fn state(&self) -> PlayerState {
    self.inner.shared.read().state
  }

  pub fn is_playing(&self) -> bool {
    self.state() == PlayerState::Playing
  }

  pub fn is_paused(&self) -> bool {
    self.state() == PlayerState::Paused
  }

  pub fn current_url(&self) -> Option<String> {
    self.inner.shared.read().session.as_ref().map(|s| s.url.clone())
  }

  pub fn current_options(&self) -> Option<PlayOptions> {
    self.inner.shared.read().session.as_ref().map(|s| s.options.clone())
  }

  /// IPC address of the live session.
  pub fn ipc_address(&self) -> Option<String> {
    self
      .inner
      .shared
      .read()
      .session
      .as_ref()
      .map(|s| s.transport.address().to_string())
  }

  /// Cancel all background work and stop. Later `play` calls fail with `Cancelled`.
  pub async fn shutdown(&self) {
    self.inner.shutdown.cancel();
    let _ = self.stop().await;
  }
}

impl Drop for Supervisor {
  fn drop(&mut self) {
    self.inner.shutdown.cancel();
    let session = {
      let mut shared = self.inner.shared.write();
      shared.state = PlayerState::Stopped;
      shared.session.take()
    };
    if let Some(session) = session {
      log::info!("Supervisor dropped, abandoning session {}", session.id);
      session.cancel.cancel();
      if let Some(ipc) = &session.ipc {
        ipc.close();
      }
      session.kill.cancel();
      session.transport.release();
    }
  }
}

impl Inner {
  fn emit(&self, event: PlayerEvent) {
    let listeners = self.shared.read().listeners.clone();
    listeners.dispatch(event);
  }

  fn client(&self) -> Result<Arc<IpcClient>, PlayerError> {
    let shared = self.shared.read();
    shared
      .session
      .as_ref()
      .and_then(|s| s.ipc.clone())
      .ok_or(PlayerError::NotInitialized)
  }

  /// Tear down whatever session is live. A failed session's `Error` state becomes `Stopped`.
  async fn stop_current(&self) {
    if self.teardown(None, None, PlayerState::Stopped).await {
      return;
    }
    let recovered = {
      let mut shared = self.shared.write();
      if shared.state == PlayerState::Error {
        shared.state = PlayerState::Stopped;
        true
      } else {
        false
      }
    };
    if recovered {
      self.emit(PlayerEvent::StateChanged(PlayerState::Stopped));
    } else {
      log::debug!("Stop requested but player is already stopped");
    }
  }

  /// Release a session's resources. `id = None` targets the live session.
  ///
  /// Returns false when the session was already torn down.
  async fn teardown(&self, id: Option<u64>, error: Option<PlayerError>, final_state: PlayerState) -> bool {
    let taken = {
      let mut shared = self.shared.write();
      match shared.session.take() {
        Some(session) if id.map_or(true, |id| session.id == id) => {
          shared.state = final_state;
          Some((session, shared.listeners.clone()))
        }
        other => {
          shared.session = other;
          None
        }
      }
    };
    let Some((session, listeners)) = taken else {
      return false;
    };

    log::info!(
      "Tearing down session {} (pid: {:?}, state: {})",
      session.id,
      session.pid,
      final_state
    );
    session.cancel.cancel();

    if let Some(err) = error {
      listeners.dispatch(PlayerEvent::Error(err));
    }
    listeners.dispatch(PlayerEvent::StateChanged(final_state));

    if let Some(ipc) = session.ipc {
      match tokio::time::timeout(self.config.quit_timeout(), ipc.quit()).await {
        Ok(Ok(())) => log::debug!("mpv acknowledged quit"),
        Ok(Err(e)) => log::debug!("quit failed: {}", e),
        Err(_) => log::debug!("quit not acknowledged in {:?}", self.config.quit_timeout()),
      }
      ipc.close();
    }

    // The exit watcher kills and reaps
    session.kill.cancel();
    session.transport.release();
    true
  }

  /// Wait for the endpoint, connect, and promote the session to `Playing`.
  async fn initialize(self: Arc<Self>, id: u64, transport: TransportConfig, cancel: CancellationToken) {
    let connect = async {
      wait_ready(&transport, self.config.ready_timeout(), &cancel).await?;
      IpcClient::connect(&transport, self.config.request_timeout())
        .await
        .map_err(|e| match e {
          IpcError::ConnectionFailed(msg) => PlayerError::ConnectFailed(msg),
          other => PlayerError::ConnectFailed(other.to_string()),
        })
    };

    let init_timeout = self.config.init_timeout();
    let result = tokio::select! {
      _ = cancel.cancelled() => Err(PlayerError::Cancelled),
      res = tokio::time::timeout(init_timeout, connect) => res.unwrap_or_else(|_| {
        Err(PlayerError::ReadinessTimeout(format!(
          "{} not connected after {:?}",
          transport.address(),
          init_timeout
        )))
      }),
    };

    let ipc = match result {
      Ok(ipc) => Arc::new(ipc),
      Err(PlayerError::Cancelled) => {
        log::debug!("Initialization of session {} cancelled", id);
        return;
      }
      Err(e) => {
        let e = e.with_transport_hint(transport.kind());
        log::error!("mpv initialization failed: {}", e);
        self.teardown(Some(id), Some(e), PlayerState::Error).await;
        return;
      }
    };

    let promoted = {
      let mut shared = self.shared.write();
      let current = match shared.session.as_mut() {
        Some(session) if session.id == id && !cancel.is_cancelled() => {
          session.ipc = Some(ipc.clone());
          true
        }
        _ => false,
      };
      if current {
        shared.state = PlayerState::Playing;
      }
      current
    };
    if !promoted {
      ipc.close();
      return;
    }

    log::info!("Session {} is playing", id);
    self.emit(PlayerEvent::StateChanged(PlayerState::Playing));
    tokio::spawn(self.monitor_progress(id, ipc, cancel));
  }

  /// Poll progress until cancelled, end of stream, or the connection is gone.
  async fn monitor_progress(self: Arc<Self>, id: u64, ipc: Arc<IpcClient>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(self.config.progress_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {}
      }
      let result = tokio::select! {
        _ = cancel.cancelled() => break,
        res = fetch_progress(&ipc) => res,
      };

      match result {
        Ok(progress) => {
          self.sync_pause_state(id, progress.paused);
          self.emit(PlayerEvent::Progress(progress));
          if progress.eof_reached {
            log::info!("Session {} reached end of stream", id);
            self.emit(PlayerEvent::PlaybackEnded);
            break;
          }
        }
        Err(e) if ipc.is_closed() => {
          log::warn!("mpv IPC connection lost: {}", e);
          // Usually the process is gone and the exit watcher reports it
          if tokio::time::timeout(EXIT_GRACE, cancel.cancelled()).await.is_err() {
            self
              .teardown(
                Some(id),
                Some(PlayerError::Transport(IpcError::Disconnected)),
                PlayerState::Stopped,
              )
              .await;
          }
          break;
        }
        // Open connection that no longer answers, e.g. a wedged named pipe
        Err(e @ PlayerError::DeadTransport { .. }) => {
          log::warn!("mpv stopped answering: {}", e);
          self.teardown(Some(id), Some(e), PlayerState::Stopped).await;
          break;
        }
        Err(e) => log::debug!("Skipping progress tick: {}", e),
      }
    }
    log::debug!("Progress monitor for session {} finished", id);
  }

  /// Follow mpv's pause flag between `Playing` and `Paused`.
  fn sync_pause_state(&self, id: u64, paused: bool) {
    let next = if paused {
      PlayerState::Paused
    } else {
      PlayerState::Playing
    };
    let changed = {
      let mut shared = self.shared.write();
      let current = shared.session.as_ref().is_some_and(|s| s.id == id);
      if current
        && matches!(shared.state, PlayerState::Playing | PlayerState::Paused)
        && shared.state != next
      {
        shared.state = next;
        true
      } else {
        false
      }
    };
    if changed {
      self.emit(PlayerEvent::StateChanged(next));
    }
  }

  /// Sole reaper of the player process.
  async fn watch_process(self: Arc<Self>, id: u64, mut child: Box<dyn ChildProcess>, kill: CancellationToken) {
    let exit = tokio::select! {
      res = child.wait() => res,
      _ = kill.cancelled() => {
        if let Err(e) = child.start_kill() {
          log::warn!("Failed to kill mpv: {}", e);
        }
        child.wait().await
      }
    };
    let description = match &exit {
      Ok(status) => status.to_string(),
      Err(e) => format!("wait failed: {}", e),
    };

    let unexpected = {
      let shared = self.shared.read();
      shared.session.as_ref().is_some_and(|s| s.id == id) && shared.state != PlayerState::Stopped
    };
    if unexpected {
      log::warn!("mpv exited unexpectedly ({})", description);
      self
        .teardown(Some(id), Some(PlayerError::UnexpectedExit(description)), PlayerState::Stopped)
        .await;
    } else {
      log::info!("mpv exited ({})", description);
    }
  }
}
