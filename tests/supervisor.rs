//! Supervisor lifecycle against the in-process fake player.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mpvctl::mpv::{IpcError, TransportKind};
use mpvctl::testing::{FakeEnvironment, FakeLauncher};
use mpvctl::{PlayOptions, PlayerConfig, PlayerError, PlayerEvent, PlayerState, Subscription, Supervisor};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> PlayerConfig {
  PlayerConfig {
    progress_interval_ms: 50,
    ..PlayerConfig::default()
  }
}

fn supervisor(dir: &Path, config: PlayerConfig, launcher: &FakeLauncher) -> Supervisor {
  let env = FakeEnvironment::new(dir).with_mpv();
  Supervisor::with_collaborators(config, Arc::new(env), Arc::new(launcher.clone())).unwrap()
}

async fn next_matching<F>(events: &Subscription, pred: F) -> PlayerEvent
where
  F: Fn(&PlayerEvent) -> bool,
{
  tokio::time::timeout(WAIT, async {
    loop {
      match events.recv().await {
        Some(event) if pred(&event) => return event,
        Some(_) => continue,
        None => panic!("subscription closed"),
      }
    }
  })
  .await
  .expect("timed out waiting for event")
}

async fn wait_playing(events: &Subscription) {
  next_matching(events, |e| matches!(e, PlayerEvent::StateChanged(PlayerState::Playing))).await;
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
  for _ in 0..200 {
    if check() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  check()
}

fn drain(events: &Subscription) -> Vec<PlayerEvent> {
  std::iter::from_fn(|| events.try_recv()).collect()
}

#[cfg(unix)]
#[tokio::test]
async fn test_play_seek_stop() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);
  let events = player.subscribe();

  player
    .play("test://src", PlayOptions::default().with_volume(0))
    .await
    .unwrap();
  assert_eq!(player.state(), PlayerState::Loading);
  assert_eq!(player.current_url().as_deref(), Some("test://src"));
  assert_eq!(player.current_options().and_then(|o| o.volume), Some(0));

  let address = player.ipc_address().unwrap();
  assert!(address.starts_with(&dir.path().display().to_string()));
  assert!(address.ends_with(".sock"));

  wait_playing(&events).await;
  assert!(player.is_playing());

  let progress = player.get_progress().await.unwrap();
  assert!(!progress.paused);
  assert!(progress.volume.abs() < f64::EPSILON);
  assert!((progress.duration - 120.0).abs() < f64::EPSILON);

  player.seek(Duration::from_secs(3)).await.unwrap();
  let progress = player.get_progress().await.unwrap();
  assert!((progress.current_time - 3.0).abs() < 1e-6);
  assert!((progress.percentage - 2.5).abs() < 1e-6);

  player.stop().await.unwrap();
  assert!(!player.is_playing());
  assert_eq!(player.state(), PlayerState::Stopped);
  assert!(player.ipc_address().is_none());
  assert!(!Path::new(&address).exists());

  let process = launcher.last().unwrap();
  assert!(eventually(|| process.mpv.quit_received()).await);
  assert!(eventually(|| !process.is_running()).await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_is_idempotent() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);
  let events = player.subscribe();

  player.play("test://src", PlayOptions::default()).await.unwrap();
  wait_playing(&events).await;
  drain(&events);

  player.stop().await.unwrap();
  player.stop().await.unwrap();
  tokio::time::sleep(Duration::from_millis(200)).await;

  let seen = drain(&events);
  let stopped = seen
    .iter()
    .filter(|e| matches!(e, PlayerEvent::StateChanged(PlayerState::Stopped)))
    .count();
  assert_eq!(stopped, 1);
  assert!(!seen.iter().any(|e| matches!(e, PlayerEvent::Error(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn test_play_replaces_running_session() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);
  let events = player.subscribe();

  player.play("test://first", PlayOptions::default()).await.unwrap();
  wait_playing(&events).await;
  let first_address = player.ipc_address().unwrap();

  player.play("test://second", PlayOptions::default()).await.unwrap();
  let second_address = player.ipc_address().unwrap();
  assert_ne!(first_address, second_address);
  assert_eq!(player.current_url().as_deref(), Some("test://second"));
  assert!(!Path::new(&first_address).exists());

  wait_playing(&events).await;

  let processes = launcher.processes();
  assert_eq!(processes.len(), 2);
  assert!(eventually(|| processes[0].mpv.quit_received()).await);
  assert!(eventually(|| !processes[0].is_running()).await);
  assert!(processes[1].is_running());

  player.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_exit_is_reported() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);
  let events = player.subscribe();

  player.play("test://src", PlayOptions::default()).await.unwrap();
  wait_playing(&events).await;
  launcher.last().unwrap().crash();

  let event = next_matching(&events, |e| matches!(e, PlayerEvent::Error(_))).await;
  assert!(matches!(event, PlayerEvent::Error(PlayerError::UnexpectedExit(_))));
  next_matching(&events, |e| matches!(e, PlayerEvent::StateChanged(PlayerState::Stopped))).await;
  assert_eq!(player.state(), PlayerState::Stopped);
  assert!(player.ipc_address().is_none());

  player.stop().await.unwrap();
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert!(drain(&events).is_empty());
}

#[tokio::test]
async fn test_spawn_failure() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new().fail_spawn();
  let player = supervisor(dir.path(), config(), &launcher);

  let err = player.play("test://src", PlayOptions::default()).await.unwrap_err();
  assert!(matches!(err, PlayerError::SpawnFailed(_)));
  assert_eq!(player.state(), PlayerState::Stopped);
  assert!(player.ipc_address().is_none());
  assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_exit_during_startup() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new().exit_immediately();
  let player = supervisor(dir.path(), config(), &launcher);

  let err = player.play("test://src", PlayOptions::default()).await.unwrap_err();
  assert!(matches!(err, PlayerError::SpawnFailed(_)));
  assert_eq!(player.state(), PlayerState::Stopped);
}

#[tokio::test]
async fn test_missing_executable() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let env = FakeEnvironment::new(dir.path());
  let player = Supervisor::with_collaborators(config(), Arc::new(env), Arc::new(launcher.clone())).unwrap();

  let err = player.play("test://src", PlayOptions::default()).await.unwrap_err();
  assert!(matches!(err, PlayerError::ExecutableNotFound(_)));
  assert!(launcher.processes().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_readiness_timeout_enters_error_state() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new().never_listen();
  let config = PlayerConfig {
    init_timeout_secs: 1,
    ..config()
  };
  let player = supervisor(dir.path(), config, &launcher);
  let events = player.subscribe();

  player.play("test://src", PlayOptions::default()).await.unwrap();
  let event = next_matching(&events, |e| matches!(e, PlayerEvent::Error(_))).await;
  assert!(matches!(event, PlayerEvent::Error(PlayerError::ReadinessTimeout(_))));
  next_matching(&events, |e| matches!(e, PlayerEvent::StateChanged(PlayerState::Error))).await;
  assert_eq!(player.state(), PlayerState::Error);

  let process = launcher.last().unwrap();
  assert!(eventually(|| !process.is_running()).await);

  player.stop().await.unwrap();
  assert_eq!(player.state(), PlayerState::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn test_end_of_stream() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);
  let events = player.subscribe();

  let ended = Arc::new(AtomicUsize::new(0));
  let counter = ended.clone();
  player.on_playback_end(move || {
    counter.fetch_add(1, Ordering::SeqCst);
  });

  player.play("test://src", PlayOptions::default()).await.unwrap();
  wait_playing(&events).await;
  launcher.last().unwrap().mpv.set_property("eof-reached", true);

  next_matching(&events, |e| matches!(e, PlayerEvent::PlaybackEnded)).await;
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(ended.load(Ordering::SeqCst), 1);

  player.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_pause_is_tracked() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);
  let events = player.subscribe();

  player.play("test://src", PlayOptions::default()).await.unwrap();
  wait_playing(&events).await;

  let mpv = launcher.last().unwrap().mpv;
  mpv.set_property("pause", true);
  next_matching(&events, |e| matches!(e, PlayerEvent::StateChanged(PlayerState::Paused))).await;
  assert!(player.is_paused());

  mpv.set_property("pause", false);
  wait_playing(&events).await;
  assert!(player.is_playing());

  player.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_transport() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let config = PlayerConfig {
    ipc_transport: Some(TransportKind::Tcp),
    ..config()
  };
  let player = supervisor(dir.path(), config, &launcher);
  let events = player.subscribe();

  player
    .play("test://src", PlayOptions::default().with_start(42.0))
    .await
    .unwrap();
  let address = player.ipc_address().unwrap();
  assert!(address.starts_with("127.0.0.1:"));

  wait_playing(&events).await;
  let progress = player.get_progress().await.unwrap();
  assert!((progress.current_time - 42.0).abs() < 1e-6);

  player.stop().await.unwrap();
  let process = launcher.last().unwrap();
  assert!(eventually(|| process.mpv.quit_received()).await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_callbacks_receive_progress_and_errors() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);

  let progress_count = Arc::new(AtomicUsize::new(0));
  let error_count = Arc::new(AtomicUsize::new(0));
  let counter = progress_count.clone();
  player.on_progress_update(move |_| {
    counter.fetch_add(1, Ordering::SeqCst);
  });
  let counter = error_count.clone();
  player.on_error(move |_| {
    counter.fetch_add(1, Ordering::SeqCst);
  });

  player.play("test://src", PlayOptions::default()).await.unwrap();
  assert!(eventually(|| progress_count.load(Ordering::SeqCst) >= 2).await);
  assert_eq!(error_count.load(Ordering::SeqCst), 0);

  launcher.last().unwrap().crash();
  assert!(eventually(|| error_count.load(Ordering::SeqCst) == 1).await);
  assert_eq!(player.state(), PlayerState::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn test_resubscribe_ends_previous_stream() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);

  let old = player.subscribe();
  let new = player.subscribe();
  assert!(old.recv().await.is_none());

  player.play("test://src", PlayOptions::default()).await.unwrap();
  wait_playing(&new).await;
  player.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_stops_and_refuses_play() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);
  let events = player.subscribe();

  player.play("test://src", PlayOptions::default()).await.unwrap();
  wait_playing(&events).await;

  player.shutdown().await;
  assert_eq!(player.state(), PlayerState::Stopped);
  let process = launcher.last().unwrap();
  assert!(eventually(|| !process.is_running()).await);

  let err = player.play("test://src", PlayOptions::default()).await.unwrap_err();
  assert!(matches!(err, PlayerError::Cancelled));
  assert_eq!(launcher.processes().len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_unresponsive_player_is_torn_down() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);
  let events = player.subscribe();

  player.play("test://src", PlayOptions::default()).await.unwrap();
  wait_playing(&events).await;
  let address = player.ipc_address().unwrap();

  // The connection stays open but core property reads fail
  let process = launcher.last().unwrap();
  for name in ["time-pos", "duration", "pause"] {
    process.mpv.set_failing(name, true);
  }

  let event = next_matching(&events, |e| matches!(e, PlayerEvent::Error(_))).await;
  assert!(matches!(
    event,
    PlayerEvent::Error(PlayerError::DeadTransport { failures: 3 })
  ));
  next_matching(&events, |e| matches!(e, PlayerEvent::StateChanged(PlayerState::Stopped))).await;
  assert_eq!(player.state(), PlayerState::Stopped);
  assert!(eventually(|| !process.is_running()).await);
  assert!(!Path::new(&address).exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_lost_connection_with_live_process_is_torn_down() {
  let dir = tempfile::tempdir().unwrap();
  let launcher = FakeLauncher::new();
  let player = supervisor(dir.path(), config(), &launcher);
  let events = player.subscribe();

  player.play("test://src", PlayOptions::default()).await.unwrap();
  wait_playing(&events).await;
  let address = player.ipc_address().unwrap();

  let process = launcher.last().unwrap();
  process.mpv.disconnect();
  assert!(process.is_running());

  let event = next_matching(&events, |e| matches!(e, PlayerEvent::Error(_))).await;
  assert!(matches!(
    event,
    PlayerEvent::Error(PlayerError::Transport(IpcError::Disconnected))
  ));
  next_matching(&events, |e| matches!(e, PlayerEvent::StateChanged(PlayerState::Stopped))).await;
  assert_eq!(player.state(), PlayerState::Stopped);

  assert!(eventually(|| !process.is_running()).await);
  assert!(!Path::new(&address).exists());

  tokio::time::sleep(Duration::from_millis(200)).await;
  assert!(!drain(&events).iter().any(|e| matches!(e, PlayerEvent::Error(_))));
}
