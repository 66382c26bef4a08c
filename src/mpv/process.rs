//! MPV executable lookup, command line building and process spawning.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use super::transport::TransportConfig;
use crate::config::PlayerConfig;
use crate::error::PlayerError;
use crate::options::PlayOptions;
use crate::platform::Environment;

/// Sent when the caller does not supply a user agent. Some hosts reject mpv's default one.
pub const DEFAULT_USER_AGENT: &str =
  "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Delay before checking that a spawned process is still alive.
pub const SPAWN_GRACE: Duration = Duration::from_millis(100);

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// How a player process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
  pub code: Option<i32>,
  pub success: bool,
}

impl From<std::process::ExitStatus> for ProcessExit {
  fn from(status: std::process::ExitStatus) -> Self {
    Self {
      code: status.code(),
      success: status.success(),
    }
  }
}

impl fmt::Display for ProcessExit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.code {
      Some(code) => write!(f, "exit code {}", code),
      None => f.write_str("terminated by signal"),
    }
  }
}

/// A spawned player process.
#[async_trait]
pub trait ChildProcess: Send {
  fn id(&self) -> Option<u32>;

  /// Non-blocking exit check.
  fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;

  /// Wait for the process to exit. Cancel safe.
  async fn wait(&mut self) -> io::Result<ProcessExit>;

  /// Request forced termination without waiting for it.
  fn start_kill(&mut self) -> io::Result<()>;
}

/// Spawns player processes.
pub trait Launcher: Send + Sync {
  fn spawn(&self, executable: &Path, args: &[String]) -> io::Result<Box<dyn ChildProcess>>;
}

/// Spawns real processes, detached from the controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
  fn spawn(&self, executable: &Path, args: &[String]) -> io::Result<Box<dyn ChildProcess>> {
    let mut cmd = tokio::process::Command::new(executable);
    cmd
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null());

    // Keep Ctrl-C aimed at us away from the player
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);

    let child = cmd.spawn()?;
    Ok(Box::new(SystemChild(child)))
  }
}

struct SystemChild(tokio::process::Child);

#[async_trait]
impl ChildProcess for SystemChild {
  fn id(&self) -> Option<u32> {
    self.0.id()
  }

  fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
    Ok(self.0.try_wait()?.map(ProcessExit::from))
  }

  async fn wait(&mut self) -> io::Result<ProcessExit> {
    Ok(self.0.wait().await?.into())
  }

  fn start_kill(&mut self) -> io::Result<()> {
    self.0.start_kill()
  }
}

/// Find the mpv executable: explicit path, then search path and common install locations.
pub fn locate_executable(
  config: &PlayerConfig,
  env: &dyn Environment,
  name: &str,
) -> Result<PathBuf, PlayerError> {
  if let Some(path) = config.mpv_path.as_deref().filter(|s| !s.trim().is_empty()) {
    let path = PathBuf::from(path);
    if path.is_file() {
      return Ok(path);
    }
    // Allow a bare name like "mpv.com" to be resolved on the search path
    return env
      .find_executable(&path.to_string_lossy())
      .ok_or_else(|| PlayerError::ExecutableNotFound(path.display().to_string()));
  }

  env
    .find_executable(name)
    .ok_or_else(|| PlayerError::ExecutableNotFound(name.to_string()))
}

/// Build mpv's argument vector. The URL is always last.
pub fn build_args(
  transport: &TransportConfig,
  url: &str,
  options: &PlayOptions,
  config: &PlayerConfig,
) -> Vec<String> {
  let mut args = vec![
    transport.ipc_server_arg(),
    "--idle=yes".to_string(),
    "--keep-open=yes".to_string(),
    "--ytdl=no".to_string(),
  ];

  if !config.load_user_config {
    args.push("--no-config".to_string());
  }

  if config.debug {
    if let Some(log_file) = config.mpv_log_file.as_deref() {
      args.push(format!("--log-file={}", log_file));
    }
  } else {
    args.push("--really-quiet".to_string());
  }

  if let Some(start) = options.start.filter(|s| *s > 0.0) {
    args.push(format!("--start={}", start));
  }
  if let Some(volume) = options.volume {
    args.push(format!("--volume={}", volume.min(100)));
  }
  if let Some(speed) = options.speed {
    args.push(format!("--speed={}", speed));
  }
  if options.fullscreen {
    args.push("--fullscreen".to_string());
  }
  if let Some(sub) = options.subtitle_file.as_deref() {
    args.push(format!("--sub-file={}", sub));
  }
  if let Some(lang) = options.subtitle_lang.as_deref() {
    args.push(format!("--slang={}", lang));
  }
  if let Some(delay) = options.subtitle_delay {
    args.push(format!("--sub-delay={}", delay));
  }
  if let Some(aid) = options.audio_track {
    args.push(format!("--aid={}", aid));
  }

  let user_agent = options
    .user_agent
    .as_deref()
    .filter(|ua| !ua.is_empty())
    .unwrap_or(DEFAULT_USER_AGENT);
  args.push(format!("--user-agent={}", user_agent));

  if let Some(referer) = options.referer.as_deref().filter(|r| !r.is_empty()) {
    args.push(format!("--referrer={}", referer));
  }

  // Headers with a dedicated flag are not repeated as raw header fields
  for (name, value) in &options.http_headers {
    let lower = name.to_ascii_lowercase();
    if lower == "user-agent" || lower == "referer" || lower == "referrer" {
      continue;
    }
    args.push(format!("--http-header-fields-append={}: {}", name, value));
  }

  if let Some(title) = options.title.as_deref() {
    args.push(format!("--force-media-title={}", title));
  }

  args.extend(config.mpv_args.iter().cloned());
  args.extend(options.extra_args.iter().cloned());

  args.push(url.to_string());
  args
}

/// Spawn the player and confirm it survived startup.
pub async fn launch(
  launcher: &dyn Launcher,
  executable: &Path,
  args: &[String],
) -> Result<Box<dyn ChildProcess>, PlayerError> {
  log::info!("Spawning mpv: {:?}", executable);
  log::debug!("mpv args: {:?}", redact_args(args));

  let mut child = launcher
    .spawn(executable, args)
    .map_err(|e| PlayerError::SpawnFailed(e.to_string()))?;

  tokio::time::sleep(SPAWN_GRACE).await;

  match child.try_wait() {
    Ok(None) => {}
    Ok(Some(exit)) => {
      return Err(PlayerError::SpawnFailed(format!("mpv exited during startup ({})", exit)));
    }
    Err(e) => {
      let _ = child.start_kill();
      return Err(PlayerError::SpawnFailed(e.to_string()));
    }
  }

  match child.id() {
    Some(pid) => {
      log::info!("mpv started (pid: {})", pid);
      Ok(child)
    }
    None => {
      let _ = child.start_kill();
      Err(PlayerError::SpawnFailed("no process id assigned".to_string()))
    }
  }
}

/// Strip query strings from URLs before logging.
pub(crate) fn redact_url(url: &str) -> String {
  match url.find('?') {
    Some(idx) => format!("{}?[REDACTED]", &url[..idx]),
    None => url.to_string(),
  }
}

fn redact_args(args: &[String]) -> Vec<String> {
  args
    .iter()
    .map(|arg| {
      if arg.starts_with("--http-header-fields") {
        "--http-header-fields-append=[REDACTED]".to_string()
      } else {
        redact_url(arg)
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{FakeEnvironment, FakeLauncher};

  fn transport() -> TransportConfig {
    TransportConfig::unix_socket(PathBuf::from("/tmp/mpvctl-mpv-0011223344556677.sock"))
  }

  #[test]
  fn test_minimal_args() {
    let args = build_args(&transport(), "https://example.com/a.m3u8", &PlayOptions::default(), &PlayerConfig::default());
    assert_eq!(
      args,
      vec![
        "--input-ipc-server=/tmp/mpvctl-mpv-0011223344556677.sock",
        "--idle=yes",
        "--keep-open=yes",
        "--ytdl=no",
        "--no-config",
        "--really-quiet",
        format!("--user-agent={}", DEFAULT_USER_AGENT).as_str(),
        "https://example.com/a.m3u8",
      ]
    );
  }

  #[test]
  fn test_config_flags() {
    let config = PlayerConfig {
      load_user_config: true,
      debug: true,
      mpv_log_file: Some("/tmp/mpv.log".into()),
      mpv_args: vec!["--hwdec=auto".into()],
      ..PlayerConfig::default()
    };
    let args = build_args(&transport(), "u", &PlayOptions::default(), &config);
    assert!(!args.contains(&"--no-config".to_string()));
    assert!(!args.contains(&"--really-quiet".to_string()));
    assert!(args.contains(&"--log-file=/tmp/mpv.log".to_string()));
    assert_eq!(args[args.len() - 2], "--hwdec=auto");
  }

  #[test]
  fn test_option_flags_and_ordering() {
    let options = PlayOptions {
      start: Some(90.5),
      volume: Some(0),
      speed: Some(1.25),
      fullscreen: true,
      subtitle_file: Some("/subs/ep1.ass".into()),
      subtitle_lang: Some("eng".into()),
      subtitle_delay: Some(-0.5),
      audio_track: Some(2),
      extra_args: vec!["--mute=yes".into()],
      referer: Some("https://site.example/".into()),
      user_agent: Some("custom-agent".into()),
      title: Some("Episode 1".into()),
      ..PlayOptions::default()
    }
    .with_header("Origin", "https://site.example")
    .with_header("User-Agent", "ignored")
    .with_header("referer", "ignored");

    let args = build_args(&transport(), "https://cdn.example/ep1.mp4", &options, &PlayerConfig::default());

    assert!(args[0].starts_with("--input-ipc-server="));
    assert_eq!(args.last().unwrap(), "https://cdn.example/ep1.mp4");
    assert_eq!(args[args.len() - 2], "--mute=yes");
    for expected in [
      "--start=90.5",
      "--volume=0",
      "--speed=1.25",
      "--fullscreen",
      "--sub-file=/subs/ep1.ass",
      "--slang=eng",
      "--sub-delay=-0.5",
      "--aid=2",
      "--user-agent=custom-agent",
      "--referrer=https://site.example/",
      "--http-header-fields-append=Origin: https://site.example",
      "--force-media-title=Episode 1",
    ] {
      assert!(args.contains(&expected.to_string()), "missing {}", expected);
    }
    assert_eq!(
      args.iter().filter(|a| a.starts_with("--http-header-fields")).count(),
      1
    );
  }

  #[test]
  fn test_locate_executable() {
    let env = FakeEnvironment::new(std::env::temp_dir()).with_executable("mpv", "/opt/mpv/bin/mpv");
    let path = locate_executable(&PlayerConfig::default(), &env, "mpv").unwrap();
    assert_eq!(path, PathBuf::from("/opt/mpv/bin/mpv"));

    let err = locate_executable(&PlayerConfig::default(), &env, "mpv.exe").unwrap_err();
    assert!(matches!(err, PlayerError::ExecutableNotFound(name) if name == "mpv.exe"));

    let config = PlayerConfig {
      mpv_path: Some("/definitely/missing/mpv".into()),
      ..PlayerConfig::default()
    };
    assert!(locate_executable(&config, &env, "mpv").is_err());
  }

  #[test]
  fn test_redact_url() {
    assert_eq!(
      redact_url("https://cdn.example/v.m3u8?token=abc"),
      "https://cdn.example/v.m3u8?[REDACTED]"
    );
    assert_eq!(redact_url("/local/file.mkv"), "/local/file.mkv");
  }

  #[tokio::test]
  async fn test_launch_reports_spawn_failure() {
    let launcher = FakeLauncher::new().fail_spawn();
    let Err(err) = launch(&launcher, Path::new("mpv"), &["u".to_string()]).await else {
      panic!("spawn should fail");
    };
    assert!(matches!(err, PlayerError::SpawnFailed(_)));
  }

  #[tokio::test]
  async fn test_launch_detects_early_exit() {
    let launcher = FakeLauncher::new().exit_immediately();
    let args = vec![transport().ipc_server_arg(), "u".to_string()];
    let Err(err) = launch(&launcher, Path::new("mpv"), &args).await else {
      panic!("launch should fail");
    };
    assert!(err.to_string().contains("exited during startup"));
  }
}
