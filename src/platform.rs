//! Host platform detection and OS collaborators.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::mpv::TransportKind;

const KERNEL_ID_FILE: &str = "/proc/version";

/// Host platform variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
  Linux,
  MacOs,
  Windows,
  Wsl,
}

/// Which mpv build to drive when running under WSL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WslPolicy {
  /// Linux mpv over a Unix socket. The Windows binary's named pipe is not reachable from WSL.
  #[default]
  LinuxBinary,
  /// Windows `mpv.exe` over a named pipe.
  WindowsBinary,
}

impl Platform {
  /// Determine the host platform. Only Linux consults the environment, to tell WSL apart.
  pub fn resolve(env: &dyn Environment) -> Self {
    if cfg!(windows) {
      Platform::Windows
    } else if cfg!(target_os = "macos") {
      Platform::MacOs
    } else if env
      .kernel_identification()
      .as_deref()
      .is_some_and(is_wsl_kernel)
    {
      Platform::Wsl
    } else {
      Platform::Linux
    }
  }

  /// Executable name for this platform.
  pub fn executable_name(self, policy: WslPolicy) -> &'static str {
    match self.effective(policy) {
      Platform::Windows => "mpv.exe",
      _ => "mpv",
    }
  }

  /// IPC transport matching the executable chosen for this platform.
  pub fn transport_kind(self, policy: WslPolicy) -> TransportKind {
    match self.effective(policy) {
      Platform::Windows => TransportKind::NamedPipe,
      _ => TransportKind::UnixSocket,
    }
  }

  fn effective(self, policy: WslPolicy) -> Platform {
    match (self, policy) {
      (Platform::Wsl, WslPolicy::WindowsBinary) => Platform::Windows,
      (Platform::Wsl, WslPolicy::LinuxBinary) => Platform::Linux,
      (other, _) => other,
    }
  }
}

impl std::fmt::Display for Platform {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Platform::Linux => "Linux",
      Platform::MacOs => "macOS",
      Platform::Windows => "Windows",
      Platform::Wsl => "WSL",
    };
    f.write_str(name)
  }
}

fn is_wsl_kernel(ident: &str) -> bool {
  let ident = ident.to_ascii_lowercase();
  ident.contains("microsoft") || ident.contains("wsl")
}

/// OS touchpoints the supervisor depends on.
pub trait Environment: Send + Sync {
  /// Contents of the kernel identification file, `None` when unreadable.
  fn kernel_identification(&self) -> Option<String>;

  /// Directory for file-backed IPC sockets.
  fn temp_dir(&self) -> PathBuf;

  /// Locate an executable by name.
  fn find_executable(&self, name: &str) -> Option<PathBuf>;
}

/// The real operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
  fn kernel_identification(&self) -> Option<String> {
    std::fs::read_to_string(KERNEL_ID_FILE).ok()
  }

  fn temp_dir(&self) -> PathBuf {
    std::env::temp_dir()
  }

  fn find_executable(&self, name: &str) -> Option<PathBuf> {
    // Check PATH first
    if let Ok(path) = which::which(name) {
      return Some(path);
    }

    common_locations(name).into_iter().find(|p| p.exists())
  }
}

#[cfg(windows)]
fn common_locations(name: &str) -> Vec<PathBuf> {
  [r"C:\Program Files\mpv", r"C:\Program Files (x86)\mpv", r"C:\mpv"]
    .iter()
    .map(|dir| PathBuf::from(dir).join(name))
    .collect()
}

#[cfg(target_os = "macos")]
fn common_locations(name: &str) -> Vec<PathBuf> {
  vec![
    PathBuf::from("/usr/local/bin").join(name),
    PathBuf::from("/opt/homebrew/bin").join(name),
    PathBuf::from("/Applications/mpv.app/Contents/MacOS").join(name),
  ]
}

#[cfg(not(any(windows, target_os = "macos")))]
fn common_locations(name: &str) -> Vec<PathBuf> {
  vec![
    PathBuf::from("/usr/bin").join(name),
    PathBuf::from("/usr/local/bin").join(name),
    PathBuf::from("/snap/bin").join(name),
  ]
}
