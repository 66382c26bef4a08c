use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use mpvctl::{PlayOptions, PlayerConfig, PlayerEvent, PlayerState, Supervisor};

/// Play a URL in mpv and print playback progress until it ends or Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "mpvctl", version, about)]
struct Args {
  /// Media URL or path
  url: String,

  /// Initial volume (0-100)
  #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
  volume: Option<u8>,

  /// Start position in seconds
  #[arg(long)]
  start: Option<f64>,

  /// Playback speed multiplier
  #[arg(long)]
  speed: Option<f64>,

  /// Title shown by mpv
  #[arg(long)]
  title: Option<String>,

  /// Player config file (defaults to the per-user config)
  #[arg(long, short = 'c')]
  config: Option<PathBuf>,
}

impl Args {
  fn play_options(&self) -> PlayOptions {
    PlayOptions {
      volume: self.volume,
      start: self.start,
      speed: self.speed,
      title: self.title.clone(),
      ..PlayOptions::default()
    }
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  let args = Args::parse();

  let config = match &args.config {
    Some(path) => match PlayerConfig::load(path) {
      Ok(config) => config,
      Err(e) => {
        eprintln!("{}: {}", path.display(), e);
        return ExitCode::from(2);
      }
    },
    None => PlayerConfig::load_or_default(),
  };

  let player = match Supervisor::new(config) {
    Ok(player) => player,
    Err(e) => {
      eprintln!("{}", e);
      return ExitCode::FAILURE;
    }
  };
  let events = player.subscribe();

  if let Err(e) = player.play(&args.url, args.play_options()).await {
    eprintln!("{}", e);
    return ExitCode::FAILURE;
  }

  let mut code = ExitCode::SUCCESS;
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        log::info!("Interrupted");
        break;
      }
      event = events.recv() => match event {
        Some(PlayerEvent::Progress(p)) => {
          println!(
            "{:>8.1}s / {:>8.1}s ({:>5.1}%){}",
            p.current_time,
            p.duration,
            p.percentage,
            if p.paused { " [paused]" } else { "" }
          );
        }
        Some(PlayerEvent::PlaybackEnded) => break,
        Some(PlayerEvent::Error(e)) => {
          eprintln!("{}", e);
          code = ExitCode::FAILURE;
        }
        Some(PlayerEvent::StateChanged(state)) => {
          log::info!("Player {}", state);
          if matches!(state, PlayerState::Stopped | PlayerState::Error) {
            break;
          }
        }
        None => break,
      }
    }
  }

  player.shutdown().await;
  code
}
