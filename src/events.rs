//! Notifications from the supervisor to its owner.

use std::sync::Arc;

use async_channel::{Receiver, Sender};

use crate::error::PlayerError;
use crate::progress::PlaybackProgress;
use crate::supervisor::PlayerState;

/// Something the owner of a `Supervisor` may want to react to.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
  StateChanged(PlayerState),
  Progress(PlaybackProgress),
  /// The stream reached its end. Sent at most once per session.
  PlaybackEnded,
  /// A failure after `play` returned: initialization, unexpected exit or lost connection.
  Error(PlayerError),
}

/// Events buffered for a subscriber that is not reading. Newer events are dropped past this.
pub const SUBSCRIPTION_CAPACITY: usize = 256;

/// Owned event stream returned by `Supervisor::subscribe`.
///
/// Only the most recent subscription receives events; an older one sees its
/// stream end once it has been replaced. A subscriber that falls more than
/// `SUBSCRIPTION_CAPACITY` events behind misses the overflow.
#[derive(Debug)]
pub struct Subscription {
  rx: Receiver<PlayerEvent>,
}

impl Subscription {
  pub(crate) fn channel() -> (Sender<PlayerEvent>, Self) {
    let (tx, rx) = async_channel::bounded(SUBSCRIPTION_CAPACITY);
    (tx, Self { rx })
  }

  /// Next event, `None` once the subscription was replaced or the supervisor dropped.
  pub async fn recv(&self) -> Option<PlayerEvent> {
    self.rx.recv().await.ok()
  }

  pub fn try_recv(&self) -> Option<PlayerEvent> {
    self.rx.try_recv().ok()
  }
}

pub type ProgressCallback = Arc<dyn Fn(PlaybackProgress) + Send + Sync>;
pub type PlaybackEndCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(PlayerError) + Send + Sync>;

/// Single-slot listeners; registering again replaces the previous one.
#[derive(Default, Clone)]
pub(crate) struct Listeners {
  pub subscriber: Option<Sender<PlayerEvent>>,
  pub on_progress: Option<ProgressCallback>,
  pub on_end: Option<PlaybackEndCallback>,
  pub on_error: Option<ErrorCallback>,
}

impl Listeners {
  /// Deliver an event. Call without holding the session lock.
  pub fn dispatch(&self, event: PlayerEvent) {
    match &event {
      PlayerEvent::Progress(progress) => {
        if let Some(cb) = &self.on_progress {
          cb(*progress);
        }
      }
      PlayerEvent::PlaybackEnded => {
        if let Some(cb) = &self.on_end {
          cb();
        }
      }
      PlayerEvent::Error(err) => {
        if let Some(cb) = &self.on_error {
          cb(err.clone());
        }
      }
      PlayerEvent::StateChanged(_) => {}
    }

    if let Some(tx) = &self.subscriber {
      if let Err(async_channel::TrySendError::Full(_)) = tx.try_send(event) {
        log::trace!("Event subscriber is full, dropping event");
      }
    }
  }
}
