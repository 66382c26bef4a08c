//! Waits for a freshly spawned mpv to open its IPC endpoint.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::transport::TransportConfig;
use crate::error::PlayerError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll until the endpoint is connectable, `deadline` passes or `cancel` fires.
///
/// `deadline` defaults to the transport's own readiness timeout.
pub async fn wait_ready(
  transport: &TransportConfig,
  deadline: Option<Duration>,
  cancel: &CancellationToken,
) -> Result<(), PlayerError> {
  let endpoint = transport.endpoint();
  let deadline = deadline.unwrap_or_else(|| endpoint.ready_timeout());

  let poll = async {
    loop {
      if endpoint.is_ready().await {
        tokio::time::sleep(endpoint.settle_delay()).await;
        return;
      }
      tokio::time::sleep(POLL_INTERVAL).await;
    }
  };

  tokio::select! {
    _ = cancel.cancelled() => Err(PlayerError::Cancelled),
    res = tokio::time::timeout(deadline, poll) => {
      res.map_err(|_| {
        PlayerError::ReadinessTimeout(format!("{} after {:?}", transport.address(), deadline))
      })?;
      log::debug!("IPC endpoint {} is ready", transport.address());
      Ok(())
    }
  }
}
