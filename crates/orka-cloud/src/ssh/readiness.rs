use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use super::SshError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls until the SSH port accepts TCP connections.
///
/// Makes at most `retries` attempts, sleeping `interval` between them.
#[instrument(skip(interval))]
pub async fn wait_for_ssh(
    host: &str,
    port: u16,
    retries: u32,
    interval: Duration,
) -> Result<(), SshError> {
    let attempts = retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => {
                info!(attempt, "SSH port is accepting connections");
                return Ok(());
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("connect timed out after {CONNECT_TIMEOUT:?}"),
        }
        debug!(attempt, attempts, %last_error, "SSH not ready yet");
        if attempt < attempts {
            sleep(interval).await;
        }
    }

    warn!(attempts, %last_error, "Giving up waiting for SSH");
    Err(SshError::Unreachable {
        host: host.to_string(),
        port,
        attempts,
        last_error,
    })
}
