//! Outbound connection setup.

use opush_obex::{Connector, Transport};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::transfer::TransferConfig;

/// Opens a transport to `destination`.
///
/// Each attempt is bounded by `connect_timeout`. A failure whose message
/// contains the link-key marker is retried exactly once after
/// `link_key_retry_delay`; every other failure is returned as is.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    destination: &str,
    config: &TransferConfig,
) -> Result<Transport, String> {
    let mut retried = false;
    loop {
        let message = match timeout(config.connect_timeout, connector.connect(destination)).await {
            Ok(Ok(transport)) => {
                debug!(peer = %destination, "transport connected");
                return Ok(transport);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect to {destination} timed out"),
        };

        if !retried && is_link_key_race(&message, &config.link_key_error_marker) {
            warn!(peer = %destination, error = %message, "link key race, retrying once");
            retried = true;
            sleep(config.link_key_retry_delay).await;
            continue;
        }
        return Err(message);
    }
}

fn is_link_key_race(message: &str, marker: &str) -> bool {
    !marker.is_empty() && message.to_lowercase().contains(&marker.to_lowercase())
}
