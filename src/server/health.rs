// src/server/health.rs

use reqwest::{Client, StatusCode};
use std::net::TcpListener;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::Result;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Binds an ephemeral port on `host` and releases it again.
///
/// Nothing reserves the port afterwards, so another process may grab it
/// before the server binds.
pub fn allocate_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Polls `url` until it answers 200 or `timeout` elapses.
///
/// Returns `false` on timeout instead of erroring; the caller decides what a
/// server that never came up means.
pub async fn wait_healthy(client: &Client, url: &str, timeout: Duration) -> bool {
    let start = Instant::now();
    let mut attempts = 0u32;

    while start.elapsed() < timeout {
        attempts += 1;
        let remaining = timeout.saturating_sub(start.elapsed());
        let response = client
            .get(url)
            .timeout(REQUEST_TIMEOUT.min(remaining).max(Duration::from_millis(1)))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status() == StatusCode::OK => {
                log::debug!("{} healthy after {} attempt(s)", url, attempts);
                return true;
            }
            Ok(resp) => log::debug!("{} answered {}", url, resp.status()),
            Err(e) => log::trace!("{} not reachable yet: {}", url, e),
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
    }

    log::warn!("{} not healthy after {:?} ({} attempts)", url, timeout, attempts);
    false
}
