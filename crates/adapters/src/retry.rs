//! Shared retry/backoff policy for the initial provider connect, used by
//! every adapter. spec.md §7: `rate_limited` and transient
//! `network`/`timeout`/`server_error` failures "may be retried by the
//! adapter at most once with short backoff before surfacing" — but only
//! before the first content chunk has been emitted, since nothing after
//! that point can be safely replayed without duplicating output. Grounded
//! on the bounded-backoff shape `panelstream-persistence`'s worker pool uses
//! for store writes, narrowed here to a single retry.

use std::future::Future;
use std::time::Duration;

use panelstream_core::ProviderErrorKind;

pub const MAX_CONNECT_ATTEMPTS: u32 = 2;
pub const RETRY_BACKOFF_MS: u64 = 200;

/// Sends the request built by `send`, retrying once on a retryable
/// classification (network error or a retryable HTTP status) with a fixed
/// short backoff. Returns the first successful 2xx response, or the
/// classified error from the final attempt.
pub async fn connect_with_retry<F, Fut>(
    provider: &str,
    mut send: F,
) -> Result<reqwest::Response, (ProviderErrorKind, String)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = reqwest::Result<reqwest::Response>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                let kind = ProviderErrorKind::classify_http_status(status.as_u16());
                let message = format!("{provider} returned status {status}");
                if attempt < MAX_CONNECT_ATTEMPTS && kind.retryable() {
                    log::debug!(
                        "{provider} connect attempt {attempt} returned {status}, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                    continue;
                }
                log::warn!("{provider} connect failed after {attempt} attempt(s): {message}");
                return Err((kind, message));
            }
            Err(e) => {
                let message = format!("{provider} request failed: {e}");
                if attempt < MAX_CONNECT_ATTEMPTS {
                    log::debug!("{provider} connect attempt {attempt} failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                    continue;
                }
                log::warn!("{provider} connect failed after {attempt} attempt(s): {message}");
                return Err((ProviderErrorKind::Network, message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn a_connection_failure_is_retried_exactly_once_before_surfacing() {
        let attempts = AtomicU32::new(0);
        let client = reqwest::Client::new();
        let result = connect_with_retry("test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let client = client.clone();
            // Nothing listens here; every attempt fails at the connect
            // level, which classifies as `Network` (retryable).
            async move { client.get("http://127.0.0.1:1").send().await }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_CONNECT_ATTEMPTS);
        assert!(result.is_err());
    }
}
