//! Upstream retry policy.
//!
//! 429s are retried respecting `Retry-After` when present, otherwise with
//! exponential backoff capped at 30 seconds. Transient socket failures
//! (connect refused, reset, timeout) are retried with linear backoff.
//! Everything else propagates immediately; interpreting non-2xx statuses is
//! the handler's job.

use std::time::Duration;

use crate::error::ProxyError;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const LINEAR_STEP: Duration = Duration::from_millis(500);

/// Sends a request, retrying per the policy. The builder is cloned per
/// attempt; bodies must therefore be buffered (ours always are).
pub async fn send_with_retry(builder: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response, ProxyError> {
    let mut last_rate_limit_body = String::new();

    for attempt in 0..MAX_ATTEMPTS {
        let Some(cloned) = builder.try_clone() else {
            // Streaming bodies cannot be cloned; single attempt.
            return builder.send().await.map_err(|e| connection_error(url, &e));
        };

        match cloned.send().await {
            Ok(response) if response.status().as_u16() == 429 => {
                let delay = retry_after(&response).unwrap_or_else(|| exponential_backoff(attempt));
                last_rate_limit_body = response.text().await.unwrap_or_default();

                if attempt + 1 < MAX_ATTEMPTS {
                    log::info!(
                        "Rate limited by {url}, retrying in {delay:?} (attempt {}/{MAX_ATTEMPTS})",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            Ok(response) => return Ok(response),
            Err(e) if is_transient(&e) => {
                if attempt + 1 >= MAX_ATTEMPTS {
                    return Err(connection_error(url, &e));
                }

                let delay = LINEAR_STEP * (attempt + 1);
                log::info!("Transient error talking to {url} ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(connection_error(url, &e)),
        }
    }

    Err(ProxyError::RateLimited(if last_rate_limit_body.is_empty() {
        format!("{url} kept returning 429")
    } else {
        last_rate_limit_body
    }))
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

fn connection_error(url: &str, error: &reqwest::Error) -> ProxyError {
    ProxyError::Connection {
        url: url.to_string(),
        reason: error.to_string(),
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let header = response.headers().get(http::header::RETRY_AFTER)?;
    let seconds: u64 = header.to_str().ok()?.trim().parse().ok()?;

    Some(Duration::from_secs(seconds).min(BACKOFF_CAP))
}

fn exponential_backoff(attempt: u32) -> Duration {
    let exp = Duration::from_secs(1u64 << u64::from(attempt.min(5)));
    exp.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        assert_eq!(exponential_backoff(0), Duration::from_secs(1));
        assert_eq!(exponential_backoff(1), Duration::from_secs(2));
        assert_eq!(exponential_backoff(4), Duration::from_secs(16));
        assert_eq!(exponential_backoff(10), BACKOFF_CAP);
    }
}
