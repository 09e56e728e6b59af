use std::future::Future;
use std::time::Duration;

use crate::error::LlmError;

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before the next attempt: the server's `Retry-After` seconds when present,
/// exponential backoff otherwise. Both are capped at [`MAX_BACKOFF`].
pub(crate) fn retry_delay(response: &reqwest::Response, attempt: u32) -> Duration {
    let advertised = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    advertised.unwrap_or_else(|| backoff(attempt)).min(MAX_BACKOFF)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(16))).min(MAX_BACKOFF)
}

fn should_retry(status: reqwest::StatusCode) -> bool {
    matches!(
        status,
        reqwest::StatusCode::TOO_MANY_REQUESTS | reqwest::StatusCode::SERVICE_UNAVAILABLE
    )
}

/// Send a request built by `build`, retrying throttled responses (429/503).
///
/// `build` is called once per attempt and must produce a fresh request future.
/// The first non-throttled response is returned unchecked.
///
/// # Errors
///
/// `LlmError::RateLimited` when every attempt was throttled, `LlmError::Http`
/// on transport failure.
pub(crate) async fn send_with_retry<F, Fut>(
    backend: &str,
    max_retries: u32,
    mut build: F,
) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt = 0;
    loop {
        let response = build().await.map_err(LlmError::Http)?;
        if !should_retry(response.status()) {
            return Ok(response);
        }
        if attempt >= max_retries {
            return Err(LlmError::RateLimited);
        }

        let delay = retry_delay(&response, attempt);
        attempt += 1;
        tracing::warn!(
            backend,
            attempt,
            max_retries,
            status = response.status().as_u16(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "embedding backend throttled"
        );
        tokio::time::sleep(delay).await;
    }
}
