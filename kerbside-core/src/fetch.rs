//! HTTP transport with a bounded retry/backoff policy.
//!
//! Pure transport: this module knows nothing about addresses or schedules.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};

#[derive(thiserror::Error, Debug)]
/// Failures surfaced by [`Fetcher::get_text`] after the retry budget is spent.
pub enum FetchError {
    /// The request exceeded the per-attempt timeout.
    #[error("upstream request timed out")]
    Timeout,
    /// The connection could not be established or was dropped.
    #[error("upstream connection failed: {0}")]
    Connection(String),
    /// The upstream answered with a non-success status.
    #[error("upstream returned HTTP {0}")]
    Status(StatusCode),
    /// The upstream answered 200 with an empty body.
    #[error("upstream returned an empty body")]
    EmptyBody,
}

impl FetchError {
    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Connection(err.to_string())
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Timeouts, connection failures, 5xx, and 429 are transient. Other 4xx
    /// statuses indicate a malformed request and are surfaced immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Connection(_) => true,
            FetchError::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::EmptyBody => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Retry/backoff configuration for [`Fetcher`].
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per subsequent attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single inter-attempt delay.
    pub max_backoff: Duration,
    /// Per-attempt request timeout.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay after the given attempt number (1-based), capped at
    /// [`RetryPolicy::max_backoff`].
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Outbound GET client shared by the address lookup and the schedule scraper.
pub struct Fetcher {
    client: Client,
    policy: RetryPolicy,
}

impl Fetcher {
    /// Create a fetcher over an existing [`Client`].
    #[must_use]
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// GET a URL and return the response body as text, retrying transient
    /// failures with exponential backoff. A `Retry-After` delta-seconds hint
    /// overrides the computed delay for that attempt, still capped at
    /// [`RetryPolicy::max_backoff`].
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once the retry budget is exhausted, or
    /// immediately for non-retryable failures.
    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<String, FetchError> {
        let mut attempt = 0_u32;

        loop {
            attempt += 1;

            let (error, hint) = match self.attempt(url, query).await {
                Ok(body) => return Ok(body),
                Err(outcome) => outcome,
            };

            if attempt >= self.policy.max_attempts || !error.is_retryable() {
                return Err(error);
            }

            let delay = hint
                .unwrap_or_else(|| self.policy.delay_after(attempt))
                .min(self.policy.max_backoff);

            tracing::warn!(
                url,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retrying upstream request"
            );

            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<String, (FetchError, Option<Duration>)> {
        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(self.policy.request_timeout)
            .send()
            .await
            .map_err(|err| (FetchError::from_reqwest(&err), None))?;

        let status = response.status();
        if !status.is_success() {
            let hint = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err((FetchError::Status(status), hint));
        }

        let body = response
            .text()
            .await
            .map_err(|err| (FetchError::from_reqwest(&err), None))?;

        if body.trim().is_empty() {
            return Err((FetchError::EmptyBody, None));
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        };

        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(6), Duration::from_secs(30));
        assert_eq!(policy.delay_after(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn permanent_server_error_stops_at_the_attempt_ceiling() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/page");
                then.status(503);
            })
            .await;

        let fetcher = Fetcher::new(Client::new(), quick_policy(4));
        let result = fetcher.get_text(&server.url("/page"), &[]).await;

        assert!(matches!(
            result,
            Err(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE))
        ));
        mock.assert_hits_async(4).await;
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/page");
                then.status(404);
            })
            .await;

        let fetcher = Fetcher::new(Client::new(), quick_policy(4));
        let result = fetcher.get_text(&server.url("/page"), &[]).await;

        assert!(matches!(
            result,
            Err(FetchError::Status(StatusCode::NOT_FOUND))
        ));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn rate_limiting_is_retried_with_the_retry_after_hint() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/page");
                then.status(429).header("Retry-After", "0");
            })
            .await;

        let fetcher = Fetcher::new(Client::new(), quick_policy(3));
        let result = fetcher.get_text(&server.url("/page"), &[]).await;

        assert!(matches!(
            result,
            Err(FetchError::Status(StatusCode::TOO_MANY_REQUESTS))
        ));
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn successful_body_is_returned_as_text() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/page").query_param("key", "value");
                then.status(200).body("hello");
            })
            .await;

        let fetcher = Fetcher::new(Client::new(), quick_policy(2));
        let body = fetcher
            .get_text(&server.url("/page"), &[("key", "value")])
            .await
            .expect("fetch should succeed");

        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn empty_body_is_surfaced_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/page");
                then.status(200).body("   ");
            })
            .await;

        let fetcher = Fetcher::new(Client::new(), quick_policy(4));
        let result = fetcher.get_text(&server.url("/page"), &[]).await;

        assert!(matches!(result, Err(FetchError::EmptyBody)));
        mock.assert_hits_async(1).await;
    }
}
