//! Retrying HTTP transport shared by every outbound call.
//!
//! One backoff policy, parameterized per caller: source fetches get more
//! patience than the notification path.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Longest error body kept in [`TransportError::Status`]
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    /// Another client is long-polling with the same credentials
    #[error("conflict: another poller holds the update cursor")]
    Conflict,
    #[error("HTTP {code}: {body}")]
    Status {
        code: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("API error: {0}")]
    Api(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }

    pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        match self {
            TransportError::Timeout | TransportError::Connect(_) => true,
            TransportError::Status { code, .. } => policy.retry_statuses.contains(code),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, TransportError::Conflict)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_statuses: Vec<u16>,
    /// Per-attempt request timeout
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Source fetches: every configured attempt, generous timeout.
    pub fn sources(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            retry_statuses: cfg.retry_statuses.clone(),
            timeout: Duration::from_secs(25),
        }
    }

    /// Outbound notifications: at most two attempts, so a slow sink does not
    /// stall the tick that holds the state lock.
    pub fn notifications(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.clamp(1, 2),
            timeout: Duration::from_secs(20),
            ..Self::sources(cfg)
        }
    }

    /// Command long poll: a single attempt, the loop itself is the retry.
    pub fn command(cfg: &RetryConfig, http_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            timeout: http_timeout,
            ..Self::sources(cfg)
        }
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// `base * 2^(attempt-1)` capped at `max_delay`, jittered into `[d/2, d]`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, rng: &mut impl Rng) -> Duration {
    let base = policy.base_delay.as_millis() as u64;
    let cap = policy.max_delay.as_millis() as u64;
    let shift = attempt.saturating_sub(1).min(20);
    let exp = base.saturating_mul(1u64 << shift).min(cap);
    if exp == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(exp / 2..=exp))
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Send a request built by `build`, retrying transient failures.
///
/// `build` is called once per attempt because a `RequestBuilder` is consumed
/// by `send`. HTTP 409 maps to [`TransportError::Conflict`] and is never
/// retried.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    what: &str,
    build: F,
) -> Result<reqwest::Response, TransportError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 1;
    loop {
        let outcome = match build().timeout(policy.timeout).send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) if response.status().as_u16() == 409 => {
                return Err(TransportError::Conflict)
            }
            Ok(response) => {
                let code = response.status().as_u16();
                let retry_after = retry_after(&response);
                let mut body = response.text().await.unwrap_or_default();
                if body.len() > MAX_ERROR_BODY {
                    let mut cut = MAX_ERROR_BODY;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                }
                TransportError::Status {
                    code,
                    body,
                    retry_after,
                }
            }
            Err(e) => TransportError::from_reqwest(e),
        };

        if attempt >= policy.max_attempts || !outcome.is_retryable(policy) {
            return Err(outcome);
        }

        let delay = match &outcome {
            TransportError::Status {
                retry_after: Some(after),
                ..
            } => (*after).min(policy.max_delay),
            _ => {
                // ThreadRng is !Send; keep it out of the await below
                let mut rng = rand::rng();
                backoff_delay(policy, attempt, &mut rng)
            }
        };
        tracing::warn!(
            "{} failed (attempt {}/{}): {}, retrying in {:?}",
            what,
            attempt,
            policy.max_attempts,
            outcome,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> RetryPolicy {
        RetryPolicy::sources(&RetryConfig::default())
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=10 {
            let exp = (500u64 << (attempt - 1)).min(8000);
            let delay = backoff_delay(&policy, attempt, &mut rng).as_millis() as u64;
            assert!(delay >= exp / 2 && delay <= exp, "attempt {}: {}", attempt, delay);
        }
    }

    #[test]
    fn test_backoff_zero_base() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            ..policy()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff_delay(&policy, 3, &mut rng), Duration::ZERO);
    }

    #[test]
    fn test_retryable_classification() {
        let policy = policy();
        assert!(TransportError::Timeout.is_retryable(&policy));
        assert!(TransportError::Connect("refused".into()).is_retryable(&policy));
        let status = |code| TransportError::Status {
            code,
            body: String::new(),
            retry_after: None,
        };
        assert!(status(503).is_retryable(&policy));
        assert!(status(429).is_retryable(&policy));
        assert!(!status(400).is_retryable(&policy));
        assert!(!TransportError::Conflict.is_retryable(&policy));
        assert!(!TransportError::Api("chat not found".into()).is_retryable(&policy));
    }

    #[test]
    fn test_presets() {
        let cfg = RetryConfig::default();
        assert_eq!(RetryPolicy::sources(&cfg).max_attempts, 3);
        assert_eq!(RetryPolicy::notifications(&cfg).max_attempts, 2);
        let command = RetryPolicy::command(&cfg, Duration::from_secs(30));
        assert_eq!(command.max_attempts, 1);
        assert_eq!(command.timeout, Duration::from_secs(30));
    }
}
