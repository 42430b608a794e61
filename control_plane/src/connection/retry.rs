//! Bounded retry with backoff for opening control channels.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::config::ConnectionConfig;

/// Why a single attempt failed.
#[derive(Debug)]
pub enum AttemptFailure<E> {
    Error(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Error(e) => write!(f, "{}", e),
            AttemptFailure::TimedOut(after) => write!(f, "timed out after {:?}", after),
        }
    }
}

/// Every attempt failed; carries the last failure.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: AttemptFailure<E>,
}

/// Retry policy: attempt count, base delay and per-attempt timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    exponential_backoff: bool,
    attempt_timeout: Option<Duration>,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            exponential_backoff: false,
            attempt_timeout: None,
            jitter: false,
        }
    }

    pub fn with_exponential_backoff(mut self) -> Self {
        self.exponential_backoff = true;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Adds up to 50% random extra delay to each backoff.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Policy used for opening connections.
    pub fn for_connections(config: &ConnectionConfig) -> Self {
        RetryPolicy::new(config.open_attempts, config.open_backoff)
            .with_exponential_backoff()
            .with_attempt_timeout(config.open_timeout)
            .with_jitter()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let base = if self.exponential_backoff {
            self.backoff.saturating_mul(2_u32.saturating_pow(attempt))
        } else {
            self.backoff
        };
        if !self.jitter || base.is_zero() {
            return base;
        }
        let extra_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(extra_ms)
    }

    /// Runs `f` until it succeeds or the attempts are used up.
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, f(attempt)).await {
                    Ok(result) => result.map_err(AttemptFailure::Error),
                    Err(_) => Err(AttemptFailure::TimedOut(limit)),
                },
                None => f(attempt).await.map_err(AttemptFailure::Error),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(last) if attempt + 1 >= self.max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last,
                    })
                }
                Err(_) => {
                    tokio::time::sleep(self.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
