//! Retry with exponential backoff for calls against upstream model servers.
//!
//! The policy only decides whether an outcome is worth another try and how
//! long to wait; what to do with a definitive failure stays with the caller.

use std::future::Future;
use std::time::Duration;

use http::StatusCode;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::client::{ClientError, Response};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
}

/// How an upstream call outcome should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    Transient,
    Terminal,
}

/// Statuses worth retrying: gateway-chain failures plus 408/429.
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn classify(outcome: &Result<Response, ClientError>) -> Disposition {
    match outcome {
        Ok(response) if response.status.is_success() => Disposition::Success,
        Ok(response) if is_transient_status(response.status) => Disposition::Transient,
        // Remaining non-2xx answers, 4xx included, are handed back verbatim.
        Ok(_) => Disposition::Terminal,
        Err(ClientError::Transport { .. }) | Err(ClientError::Timeout { .. }) => {
            Disposition::Transient
        }
        Err(_) => Disposition::Terminal,
    }
}

/// The last failing outcome once a retry budget is spent.
#[derive(Debug)]
pub enum LastFailure {
    Status(Response),
    Client(ClientError),
}

impl std::fmt::Display for LastFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LastFailure::Status(response) => {
                write!(f, "upstream answered {}", response.status)
            }
            LastFailure::Client(error) => write!(f, "{error}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: LastFailure },
    #[error(transparent)]
    Client(ClientError),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_wait: Duration,
    max_wait: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_wait: Duration,
        max_wait: Duration,
    ) -> Result<Self, RetryConfigError> {
        if max_attempts == 0 {
            return Err(RetryConfigError::ZeroAttempts);
        }
        Ok(Self {
            max_attempts,
            base_wait,
            max_wait,
        })
    }

    /// Single-attempt policy for call sites that bring their own cadence.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            base_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before attempt `n + 1`, given `n` completed attempts:
    /// `min(base * 2^(n-1), max)`.
    pub fn backoff(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1).min(16);
        let candidate = self.base_wait * 2u32.pow(exponent);
        candidate.min(self.max_wait)
    }

    fn backoff_with_jitter(&self, completed_attempts: u32) -> Duration {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        self.backoff(completed_attempts) + jitter
    }

    /// Drive `op` until it produces a success or a terminal answer, or the
    /// attempt budget runs out. Terminal non-2xx responses are returned as
    /// `Ok` for the caller to interpret.
    pub async fn run<F, Fut>(&self, mut op: F) -> Result<Response, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Response, ClientError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = op().await;

            match classify(&outcome) {
                Disposition::Success | Disposition::Terminal => {
                    return match outcome {
                        Ok(response) => Ok(response),
                        Err(error) => Err(RetryError::Client(error)),
                    };
                }
                Disposition::Transient => {
                    metrics::counter!("upstream_transient_failures_total").increment(1);
                    if attempt >= self.max_attempts {
                        let last = match outcome {
                            Ok(response) => LastFailure::Status(response),
                            Err(error) => LastFailure::Client(error),
                        };
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last,
                        });
                    }
                    let wait = self.backoff_with_jitter(attempt);
                    debug!(attempt, ?wait, "transient upstream failure, backing off");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
