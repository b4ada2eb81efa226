use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dvt_api::{OrganizationService, ServiceError};
use dvt_cancel::CancellationToken;
use dvt_error::{DvError, ErrorCode, dv_err};
use rand::Rng as _;
use tracing::debug;

use crate::pool::ConnectionPool;
use crate::throttle::ThrottleDecision;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Retry classification of a service error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// HTTP 429/503; the tracker gets told and selection cools the source.
    Throttle,
    /// Timeouts and broken connections.
    TransientNetwork,
    /// Platform codes 1205/3732: replays resolve these races.
    Deadlock,
    /// Row-level validation, permissions and everything else. Never retried.
    Fatal,
}

pub fn classify(error: &ServiceError) -> RetryClass {
    if error.is_throttle() {
        RetryClass::Throttle
    } else if error.is_deadlock() {
        RetryClass::Deadlock
    } else if error.is_transient_network() {
        RetryClass::TransientNetwork
    } else {
        RetryClass::Fatal
    }
}

/// Why a retried operation ultimately did not produce a value.
#[derive(Debug)]
pub enum RetryError {
    /// Not retryable; the caller decides what the failure means
    /// (bulk refusal, business error, ...).
    Fatal(ServiceError),
    /// Retryable, but the retry budget ran out.
    Exhausted(ServiceError),
    /// The server demanded a longer wait than the run tolerates.
    GaveUp(Duration),
    /// The pool could not produce a handle (exhaustion, cancellation,
    /// no ready sources).
    Pool(Box<DvError>),
}

impl RetryError {
    pub fn into_dv_error(self) -> Box<DvError> {
        match self {
            RetryError::Fatal(e) => {
                dv_err!(ErrorCode::RemoteError, "service call failed: {e}")
            }
            RetryError::Exhausted(e) => {
                dv_err!(ErrorCode::RemoteError, "retries exhausted: {e}")
            }
            RetryError::GaveUp(hint) => dv_err!(
                ErrorCode::ThrottleGaveUp,
                "server asked to retry after {}s, which exceeds the configured tolerance",
                hint.as_secs()
            ),
            RetryError::Pool(e) => e,
        }
    }
}

/// Replays transiently-failing service calls.
///
/// Every attempt acquires a *fresh* handle from the pool: after a throttle is
/// recorded, throttle-aware selection steers the replay to a cooler source
/// instead of the one that just said 429.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_retries: DEFAULT_MAX_RETRIES }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        RetryPolicy { max_retries }
    }

    /// Exponential backoff with jitter: base * 2^attempt + [0, base).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(16));
        let jitter = rand::rng().random_range(0..BACKOFF_BASE.as_millis() as u64);
        (exp + Duration::from_millis(jitter)).min(BACKOFF_CEILING)
    }

    /// Runs `op` until it succeeds, fails fatally, or the retry budget is
    /// spent. The permit is released before any backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        pool: &ConnectionPool,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RetryError>
    where
        F: Fn(Arc<dyn OrganizationService>) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let handle = pool.acquire(cancel).await.map_err(RetryError::Pool)?;
            match op(handle.client()).await {
                Ok(value) => {
                    handle.report_success();
                    if attempt > 0 {
                        pool.note_retry_success();
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let class = classify(&error);
                    if class == RetryClass::Fatal {
                        return Err(RetryError::Fatal(error));
                    }
                    let delay = match class {
                        RetryClass::Throttle => {
                            match handle.report_throttle(error.retry_after) {
                                ThrottleDecision::GiveUp(hint) => {
                                    return Err(RetryError::GaveUp(hint));
                                }
                                ThrottleDecision::Backoff(_) => error
                                    .retry_after
                                    .unwrap_or_else(|| self.backoff_delay(attempt)),
                            }
                        }
                        _ => self.backoff_delay(attempt),
                    };
                    if attempt >= self.max_retries {
                        return Err(RetryError::Exhausted(error));
                    }
                    debug!(
                        source = handle.source_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient failure, backing off"
                    );
                    // Free the permit while we wait
                    drop(handle);
                    pool.note_retry_attempt();
                    tokio::time::sleep(delay).await;
                    if cancel.is_cancelled() {
                        return Err(RetryError::Pool(
                            dv_err!(ErrorCode::OperationCanceled, "retry cancelled"),
                        ));
                    }
                    attempt += 1;
                }
            }
        }
    }
}
