//! Throttle-aware connection pool.
//!
//! One [ConnectionSource] per credential identity; a [ConnectionPool]
//! multiplexes requests across the ready sources under a single semaphore
//! budget, routing around throttled and failed sources. The [RetryPolicy]
//! replays transient failures on a fresh acquisition so a cooling source is
//! never hammered twice in a row.

mod pool;
mod retry;
mod source;
mod throttle;

pub use pool::{
    ConnectionPool, PoolConfig, PoolInitReport, PoolStatistics, PooledClient, SelectionStrategy,
};
pub use retry::{RetryClass, RetryError, RetryPolicy, classify};
pub use source::{ConnectionSource, CredentialIdentity, SourceStatus};
pub use throttle::{
    THROTTLE_BACKOFF_BASE, THROTTLE_BACKOFF_CEILING, ThrottleDecision, ThrottleTracker,
};
