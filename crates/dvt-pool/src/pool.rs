use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dvt_api::{InitFailure, OrganizationService};
use dvt_cancel::CancellationToken;
use dvt_error::{DvResult, ErrorCode, err, unexpected_err};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::source::{ConnectionSource, SourceStatus};
use crate::throttle::{ThrottleDecision, ThrottleTracker};

/// How often a blocked `acquire` wakes up to check for cancellation.
const ACQUIRE_POLL: Duration = Duration::from_millis(50);

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(120);

/// How the pool picks a source for the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Next index mod N, skipping failed sources.
    RoundRobin,
    /// Minimum active count, ignoring throttle state.
    LeastBusy,
    /// Prefer non-throttled sources with the lowest active count; when all
    /// are throttled, the one whose backoff expires soonest.
    #[default]
    ThrottleAware,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrency: usize,
    pub acquire_timeout: Duration,
    pub strategy: SelectionStrategy,
    /// Server-advised waits beyond this make the tracker signal give-up.
    pub throttle_tolerance: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            strategy: SelectionStrategy::default(),
            throttle_tolerance: None,
        }
    }
}

/// Point-in-time pool counters, reported into the run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    pub active: usize,
    pub idle: usize,
    pub requests_served: u64,
    pub throttle_events: u64,
    pub total_backoff: Duration,
    pub retries_attempted: u64,
    pub retries_succeeded: u64,
}

/// Per-source outcome of `ensure_initialized`.
pub struct PoolInitReport {
    pub results: Vec<(String, Result<(), InitFailure>)>,
}

impl PoolInitReport {
    pub fn ready_count(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    /// The run proceeds when at least one source is ready.
    pub fn is_usable(&self) -> bool {
        self.ready_count() > 0
    }
}

impl fmt::Display for PoolInitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, result) in &self.results {
            match result {
                Ok(()) => writeln!(f, "{name}: Ready")?,
                Err(failure) => {
                    writeln!(f, "{name}: Failed({}) - {failure}", failure.classification())?
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PoolInner {
    sources: Vec<Arc<ConnectionSource>>,
    tracker: ThrottleTracker,
    semaphore: Arc<Semaphore>,
    active: Vec<AtomicUsize>,
    /// Monotonic use ticks for least-recently-used tiebreaks.
    last_used: Vec<AtomicU64>,
    use_counter: AtomicU64,
    rr_cursor: AtomicUsize,
    requests_served: AtomicU64,
    retries_attempted: AtomicU64,
    retries_succeeded: AtomicU64,
    /// 0 means "no hint observed yet".
    dop_hint: AtomicU32,
    config: PoolConfig,
}

/// Multiplexes requests over several authenticated sources under one
/// concurrency budget.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(sources: Vec<ConnectionSource>, config: PoolConfig) -> DvResult<Self> {
        if sources.is_empty() {
            return err!(ErrorCode::InvalidConfig, "connection pool needs at least one source");
        }
        if config.max_concurrency == 0 {
            return err!(ErrorCode::InvalidConfig, "max concurrency must be greater than zero");
        }
        let mut tracker = ThrottleTracker::new(sources.len());
        if let Some(tolerance) = config.throttle_tolerance {
            tracker = tracker.with_max_tolerance(tolerance);
        }
        let count = sources.len();
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                sources: sources.into_iter().map(Arc::new).collect(),
                tracker,
                semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
                active: (0..count).map(|_| AtomicUsize::new(0)).collect(),
                last_used: (0..count).map(|_| AtomicU64::new(0)).collect(),
                use_counter: AtomicU64::new(0),
                rr_cursor: AtomicUsize::new(0),
                requests_served: AtomicU64::new(0),
                retries_attempted: AtomicU64::new(0),
                retries_succeeded: AtomicU64::new(0),
                dop_hint: AtomicU32::new(0),
                config,
            }),
        })
    }

    /// Drives `ensure_ready` on every source concurrently. Idempotent: a
    /// second call on a ready pool re-authenticates nothing.
    pub async fn ensure_initialized(&self, cancel: &CancellationToken) -> PoolInitReport {
        let attempts = self.inner.sources.iter().map(|source| {
            let source = source.clone();
            let cancel = cancel.clone();
            async move {
                let result = source.ensure_ready(&cancel).await;
                (source.name().to_string(), result)
            }
        });
        let results = futures::future::join_all(attempts).await;
        let report = PoolInitReport { results };
        info!(
            ready = report.ready_count(),
            total = self.inner.sources.len(),
            "connection pool initialized"
        );
        report
    }

    /// Acquires a (source, permit) pair.
    ///
    /// Blocks on the semaphore up to `acquire_timeout`, waking periodically
    /// to honor the cancellation token. A cancelled acquire never leaks a
    /// permit; a timed-out one fails with `PoolExhaustion`.
    pub async fn acquire(&self, cancel: &CancellationToken) -> DvResult<PooledClient> {
        let deadline = Instant::now() + self.inner.config.acquire_timeout;
        let permit = loop {
            if cancel.is_cancelled() {
                return err!(ErrorCode::OperationCanceled, "pool acquire cancelled");
            }
            match tokio::time::timeout(
                ACQUIRE_POLL,
                self.inner.semaphore.clone().acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => break permit,
                Ok(Err(_)) => return unexpected_err!("pool semaphore closed"),
                Err(_) if Instant::now() >= deadline => {
                    return err!(
                        ErrorCode::PoolExhaustion,
                        "no pool capacity freed within {:?}",
                        self.inner.config.acquire_timeout
                    );
                }
                Err(_) => continue,
            }
        };

        let index = self.select_source()?;
        self.inner.active[index].fetch_add(1, Ordering::AcqRel);
        self.inner.requests_served.fetch_add(1, Ordering::Relaxed);
        let tick = self.inner.use_counter.fetch_add(1, Ordering::Relaxed);
        self.inner.last_used[index].store(tick, Ordering::Relaxed);

        let source = self.inner.sources[index].clone();
        let client = match source.client() {
            Some(client) => client,
            // Selection saw Ready; a concurrent invalidate snuck in
            None => {
                self.inner.active[index].fetch_sub(1, Ordering::AcqRel);
                return err!(
                    ErrorCode::ConnectionNotReady,
                    "source '{}' lost readiness during acquire",
                    source.name()
                );
            }
        };
        debug!(source = source.name(), "pool handle acquired");
        Ok(PooledClient {
            inner: self.inner.clone(),
            index,
            client,
            _permit: permit,
        })
    }

    fn select_source(&self) -> DvResult<usize> {
        let inner = &self.inner;
        let ready: Vec<usize> = (0..inner.sources.len())
            .filter(|&i| inner.sources[i].is_ready())
            .collect();
        if ready.is_empty() {
            return err!(ErrorCode::ConnectionNotReady, "no ready connection sources in the pool");
        }
        let index = match inner.config.strategy {
            SelectionStrategy::RoundRobin => {
                let cursor = inner.rr_cursor.fetch_add(1, Ordering::Relaxed);
                ready[cursor % ready.len()]
            }
            SelectionStrategy::LeastBusy => *ready
                .iter()
                .min_by_key(|&&i| inner.active[i].load(Ordering::Acquire))
                .expect("ready is non-empty"),
            SelectionStrategy::ThrottleAware => {
                let cool: Vec<usize> = ready
                    .iter()
                    .copied()
                    .filter(|&i| !inner.tracker.is_throttled(i))
                    .collect();
                if cool.is_empty() {
                    // everyone is backing off: take the soonest-free source
                    *ready
                        .iter()
                        .min_by_key(|&&i| inner.tracker.backoff_remaining(i))
                        .expect("ready is non-empty")
                } else {
                    *cool
                        .iter()
                        .min_by_key(|&&i| {
                            (
                                inner.active[i].load(Ordering::Acquire),
                                inner.last_used[i].load(Ordering::Relaxed),
                            )
                        })
                        .expect("cool is non-empty")
                }
            }
        };
        Ok(index)
    }

    pub fn statistics(&self) -> PoolStatistics {
        let inner = &self.inner;
        let active: usize = inner.active.iter().map(|a| a.load(Ordering::Acquire)).sum();
        PoolStatistics {
            active,
            idle: inner.config.max_concurrency.saturating_sub(active),
            requests_served: inner.requests_served.load(Ordering::Relaxed),
            throttle_events: inner.tracker.throttle_events(),
            total_backoff: inner.tracker.total_backoff(),
            retries_attempted: inner.retries_attempted.load(Ordering::Relaxed),
            retries_succeeded: inner.retries_succeeded.load(Ordering::Relaxed),
        }
    }

    /// Total permits in the budget.
    pub fn capacity(&self) -> usize {
        self.inner.config.max_concurrency
    }

    /// The server DOP hint captured from the most recently released handle.
    pub fn dop_hint(&self) -> Option<u32> {
        match self.inner.dop_hint.load(Ordering::Relaxed) {
            0 => None,
            hint => Some(hint),
        }
    }

    /// True while any source sits inside a backoff window.
    pub fn any_throttled(&self) -> bool {
        (0..self.inner.sources.len()).any(|i| self.inner.tracker.is_throttled(i))
    }

    pub fn tracker(&self) -> &ThrottleTracker {
        &self.inner.tracker
    }

    pub fn source_statuses(&self) -> Vec<(String, SourceStatus)> {
        self.inner
            .sources
            .iter()
            .map(|s| (s.name().to_string(), s.status()))
            .collect()
    }

    pub(crate) fn note_retry_attempt(&self) {
        self.inner.retries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_retry_success(&self) {
        self.inner.retries_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-attempts initialization of recoverably-failed sources at a fixed
    /// interval. Auth failures are never re-attempted.
    pub fn spawn_background_recovery(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if cancel.is_cancelled() {
                    return;
                }
                for source in &pool.inner.sources {
                    if source.is_recoverable_failure() {
                        info!(source = source.name(), "re-attempting failed source");
                        source.invalidate();
                        let _ = source.ensure_ready(&cancel).await;
                    }
                }
            }
        })
    }
}

/// A scoped acquisition of (source, permit).
///
/// Dropping the handle returns the permit, decrements the source's active
/// count and refreshes the pool's cached DOP hint, no matter how the scope
/// exits.
pub struct PooledClient {
    inner: Arc<PoolInner>,
    index: usize,
    client: Arc<dyn OrganizationService>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient").field("index", &self.index).finish_non_exhaustive()
    }
}

impl PooledClient {
    pub fn client(&self) -> Arc<dyn OrganizationService> {
        self.client.clone()
    }

    pub fn source_name(&self) -> &str {
        self.inner.sources[self.index].name()
    }

    pub fn source_index(&self) -> usize {
        self.index
    }

    /// Records a successful request against this handle's source.
    pub fn report_success(&self) {
        self.inner.tracker.record_success(self.index);
    }

    /// Records a 429/503 against this handle's source.
    pub fn report_throttle(&self, retry_after: Option<Duration>) -> ThrottleDecision {
        self.inner.tracker.record_throttle(self.index, retry_after)
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.inner.active[self.index].fetch_sub(1, Ordering::AcqRel);
        if let Some(hint) = self.client.dop_hint() {
            self.inner.dop_hint.store(hint, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CredentialIdentity;
    use dvt_cancel::{CancellationTokenSource, never_cancels};
    use dvt_test_utils::{MockAuthProvider, MockService};
    use std::sync::atomic::AtomicUsize;

    fn source(name: &str, service: Arc<MockService>) -> ConnectionSource {
        ConnectionSource::new(
            CredentialIdentity::new(name, "https://env.crm.dynamics.com"),
            MockAuthProvider::ready(service),
        )
    }

    async fn ready_pool(names: &[&str], config: PoolConfig) -> (ConnectionPool, Vec<Arc<MockService>>) {
        let services: Vec<Arc<MockService>> = names.iter().map(|_| MockService::new()).collect();
        let sources = names
            .iter()
            .zip(&services)
            .map(|(name, service)| source(name, service.clone()))
            .collect();
        let pool = ConnectionPool::new(sources, config).unwrap();
        assert!(pool.ensure_initialized(&never_cancels()).await.is_usable());
        (pool, services)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (pool, _) = ready_pool(&["a"], PoolConfig::default()).await;
        {
            let handle = pool.acquire(&never_cancels()).await.unwrap();
            assert_eq!(handle.source_name(), "a");
            assert_eq!(pool.statistics().active, 1);
        }
        assert_eq!(pool.statistics().active, 0);
        assert_eq!(pool.statistics().requests_served, 1);
    }

    #[tokio::test]
    async fn test_active_never_exceeds_budget() {
        let config = PoolConfig { max_concurrency: 3, ..PoolConfig::default() };
        let (pool, _) = ready_pool(&["a", "b"], config).await;

        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _handle = pool.acquire(&never_cancels()).await.unwrap();
                    let active = pool.statistics().active;
                    peak.fetch_max(active, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::Relaxed) <= 3);
        assert_eq!(pool.statistics().active, 0);
        assert_eq!(pool.statistics().requests_served, 16);
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_pool_exhaustion() {
        let config = PoolConfig {
            max_concurrency: 1,
            acquire_timeout: Duration::from_millis(120),
            ..PoolConfig::default()
        };
        let (pool, _) = ready_pool(&["a"], config).await;

        let _held = pool.acquire(&never_cancels()).await.unwrap();
        let err = pool.acquire(&never_cancels()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PoolExhaustion);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_does_not_leak() {
        let config = PoolConfig { max_concurrency: 1, ..PoolConfig::default() };
        let (pool, _) = ready_pool(&["a"], config).await;

        let held = pool.acquire(&never_cancels()).await.unwrap();
        let cts = CancellationTokenSource::new();
        let token = cts.token();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cts.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::OperationCanceled);

        // the held permit is still the only one out; releasing it frees the pool
        drop(held);
        let fresh = pool.acquire(&never_cancels()).await;
        assert!(fresh.is_ok());
    }

    #[tokio::test]
    async fn test_throttle_aware_routes_around_hot_source() {
        let (pool, _) = ready_pool(&["a", "b"], PoolConfig::default()).await;

        // a simulated 429 on whichever source serves the first request
        let first = pool.acquire(&never_cancels()).await.unwrap();
        let hot = first.source_name().to_string();
        first.report_throttle(Some(Duration::from_secs(2)));
        drop(first);

        for _ in 0..4 {
            let handle = pool.acquire(&never_cancels()).await.unwrap();
            assert_ne!(handle.source_name(), hot);
        }
        assert_eq!(pool.statistics().throttle_events, 1);
    }

    #[tokio::test]
    async fn test_all_throttled_picks_soonest_free() {
        let (pool, _) = ready_pool(&["a", "b"], PoolConfig::default()).await;
        pool.tracker().record_throttle(0, Some(Duration::from_secs(30)));
        pool.tracker().record_throttle(1, Some(Duration::from_secs(1)));

        let handle = pool.acquire(&never_cancels()).await.unwrap();
        assert_eq!(handle.source_name(), "b");
    }

    #[tokio::test]
    async fn test_round_robin_skips_failed_source() {
        let ok_service = MockService::new();
        let sources = vec![
            source("good", ok_service),
            ConnectionSource::new(
                CredentialIdentity::new("bad", "https://env.crm.dynamics.com"),
                MockAuthProvider::failing(dvt_api::InitFailure::Auth("rejected".into())),
            ),
        ];
        let config = PoolConfig { strategy: SelectionStrategy::RoundRobin, ..PoolConfig::default() };
        let pool = ConnectionPool::new(sources, config).unwrap();
        let report = pool.ensure_initialized(&never_cancels()).await;
        assert_eq!(report.ready_count(), 1);
        assert!(report.is_usable());

        for _ in 0..4 {
            let handle = pool.acquire(&never_cancels()).await.unwrap();
            assert_eq!(handle.source_name(), "good");
        }
    }

    #[tokio::test]
    async fn test_ensure_initialized_is_idempotent() {
        let service = MockService::new();
        let provider = MockAuthProvider::ready(service);
        let sources = vec![ConnectionSource::new(
            CredentialIdentity::new("a", "https://env.crm.dynamics.com"),
            provider.clone(),
        )];
        let pool = ConnectionPool::new(sources, PoolConfig::default()).unwrap();
        pool.ensure_initialized(&never_cancels()).await;
        pool.ensure_initialized(&never_cancels()).await;
        assert_eq!(provider.attempts(), 1);
    }

    #[tokio::test]
    async fn test_dop_hint_captured_on_release() {
        let (pool, services) = ready_pool(&["a"], PoolConfig::default()).await;
        assert_eq!(pool.dop_hint(), None);
        services[0].set_dop_hint(4);
        let handle = pool.acquire(&never_cancels()).await.unwrap();
        drop(handle);
        assert_eq!(pool.dop_hint(), Some(4));
    }

    #[test]
    fn test_empty_pool_is_invalid() {
        let err = ConnectionPool::new(vec![], PoolConfig::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }

    #[tokio::test]
    async fn test_background_recovery_revives_network_failures() {
        let service = MockService::new();
        let provider = MockAuthProvider::failing_then_ready(
            service,
            vec![dvt_api::InitFailure::Network("dns failure".into())],
        );
        let sources = vec![ConnectionSource::new(
            CredentialIdentity::new("flaky", "https://env.crm.dynamics.com"),
            provider,
        )];
        let pool = ConnectionPool::new(sources, PoolConfig::default()).unwrap();
        let report = pool.ensure_initialized(&never_cancels()).await;
        assert_eq!(report.ready_count(), 0);

        let cts = CancellationTokenSource::new();
        let task = pool.spawn_background_recovery(Duration::from_millis(20), cts.token());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(pool.acquire(&never_cancels()).await.is_ok());
        cts.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_auth_failures_are_never_recovered() {
        let provider = MockAuthProvider::failing(dvt_api::InitFailure::Auth("rejected".into()));
        let sources = vec![ConnectionSource::new(
            CredentialIdentity::new("bad", "https://env.crm.dynamics.com"),
            provider.clone(),
        )];
        let pool = ConnectionPool::new(sources, PoolConfig::default()).unwrap();
        pool.ensure_initialized(&never_cancels()).await;
        let attempts_before = provider.attempts();

        let cts = CancellationTokenSource::new();
        let task = pool.spawn_background_recovery(Duration::from_millis(10), cts.token());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(provider.attempts(), attempts_before);
        cts.cancel();
        let _ = task.await;
    }
}
