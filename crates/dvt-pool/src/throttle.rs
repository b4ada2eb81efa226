use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// First backoff step when the server sends no `Retry-After`.
pub const THROTTLE_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Upper bound for the exponential floor.
pub const THROTTLE_BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Consecutive clean successes after which the throttle count fully resets.
const CLEAN_SUCCESS_RESET: u32 = 10;

/// How many recent throttle instants each source remembers.
const RECENT_THROTTLE_CAPACITY: usize = 32;

/// Outcome of recording a throttle response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Wait this long before the source is usable again.
    Backoff(Duration),
    /// The server asked for more patience than the caller tolerates; the
    /// orchestrator should fail fast instead of sleeping.
    GiveUp(Duration),
}

#[derive(Debug, Default)]
struct ThrottleState {
    throttled_until: Option<Instant>,
    consecutive_throttle_count: u32,
    success_streak: u32,
    total_backoff: Duration,
    recent_throttles: VecDeque<Instant>,
}

impl ThrottleState {
    /// Exponential floor: base * 2^count, capped at the ceiling.
    fn exponential_floor(&self) -> Duration {
        let shift = self.consecutive_throttle_count.min(16);
        let floor = THROTTLE_BACKOFF_BASE.saturating_mul(1u32 << shift);
        floor.min(THROTTLE_BACKOFF_CEILING)
    }
}

/// Tracks per-source throttle state. All operations are non-blocking: the
/// per-source lock is held only for the state transition itself.
#[derive(Debug)]
pub struct ThrottleTracker {
    states: Vec<Mutex<ThrottleState>>,
    throttle_events: AtomicU64,
    /// Server-advised waits the orchestrator refuses to sleep through.
    max_tolerance: Option<Duration>,
}

impl ThrottleTracker {
    pub fn new(source_count: usize) -> Self {
        ThrottleTracker {
            states: (0..source_count).map(|_| Mutex::new(ThrottleState::default())).collect(),
            throttle_events: AtomicU64::new(0),
            max_tolerance: None,
        }
    }

    pub fn with_max_tolerance(mut self, max_tolerance: Duration) -> Self {
        self.max_tolerance = Some(max_tolerance);
        self
    }

    pub fn source_count(&self) -> usize {
        self.states.len()
    }

    /// Records a 429/503 observed on `source`.
    ///
    /// The backoff deadline only ever moves forward; a shorter hint arriving
    /// while a longer backoff is pending does not shrink it.
    pub fn record_throttle(
        &self,
        source: usize,
        retry_after: Option<Duration>,
    ) -> ThrottleDecision {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.states[source].lock().unwrap();

        let floor = state.exponential_floor();
        let delay = retry_after.map_or(floor, |hint| hint.max(floor));

        state.consecutive_throttle_count += 1;
        state.success_streak = 0;
        state.total_backoff += delay;
        let candidate = now + delay;
        state.throttled_until = Some(match state.throttled_until {
            Some(existing) => existing.max(candidate),
            None => candidate,
        });
        if state.recent_throttles.len() == RECENT_THROTTLE_CAPACITY {
            state.recent_throttles.pop_front();
        }
        state.recent_throttles.push_back(now);

        match (retry_after, self.max_tolerance) {
            (Some(hint), Some(tolerance)) if hint > tolerance => ThrottleDecision::GiveUp(hint),
            _ => ThrottleDecision::Backoff(delay),
        }
    }

    /// Records a successful request on `source`.
    ///
    /// A success after the backoff has elapsed decays the consecutive count
    /// by one; ten clean successes in a row reset it entirely.
    pub fn record_success(&self, source: usize) {
        let now = Instant::now();
        let mut state = self.states[source].lock().unwrap();
        let backoff_elapsed = state.throttled_until.is_none_or(|until| now >= until);
        if backoff_elapsed {
            state.consecutive_throttle_count = state.consecutive_throttle_count.saturating_sub(1);
            state.success_streak += 1;
            if state.success_streak >= CLEAN_SUCCESS_RESET {
                state.consecutive_throttle_count = 0;
                state.throttled_until = None;
                state.success_streak = 0;
            }
        }
    }

    pub fn is_throttled(&self, source: usize) -> bool {
        let state = self.states[source].lock().unwrap();
        state.throttled_until.is_some_and(|until| Instant::now() < until)
    }

    /// Time until the source's backoff deadline, zero when not throttled.
    pub fn backoff_remaining(&self, source: usize) -> Duration {
        let state = self.states[source].lock().unwrap();
        match state.throttled_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// 429/503 instants seen on `source` within the trailing window.
    pub fn recent_throttle_count(&self, source: usize, window: Duration) -> usize {
        let cutoff = Instant::now() - window;
        let state = self.states[source].lock().unwrap();
        state.recent_throttles.iter().filter(|t| **t >= cutoff).count()
    }

    /// Total 429/503 responses observed across all sources.
    pub fn throttle_events(&self) -> u64 {
        self.throttle_events.load(Ordering::Relaxed)
    }

    /// Sum of all backoff delays imposed so far.
    pub fn total_backoff(&self) -> Duration {
        self.states
            .iter()
            .map(|s| s.lock().unwrap().total_backoff)
            .sum()
    }

    /// True if every source is currently inside a backoff window.
    pub fn all_throttled(&self) -> bool {
        (0..self.states.len()).all(|i| self.is_throttled(i))
    }
}
