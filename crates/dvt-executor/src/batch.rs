use std::time::Duration;

use dvt_api::{BypassPlugins, CallOptions, OperationKind, Row};
use dvt_error::ErrorRecord;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Immutable descriptor of one entity's worth of work.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub entity: String,
    pub operation: OperationKind,
    pub rows: Vec<Row>,
    pub max_batch_size: usize,
    pub bypass_plugins: BypassPlugins,
    pub bypass_flows: bool,
    pub continue_on_error: bool,
}

impl BatchRequest {
    pub fn new(entity: impl Into<String>, operation: OperationKind, rows: Vec<Row>) -> Self {
        BatchRequest {
            entity: entity.into(),
            operation,
            rows,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            bypass_plugins: BypassPlugins::None,
            bypass_flows: false,
            continue_on_error: false,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_bypass_plugins(mut self, bypass: BypassPlugins) -> Self {
        self.bypass_plugins = bypass;
        self
    }

    pub fn with_bypass_flows(mut self, bypass: bool) -> Self {
        self.bypass_flows = bypass;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub(crate) fn call_options(&self) -> CallOptions {
        CallOptions::new()
            .with_bypass_plugins(self.bypass_plugins)
            .with_bypass_flows(self.bypass_flows)
            .with_continue_on_error(self.continue_on_error)
    }
}

/// Lifecycle of one sub-batch, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubBatchState {
    Queued,
    Inflight,
    RetryPending,
    BulkRejected,
    FallbackInflight,
    Succeeded,
    Failed,
}

/// Aggregated outcome of a [BatchRequest].
///
/// `success_count + failure_count + skipped_count` always equals the row
/// count of the request: rows are never silently dropped. `skipped_count` is
/// non-zero only when a fail-fast or a cancellation stopped later sub-batches
/// from dispatching.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    /// Upsert split; zero for other operations.
    pub created_count: usize,
    pub updated_count: usize,
    /// Row-indexed failures, in row order.
    pub errors: Vec<ErrorRecord>,
    pub duration: Duration,
    /// True when the server refused bulk and rows went one by one.
    pub bulk_downgraded: bool,
}

impl BatchResult {
    pub fn total_rows(&self) -> usize {
        self.success_count + self.failure_count + self.skipped_count
    }

    pub fn merge(&mut self, other: BatchResult) {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.skipped_count += other.skipped_count;
        self.created_count += other.created_count;
        self.updated_count += other.updated_count;
        self.errors.extend(other.errors);
        self.bulk_downgraded |= other.bulk_downgraded;
    }
}
