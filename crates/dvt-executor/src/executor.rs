use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use dvt_api::{OperationKind, OrganizationService, Row, ServiceError};
use dvt_cancel::CancellationToken;
use dvt_error::{
    DvResult, ErrorCode, ErrorRecord, ReferenceDiagnostic, WarningRecord, classify_message,
    dv_err, extract_missing_reference,
};
use dvt_pool::{ConnectionPool, RetryError, RetryPolicy};
use futures::StreamExt as _;
use tracing::{debug, warn};

use crate::batch::{BatchRequest, BatchResult, SubBatchState};
use crate::progress::{ProgressEvent, ProgressSink};

pub const DEFAULT_PARALLELISM: usize = 4;
const DEFAULT_ERROR_SAMPLE_LIMIT: usize = 5;

/// Concurrency budget for sub-batch dispatch.
///
/// Normally `min(pool capacity, server DOP hint, configured parallelism)`.
/// While any source is backing off, the budget is the pool capacity alone:
/// extra tasks would only pile up on a semaphore that throttling has
/// effectively shrunk.
pub fn effective_concurrency(pool: &ConnectionPool, configured: usize) -> usize {
    if pool.any_throttled() {
        return pool.capacity();
    }
    let hint = pool.dop_hint().map_or(usize::MAX, |h| h as usize);
    pool.capacity().min(hint).min(configured).max(1)
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub configured_parallelism: usize,
    pub retry: RetryPolicy,
    /// How many row errors per request are surfaced as progress samples.
    pub error_sample_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            configured_parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::default(),
            error_sample_limit: DEFAULT_ERROR_SAMPLE_LIMIT,
        }
    }
}

enum SubBatchOutcome {
    Done(BatchResult),
    /// Run-level failure: throttle give-up or an unusable pool.
    Abort(Box<dvt_error::DvError>),
}

/// Shared flags and counters for one `execute` call.
struct RunState<'a> {
    request: &'a BatchRequest,
    sink: &'a dyn ProgressSink,
    started: Instant,
    total: usize,
    processed: AtomicUsize,
    /// Set on the first row failure when fail-fast is in effect.
    failure_flag: Arc<AtomicBool>,
    /// Sticky once the server refuses a bulk payload for this entity.
    bulk_refused: AtomicBool,
    refusal_warned: AtomicBool,
    samples_left: AtomicUsize,
}

impl RunState<'_> {
    fn note_rows_done(&self, count: usize) {
        let processed = self.processed.fetch_add(count, Ordering::Relaxed) + count;
        let elapsed = self.started.elapsed().as_secs_f64();
        let rps = if elapsed > 0.0 { processed as f64 / elapsed } else { 0.0 };
        self.sink.emit(ProgressEvent::EntityProgress {
            entity: self.request.entity.clone(),
            processed,
            total: self.total,
            rps,
        });
    }

    fn note_row_error(&self, record: &ErrorRecord) {
        if !self.request.continue_on_error {
            self.failure_flag.store(true, Ordering::Release);
        }
        let left = self.samples_left.load(Ordering::Relaxed);
        if left > 0
            && self
                .samples_left
                .compare_exchange(left, left - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.sink.emit(ProgressEvent::ErrorSample(record.clone()));
        }
    }

    fn note_bulk_refused(&self) {
        self.bulk_refused.store(true, Ordering::Release);
        if !self.refusal_warned.swap(true, Ordering::AcqRel) {
            let warning = WarningRecord::new(
                "BulkNotSupported",
                format!(
                    "{} does not support {} in bulk; falling back to single-row operations",
                    self.request.entity, self.request.operation
                ),
            )
            .with_entity(self.request.entity.clone())
            .with_impact("throughput".to_string());
            self.sink.emit(ProgressEvent::Warning(warning));
        }
    }
}

/// Dispatches [BatchRequest]s through the pool.
pub struct BulkExecutor {
    pool: ConnectionPool,
    config: ExecutorConfig,
}

impl BulkExecutor {
    pub fn new(pool: ConnectionPool, config: ExecutorConfig) -> Self {
        BulkExecutor { pool, config }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs the request to completion and returns the index-accurate result.
    ///
    /// Progress events are emitted per completed sub-batch, not per row.
    /// With `continue_on_error` unset, the first failing row cancels the
    /// sub-batches that have not dispatched yet; in-flight ones drain.
    pub async fn execute(
        &self,
        request: &BatchRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> DvResult<BatchResult> {
        let started = Instant::now();
        if request.rows.is_empty() {
            return Ok(BatchResult::default());
        }

        let state = RunState {
            request,
            sink,
            started,
            total: request.rows.len(),
            processed: AtomicUsize::new(0),
            failure_flag: Arc::new(AtomicBool::new(false)),
            bulk_refused: AtomicBool::new(false),
            refusal_warned: AtomicBool::new(false),
            samples_left: AtomicUsize::new(self.config.error_sample_limit),
        };
        let batch_cancel = if request.continue_on_error {
            cancel.clone()
        } else {
            cancel.clone().combine_with_flag(state.failure_flag.clone())
        };

        let chunks: Vec<(usize, &[Row])> = request
            .rows
            .chunks(request.max_batch_size)
            .enumerate()
            .map(|(i, chunk)| (i * request.max_batch_size, chunk))
            .collect();
        let concurrency = effective_concurrency(&self.pool, self.config.configured_parallelism);
        debug!(
            entity = %request.entity,
            rows = request.rows.len(),
            sub_batches = chunks.len(),
            concurrency,
            "dispatching batch request"
        );

        let mut outcomes = futures::stream::iter(chunks.into_iter().map(|(start, rows)| {
            let state = &state;
            let batch_cancel = &batch_cancel;
            async move { (start, self.run_sub_batch(state, start, rows, batch_cancel).await) }
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;
        outcomes.sort_by_key(|(start, _)| *start);

        let mut result = BatchResult::default();
        let mut abort: Option<Box<dvt_error::DvError>> = None;
        for (_, outcome) in outcomes {
            match outcome {
                SubBatchOutcome::Done(partial) => result.merge(partial),
                SubBatchOutcome::Abort(error) => abort = abort.or(Some(error)),
            }
        }
        if let Some(error) = abort {
            return Err(error);
        }
        result.errors.sort_by_key(|e| e.record_index);
        result.duration = started.elapsed();
        Ok(result)
    }

    async fn run_sub_batch(
        &self,
        state: &RunState<'_>,
        start: usize,
        rows: &[Row],
        cancel: &CancellationToken,
    ) -> SubBatchOutcome {
        let request = state.request;
        if cancel.is_cancelled() {
            return SubBatchOutcome::Done(BatchResult {
                skipped_count: rows.len(),
                ..BatchResult::default()
            });
        }

        if state.bulk_refused.load(Ordering::Acquire) {
            return self.run_fallback(state, start, rows, cancel).await;
        }

        self.trace_state(request, start, SubBatchState::Inflight);
        let options = request.call_options();
        let dispatch = self
            .config
            .retry
            .run(&self.pool, cancel, |client| {
                let options = options;
                async move {
                    dispatch_bulk(client, &request.operation, &request.entity, rows, &options).await
                }
            })
            .await;

        let outcome = match dispatch {
            Ok(response) => {
                let mut partial = BatchResult::default();
                for (local, row_outcome) in response.outcomes.iter().enumerate() {
                    match row_outcome {
                        Ok(success) => {
                            partial.success_count += 1;
                            match success.created {
                                Some(true) => partial.created_count += 1,
                                Some(false) => partial.updated_count += 1,
                                None => {}
                            }
                        }
                        Err(row_error) => {
                            let record = row_error_record(
                                request,
                                rows,
                                start,
                                local,
                                row_error.code,
                                &row_error.message,
                            );
                            state.note_row_error(&record);
                            partial.failure_count += 1;
                            partial.errors.push(record);
                        }
                    }
                }
                self.trace_state(
                    request,
                    start,
                    if partial.failure_count == 0 {
                        SubBatchState::Succeeded
                    } else {
                        SubBatchState::Failed
                    },
                );
                SubBatchOutcome::Done(partial)
            }
            Err(RetryError::Fatal(error)) if error.is_bulk_refusal() => {
                self.trace_state(request, start, SubBatchState::BulkRejected);
                state.note_bulk_refused();
                return self.run_fallback(state, start, rows, cancel).await;
            }
            Err(RetryError::Fatal(error)) | Err(RetryError::Exhausted(error)) => {
                self.trace_state(request, start, SubBatchState::Failed);
                SubBatchOutcome::Done(whole_batch_failure(state, start, rows, &error))
            }
            Err(RetryError::GaveUp(hint)) => SubBatchOutcome::Abort(dv_err!(
                ErrorCode::ThrottleGaveUp,
                "server asked to retry after {}s while importing {}",
                hint.as_secs(),
                request.entity
            )),
            Err(RetryError::Pool(error)) if error.code == ErrorCode::OperationCanceled => {
                SubBatchOutcome::Done(BatchResult {
                    skipped_count: rows.len(),
                    ..BatchResult::default()
                })
            }
            Err(RetryError::Pool(error)) if error.code == ErrorCode::PoolExhaustion => {
                self.trace_state(request, start, SubBatchState::Failed);
                SubBatchOutcome::Done(pool_exhaustion_failure(state, start, rows))
            }
            Err(RetryError::Pool(error)) => SubBatchOutcome::Abort(error),
        };
        if let SubBatchOutcome::Done(partial) = &outcome {
            state.note_rows_done(partial.success_count + partial.failure_count);
        }
        outcome
    }

    /// Replays the sub-batch as single-row operations, in row order, after a
    /// bulk refusal.
    async fn run_fallback(
        &self,
        state: &RunState<'_>,
        start: usize,
        rows: &[Row],
        cancel: &CancellationToken,
    ) -> SubBatchOutcome {
        let request = state.request;
        self.trace_state(request, start, SubBatchState::FallbackInflight);
        let options = request.call_options();
        let mut partial = BatchResult { bulk_downgraded: true, ..BatchResult::default() };

        for (local, row) in rows.iter().enumerate() {
            if cancel.is_cancelled() {
                partial.skipped_count += rows.len() - local;
                break;
            }
            let dispatch = self
                .config
                .retry
                .run(&self.pool, cancel, |client| {
                    let options = options;
                    async move {
                        dispatch_single(client, &request.operation, &request.entity, row, &options)
                            .await
                    }
                })
                .await;
            match dispatch {
                Ok(created) => {
                    partial.success_count += 1;
                    match created {
                        Some(true) => partial.created_count += 1,
                        Some(false) => partial.updated_count += 1,
                        None => {}
                    }
                }
                Err(RetryError::Fatal(error)) | Err(RetryError::Exhausted(error)) => {
                    let record = row_error_record(
                        request,
                        std::slice::from_ref(row),
                        start + local,
                        0,
                        error.platform_code,
                        &error.message,
                    );
                    state.note_row_error(&record);
                    partial.failure_count += 1;
                    partial.errors.push(record);
                }
                Err(RetryError::GaveUp(hint)) => {
                    return SubBatchOutcome::Abort(dv_err!(
                        ErrorCode::ThrottleGaveUp,
                        "server asked to retry after {}s while importing {}",
                        hint.as_secs(),
                        request.entity
                    ));
                }
                Err(RetryError::Pool(error)) if error.code == ErrorCode::OperationCanceled => {
                    partial.skipped_count += rows.len() - local;
                    break;
                }
                Err(RetryError::Pool(error)) if error.code == ErrorCode::PoolExhaustion => {
                    let record = ErrorRecord::new(&request.entity, error.to_string())
                        .with_index(start + local)
                        .with_pattern(dvt_error::ErrorPattern::PoolExhaustion);
                    state.note_row_error(&record);
                    partial.failure_count += 1;
                    partial.errors.push(record);
                }
                Err(RetryError::Pool(error)) => return SubBatchOutcome::Abort(error),
            }
        }
        self.trace_state(
            request,
            start,
            if partial.failure_count == 0 { SubBatchState::Succeeded } else { SubBatchState::Failed },
        );
        state.note_rows_done(partial.success_count + partial.failure_count);
        SubBatchOutcome::Done(partial)
    }

    fn trace_state(&self, request: &BatchRequest, start: usize, state: SubBatchState) {
        debug!(
            entity = %request.entity,
            sub_batch_start = start,
            state = ?state,
            "sub-batch state"
        );
    }
}

/// Builds the error record for one failed row, attaching dangling-reference
/// diagnostics when the message identifies the referenced entity.
fn row_error_record(
    request: &BatchRequest,
    scan_rows: &[Row],
    start: usize,
    local: usize,
    code: Option<i32>,
    message: &str,
) -> ErrorRecord {
    let pattern = classify_message(code, message);
    let mut record = ErrorRecord::new(&request.entity, message)
        .with_index(start + local)
        .with_pattern(pattern);
    if let Some(id) = scan_rows.get(local).and_then(|r| r.id) {
        record = record.with_record_id(id.to_string());
    }
    if let Some(code) = code {
        record = record.with_error_code(code);
    }
    record.with_diagnostics(reference_diagnostics(scan_rows, start, message))
}

/// Scans the failed sub-batch's rows for the reference the server says does
/// not exist.
fn reference_diagnostics(rows: &[Row], start: usize, message: &str) -> Vec<ReferenceDiagnostic> {
    let Some(info) = extract_missing_reference(message) else {
        return Vec::new();
    };
    let Some(id) = info.referenced_id else {
        return Vec::new();
    };
    rows.iter()
        .enumerate()
        .filter_map(|(local, row)| {
            row.references_id(&id).map(|field| ReferenceDiagnostic {
                row_index: start + local,
                field_name: info.field_name.clone().unwrap_or_else(|| field.to_string()),
                referenced_entity: info.referenced_entity.clone(),
                referenced_id: id.clone(),
            })
        })
        .collect()
}

/// The whole call failed with one business error: every row in the sub-batch
/// is recorded as failed with that message.
fn whole_batch_failure(
    state: &RunState<'_>,
    start: usize,
    rows: &[Row],
    error: &ServiceError,
) -> BatchResult {
    warn!(
        entity = %state.request.entity,
        sub_batch_start = start,
        %error,
        "sub-batch failed"
    );
    let mut partial = BatchResult::default();
    let diagnostics = reference_diagnostics(rows, start, &error.message);
    for (local, row) in rows.iter().enumerate() {
        let mut record = ErrorRecord::new(&state.request.entity, error.message.clone())
            .with_index(start + local)
            .with_pattern(classify_message(error.platform_code, &error.message));
        if let Some(id) = row.id {
            record = record.with_record_id(id.to_string());
        }
        if let Some(code) = error.platform_code {
            record = record.with_error_code(code);
        }
        let row_diagnostics: Vec<ReferenceDiagnostic> = diagnostics
            .iter()
            .filter(|d| d.row_index == start + local)
            .cloned()
            .collect();
        record = record.with_diagnostics(row_diagnostics);
        state.note_row_error(&record);
        partial.failure_count += 1;
        partial.errors.push(record);
    }
    partial
}

fn pool_exhaustion_failure(state: &RunState<'_>, start: usize, rows: &[Row]) -> BatchResult {
    let mut partial = BatchResult::default();
    for (local, _) in rows.iter().enumerate() {
        let record = ErrorRecord::new(
            &state.request.entity,
            "no pool capacity became available within the acquire timeout",
        )
        .with_index(start + local)
        .with_pattern(dvt_error::ErrorPattern::PoolExhaustion);
        state.note_row_error(&record);
        partial.failure_count += 1;
        partial.errors.push(record);
    }
    partial
}

async fn dispatch_bulk(
    client: Arc<dyn OrganizationService>,
    operation: &OperationKind,
    entity: &str,
    rows: &[Row],
    options: &dvt_api::CallOptions,
) -> Result<dvt_api::BulkResponse, ServiceError> {
    match operation {
        OperationKind::Create => client.create_multiple(entity, rows, options).await,
        OperationKind::Update => client.update_multiple(entity, rows, options).await,
        OperationKind::Upsert => client.upsert_multiple(entity, rows, options).await,
        OperationKind::Delete => {
            let ids: Vec<uuid::Uuid> = rows.iter().filter_map(|r| r.id).collect();
            client.delete_multiple(entity, &ids, options).await
        }
    }
}

/// Returns the created/updated flag for upserts, `None` otherwise.
async fn dispatch_single(
    client: Arc<dyn OrganizationService>,
    operation: &OperationKind,
    entity: &str,
    row: &Row,
    options: &dvt_api::CallOptions,
) -> Result<Option<bool>, ServiceError> {
    match operation {
        OperationKind::Create => client.create(entity, row, options).await.map(|_| None),
        OperationKind::Update => client.update(entity, row, options).await.map(|_| None),
        OperationKind::Upsert => client
            .upsert(entity, row, options)
            .await
            .map(|outcome| Some(outcome.created)),
        OperationKind::Delete => match row.id {
            Some(id) => client.delete(entity, id, options).await.map(|_| None),
            None => Err(ServiceError::status(400, "delete row is missing an id")),
        },
    }
}
