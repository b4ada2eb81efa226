//! Shared fixtures: a scriptable organization service and auth providers.
//!
//! Tests push [ScriptedResponse]s onto a mock service; each service call pops
//! one (an empty script means success). Every call is recorded so tests can
//! assert on what was dispatched and in which order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use dvt_api::{
    AuthenticationProvider, BulkResponse, BulkRowError, CallOptions, InitFailure,
    OrganizationService, PagingInfo, Row, RowPage, RowSuccess, ServiceError, UpsertOutcome,
};
use dvt_cancel::CancellationToken;

/// One scripted reaction to a service call.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Ok,
    /// HTTP 429 with an optional Retry-After.
    Throttle { retry_after: Option<Duration> },
    /// HTTP 503 with an optional Retry-After.
    Unavailable { retry_after: Option<Duration> },
    NetworkError,
    /// HTTP 500 with platform code 1205.
    Deadlock,
    /// The bulk form is refused for this entity.
    BulkRefusal,
    /// Whole-call business failure (single-row operations).
    BusinessError(String),
    /// Per-index business failures inside an otherwise-successful bulk call.
    RowFailures(Vec<(usize, String)>),
}

impl ScriptedResponse {
    fn to_service_error(&self) -> Option<ServiceError> {
        match self {
            ScriptedResponse::Ok | ScriptedResponse::RowFailures(_) => None,
            ScriptedResponse::Throttle { retry_after } => {
                let mut e = ServiceError::status(429, "Rate limit is exceeded.");
                if let Some(d) = retry_after {
                    e = e.with_retry_after(*d);
                }
                Some(e)
            }
            ScriptedResponse::Unavailable { retry_after } => {
                let mut e = ServiceError::status(503, "Service unavailable.");
                if let Some(d) = retry_after {
                    e = e.with_retry_after(*d);
                }
                Some(e)
            }
            ScriptedResponse::NetworkError => Some(ServiceError::network("connection reset")),
            ScriptedResponse::Deadlock => Some(
                ServiceError::status(500, "Transaction was chosen as the deadlock victim.")
                    .with_platform_code(1205),
            ),
            ScriptedResponse::BulkRefusal => Some(ServiceError::status(
                400,
                "CreateMultiple is not enabled on the entity.",
            )),
            ScriptedResponse::BusinessError(message) => {
                Some(ServiceError::status(400, message.clone()))
            }
        }
    }
}

/// What a test can assert on after the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub operation: String,
    pub entity: String,
    pub rows: usize,
}

#[derive(Default)]
pub struct MockService {
    script: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<CallRecord>>,
    captured_rows: Mutex<Vec<(String, String, Vec<Row>)>>,
    pages: Mutex<VecDeque<RowPage>>,
    call_count: AtomicUsize,
    dop_hint: AtomicU32,
    upsert_creates: AtomicBool,
}

impl MockService {
    pub fn new() -> Arc<Self> {
        Arc::new(MockService {
            upsert_creates: AtomicBool::new(true),
            ..MockService::default()
        })
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_n(&self, response: ScriptedResponse, n: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..n {
            script.push_back(response.clone());
        }
    }

    pub fn push_page(&self, page: RowPage) {
        self.pages.lock().unwrap().push_back(page);
    }

    pub fn set_dop_hint(&self, hint: u32) {
        self.dop_hint.store(hint, Ordering::Relaxed);
    }

    /// Marks subsequent upserts as updates instead of creates.
    pub fn upserts_update(&self) {
        self.upsert_creates.store(false, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    /// Row payloads seen by bulk calls, as `(operation, entity, rows)`.
    pub fn captured_rows(&self) -> Vec<(String, String, Vec<Row>)> {
        self.captured_rows.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    fn record(&self, operation: &str, entity: &str, rows: usize) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().unwrap().push(CallRecord {
            operation: operation.to_string(),
            entity: entity.to_string(),
            rows,
        });
    }

    fn capture(&self, operation: &str, entity: &str, rows: &[Row]) {
        self.captured_rows.lock().unwrap().push((
            operation.to_string(),
            entity.to_string(),
            rows.to_vec(),
        ));
    }

    fn next_scripted(&self) -> ScriptedResponse {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedResponse::Ok)
    }

    fn single_outcome(&self, operation: &str, entity: &str) -> Result<(), ServiceError> {
        self.record(operation, entity, 1);
        match self.next_scripted().to_service_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn bulk_outcome(
        &self,
        operation: &str,
        entity: &str,
        rows: usize,
        with_ids: bool,
    ) -> Result<BulkResponse, ServiceError> {
        self.record(operation, entity, rows);
        match self.next_scripted() {
            ScriptedResponse::RowFailures(failures) => {
                let mut outcomes: Vec<Result<RowSuccess, BulkRowError>> = (0..rows)
                    .map(|_| {
                        Ok(RowSuccess {
                            id: with_ids.then(Uuid::new_v4),
                            created: None,
                        })
                    })
                    .collect();
                for (index, message) in failures {
                    if index < rows {
                        outcomes[index] = Err(BulkRowError {
                            index,
                            code: None,
                            message,
                        });
                    }
                }
                Ok(BulkResponse { outcomes })
            }
            other => match other.to_service_error() {
                Some(e) => Err(e),
                None => Ok(BulkResponse::all_succeeded(
                    (0..rows).map(|_| with_ids.then(Uuid::new_v4)),
                )),
            },
        }
    }
}

#[async_trait]
impl OrganizationService for MockService {
    async fn create(
        &self,
        entity: &str,
        _row: &Row,
        _options: &CallOptions,
    ) -> Result<Uuid, ServiceError> {
        self.single_outcome("create", entity).map(|_| Uuid::new_v4())
    }

    async fn update(
        &self,
        entity: &str,
        _row: &Row,
        _options: &CallOptions,
    ) -> Result<(), ServiceError> {
        self.single_outcome("update", entity)
    }

    async fn upsert(
        &self,
        entity: &str,
        row: &Row,
        _options: &CallOptions,
    ) -> Result<UpsertOutcome, ServiceError> {
        self.single_outcome("upsert", entity).map(|_| UpsertOutcome {
            id: row.id.unwrap_or_else(Uuid::new_v4),
            created: self.upsert_creates.load(Ordering::Relaxed),
        })
    }

    async fn delete(
        &self,
        entity: &str,
        _id: Uuid,
        _options: &CallOptions,
    ) -> Result<(), ServiceError> {
        self.single_outcome("delete", entity)
    }

    async fn create_multiple(
        &self,
        entity: &str,
        rows: &[Row],
        _options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError> {
        self.capture("create_multiple", entity, rows);
        self.bulk_outcome("create_multiple", entity, rows.len(), true)
    }

    async fn update_multiple(
        &self,
        entity: &str,
        rows: &[Row],
        _options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError> {
        self.capture("update_multiple", entity, rows);
        self.bulk_outcome("update_multiple", entity, rows.len(), false)
    }

    async fn upsert_multiple(
        &self,
        entity: &str,
        rows: &[Row],
        _options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError> {
        let created = self.upsert_creates.load(Ordering::Relaxed);
        self.capture("upsert_multiple", entity, rows);
        self.bulk_outcome("upsert_multiple", entity, rows.len(), true)
            .map(|mut response| {
                for outcome in response.outcomes.iter_mut().flatten() {
                    outcome.created = Some(created);
                }
                response
            })
    }

    async fn delete_multiple(
        &self,
        entity: &str,
        ids: &[Uuid],
        _options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError> {
        self.bulk_outcome("delete_multiple", entity, ids.len(), false)
    }

    async fn retrieve_multiple(
        &self,
        fetch_xml: &str,
        _paging: Option<&PagingInfo>,
    ) -> Result<RowPage, ServiceError> {
        self.record("retrieve_multiple", fetch_xml, 0);
        if let Some(e) = self.next_scripted().to_service_error() {
            return Err(e);
        }
        Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn associate(
        &self,
        relationship: &str,
        _entity: &str,
        _id: Uuid,
        _related_entity: &str,
        related_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        self.record("associate", relationship, related_ids.len());
        match self.next_scripted().to_service_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn disassociate(
        &self,
        relationship: &str,
        _entity: &str,
        _id: Uuid,
        _related_entity: &str,
        related_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        self.record("disassociate", relationship, related_ids.len());
        match self.next_scripted().to_service_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dop_hint(&self) -> Option<u32> {
        match self.dop_hint.load(Ordering::Relaxed) {
            0 => None,
            hint => Some(hint),
        }
    }
}

/// Auth provider that hands out a prepared mock service, optionally failing
/// the first N attempts with a classified failure.
pub struct MockAuthProvider {
    service: Arc<MockService>,
    failures: Mutex<VecDeque<InitFailure>>,
    attempts: AtomicUsize,
}

impl MockAuthProvider {
    pub fn ready(service: Arc<MockService>) -> Arc<Self> {
        Arc::new(MockAuthProvider {
            service,
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn failing(failure: InitFailure) -> Arc<Self> {
        let provider = Self::ready(MockService::new());
        // A failure pushed for every attempt a test plausibly makes
        provider.failures.lock().unwrap().extend((0..64).map(|_| failure.clone()));
        provider
    }

    pub fn failing_then_ready(service: Arc<MockService>, failures: Vec<InitFailure>) -> Arc<Self> {
        let provider = Self::ready(service);
        provider.failures.lock().unwrap().extend(failures);
        provider
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AuthenticationProvider for MockAuthProvider {
    async fn authenticate(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Arc<dyn OrganizationService>, InitFailure> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        Ok(self.service.clone() as Arc<dyn OrganizationService>)
    }
}

/// A row with a `name` attribute, the smallest payload worth importing.
pub fn named_row(name: &str) -> Row {
    let mut row = Row::new().with_id(Uuid::new_v4());
    row.set("name", json!(name));
    row
}

/// `count` rows named `row-0..row-n`.
pub fn named_rows(count: usize) -> Vec<Row> {
    (0..count).map(|i| named_row(&format!("row-{i}"))).collect()
}
