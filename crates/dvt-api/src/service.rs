use async_trait::async_trait;
use uuid::Uuid;

use crate::{CallOptions, Row, RowPage, ServiceError};

/// Result of a single upsert: the row id and whether the server created or
/// updated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub created: bool,
}

/// One failed row inside a bulk response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRowError {
    pub index: usize,
    pub code: Option<i32>,
    pub message: String,
}

/// One successful row inside a bulk response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowSuccess {
    pub id: Option<Uuid>,
    /// Set for upserts: whether the row was created (vs. updated).
    pub created: Option<bool>,
}

/// Index-ordered outcome of a bulk call.
///
/// `outcomes.len()` always equals the submitted row count: the service either
/// reports every row or fails the whole call with a [ServiceError].
#[derive(Debug, Clone, Default)]
pub struct BulkResponse {
    pub outcomes: Vec<Result<RowSuccess, BulkRowError>>,
}

impl BulkResponse {
    pub fn all_succeeded(ids: impl IntoIterator<Item = Option<Uuid>>) -> Self {
        BulkResponse {
            outcomes: ids
                .into_iter()
                .map(|id| Ok(RowSuccess { id, created: None }))
                .collect(),
        }
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}

/// Position of the next query page to fetch.
#[derive(Debug, Clone, Default)]
pub struct PagingInfo {
    /// 1-based page number.
    pub page: u32,
    pub count: u32,
    pub cookie: Option<String>,
}

/// The remote organization service the migration core drives.
///
/// All operations are asynchronous and return typed [ServiceError]s so that
/// throttling (429/503 + Retry-After), deadlock codes and bulk refusals are
/// observable to the retry policy and the executor.
#[async_trait]
pub trait OrganizationService: Send + Sync {
    async fn create(
        &self,
        entity: &str,
        row: &Row,
        options: &CallOptions,
    ) -> Result<Uuid, ServiceError>;

    /// The row must carry its id.
    async fn update(
        &self,
        entity: &str,
        row: &Row,
        options: &CallOptions,
    ) -> Result<(), ServiceError>;

    async fn upsert(
        &self,
        entity: &str,
        row: &Row,
        options: &CallOptions,
    ) -> Result<UpsertOutcome, ServiceError>;

    async fn delete(
        &self,
        entity: &str,
        id: Uuid,
        options: &CallOptions,
    ) -> Result<(), ServiceError>;

    async fn create_multiple(
        &self,
        entity: &str,
        rows: &[Row],
        options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError>;

    async fn update_multiple(
        &self,
        entity: &str,
        rows: &[Row],
        options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError>;

    async fn upsert_multiple(
        &self,
        entity: &str,
        rows: &[Row],
        options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError>;

    async fn delete_multiple(
        &self,
        entity: &str,
        ids: &[Uuid],
        options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError>;

    /// Runs a FetchXML query and returns one page of rows.
    async fn retrieve_multiple(
        &self,
        fetch_xml: &str,
        paging: Option<&PagingInfo>,
    ) -> Result<RowPage, ServiceError>;

    /// Links pairs through a many-to-many relationship.
    async fn associate(
        &self,
        relationship: &str,
        entity: &str,
        id: Uuid,
        related_entity: &str,
        related_ids: &[Uuid],
    ) -> Result<(), ServiceError>;

    async fn disassociate(
        &self,
        relationship: &str,
        entity: &str,
        id: Uuid,
        related_entity: &str,
        related_ids: &[Uuid],
    ) -> Result<(), ServiceError>;

    /// Server-advised degrees-of-parallelism hint captured from the most
    /// recent response, if any was seen.
    fn dop_hint(&self) -> Option<u32>;
}

impl std::fmt::Debug for dyn OrganizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrganizationService").finish_non_exhaustive()
    }
}
