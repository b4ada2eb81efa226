use std::collections::BTreeMap;
use std::path::PathBuf;

use dvt_api::{PagingInfo, rest::fetch_entity_name};
use dvt_cancel::CancellationToken;
use dvt_error::{DvResult, ErrorCode, err};
use dvt_pool::{ConnectionPool, RetryPolicy};
use dvt_sql::{VirtualColumn, transpile_sql};
use tracing::info;

use crate::archive::ArchiveWriter;

pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// One export run: a query against the source environment, streamed into a
/// data archive.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub source_env_url: String,
    /// SQL, or raw query XML when it starts with `<`.
    pub query: String,
    pub archive_path: PathBuf,
    pub page_size: u32,
}

impl ExportRequest {
    pub fn new(
        source_env_url: impl Into<String>,
        query: impl Into<String>,
        archive_path: impl Into<PathBuf>,
    ) -> Self {
        ExportRequest {
            source_env_url: source_env_url.into(),
            query: query.into(),
            archive_path: archive_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub entity: String,
    pub rows_exported: usize,
    pub pages: usize,
    /// Display-name columns to resolve client-side after retrieval.
    pub virtual_columns: BTreeMap<String, VirtualColumn>,
}

/// Pages the query through the pool and writes rows into a fresh archive.
pub async fn run_export(
    pool: &ConnectionPool,
    request: &ExportRequest,
    cancel: &CancellationToken,
) -> DvResult<ExportOutcome> {
    let (fetch_xml, virtual_columns) = if request.query.trim_start().starts_with('<') {
        (request.query.clone(), BTreeMap::new())
    } else {
        let transpiled = transpile_sql(&request.query)?;
        (transpiled.xml, transpiled.virtual_columns)
    };
    let entity = fetch_entity_name(&fetch_xml)
        .ok_or_else(|| {
            dvt_error::dv_err!(ErrorCode::InvalidArgument, "query names no entity")
        })?
        .to_string();
    if request.page_size == 0 {
        return err!(ErrorCode::InvalidArgument, "page size must be greater than zero");
    }

    let mut writer =
        ArchiveWriter::create(&request.archive_path, Some(request.source_env_url.clone()))?;
    let retry = RetryPolicy::default();
    let mut page = 1u32;
    let mut cookie: Option<String> = None;
    let mut rows_exported = 0usize;
    let mut pages = 0usize;

    loop {
        cancel.check_cancellation()?;
        let paging = PagingInfo { page, count: request.page_size, cookie: cookie.clone() };
        let result = retry
            .run(pool, cancel, |client| {
                let fetch_xml = fetch_xml.clone();
                let paging = paging.clone();
                async move { client.retrieve_multiple(&fetch_xml, Some(&paging)).await }
            })
            .await
            .map_err(|e| e.into_dv_error())?;

        writer.write_rows(&entity, &result.rows)?;
        rows_exported += result.rows.len();
        pages += 1;
        info!(entity = %entity, page, rows = result.rows.len(), "page exported");
        if !result.more_records {
            break;
        }
        cookie = result.paging_cookie;
        page += 1;
    }

    writer.finish()?;
    Ok(ExportOutcome { entity, rows_exported, pages, virtual_columns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DataArchive;
    use dvt_cancel::{CancellationTokenSource, never_cancels};
    use dvt_pool::{ConnectionSource, CredentialIdentity, PoolConfig};
    use dvt_test_utils::{MockAuthProvider, MockService, named_rows};
    use std::sync::Arc;

    async fn pool_with(service: Arc<MockService>) -> ConnectionPool {
        let sources = vec![ConnectionSource::new(
            CredentialIdentity::new("src", "https://src.crm.dynamics.com"),
            MockAuthProvider::ready(service),
        )];
        let pool = ConnectionPool::new(sources, PoolConfig::default()).unwrap();
        pool.ensure_initialized(&never_cancels()).await;
        pool
    }

    #[tokio::test]
    async fn test_export_pages_until_drained() {
        let service = MockService::new();
        service.push_page(dvt_api::RowPage {
            rows: named_rows(2),
            more_records: true,
            paging_cookie: Some("<cookie page=\"1\"/>".to_string()),
        });
        service.push_page(dvt_api::RowPage {
            rows: named_rows(1),
            more_records: false,
            paging_cookie: None,
        });
        let pool = pool_with(service.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let request = ExportRequest::new(
            "https://src.crm.dynamics.com",
            "SELECT name, owneridname FROM account",
            dir.path().join("archive"),
        );
        let outcome = run_export(&pool, &request, &never_cancels()).await.unwrap();

        assert_eq!(outcome.entity, "account");
        assert_eq!(outcome.rows_exported, 3);
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.virtual_columns["owneridname"].base_column, "ownerid");

        let archive = DataArchive::open(&dir.path().join("archive")).unwrap();
        assert_eq!(archive.row_count("account"), 3);
        assert_eq!(archive.read_rows("account").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_export_accepts_raw_query_xml() {
        let service = MockService::new();
        service.push_page(dvt_api::RowPage {
            rows: named_rows(1),
            more_records: false,
            paging_cookie: None,
        });
        let pool = pool_with(service).await;

        let dir = tempfile::tempdir().unwrap();
        let request = ExportRequest::new(
            "https://src.crm.dynamics.com",
            "<fetch><entity name=\"contact\"><all-attributes/></entity></fetch>",
            dir.path().join("archive"),
        );
        let outcome = run_export(&pool, &request, &never_cancels()).await.unwrap();
        assert_eq!(outcome.entity, "contact");
        assert!(outcome.virtual_columns.is_empty());
    }

    #[tokio::test]
    async fn test_export_empty_result_still_writes_archive() {
        let service = MockService::new();
        let pool = pool_with(service).await;
        let dir = tempfile::tempdir().unwrap();
        let request = ExportRequest::new(
            "https://src.crm.dynamics.com",
            "SELECT name FROM account",
            dir.path().join("archive"),
        );
        let outcome = run_export(&pool, &request, &never_cancels()).await.unwrap();
        assert_eq!(outcome.rows_exported, 0);
        let archive = DataArchive::open(&dir.path().join("archive")).unwrap();
        assert_eq!(archive.row_count("account"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_export_stops() {
        let cts = CancellationTokenSource::new();
        let token = cts.token();
        cts.cancel();
        let service = MockService::new();
        let pool = pool_with(service.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let request = ExportRequest::new(
            "https://src.crm.dynamics.com",
            "SELECT name FROM account",
            dir.path().join("archive"),
        );
        let err = run_export(&pool, &request, &token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::OperationCanceled);
        assert_eq!(service.call_count(), 0);
    }
}
