//! reqwest-based implementation of [OrganizationService] against the
//! Dataverse Web API.
//!
//! Two transport-level decisions live here and nowhere else:
//!
//! - The affinity cookie is never replayed: the HTTP client is built without
//!   a cookie store, so every request may land on a different backend node.
//! - The `x-ms-dop-hint` response header is captured after every call and
//!   exposed through [OrganizationService::dop_hint].

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use serde_json::{Map, Value, json};
use url::Url;
use uuid::Uuid;

use crate::{
    BulkResponse, BulkRowError, BypassPlugins, CallOptions, OrganizationService, PagingInfo, Row,
    RowPage, RowSuccess, ServiceError, UpsertOutcome,
};

/// Server-advised degrees-of-parallelism response header.
pub const DOP_HINT_HEADER: &str = "x-ms-dop-hint";

const API_PATH: &str = "api/data/v9.2";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Derives the Web API entity-set name from an entity logical name.
///
/// The platform pluralizes logical names with English rules; the handful of
/// irregular sets a migration meets in practice follow the y/s/x suffixes.
pub fn entity_set_name(entity: &str) -> String {
    if let Some(stem) = entity.strip_suffix('y') {
        if !stem.is_empty() && !stem.ends_with(|c: char| "aeiou".contains(c)) {
            return format!("{stem}ies");
        }
    }
    if entity.ends_with('s') || entity.ends_with('x') || entity.ends_with("ch") {
        return format!("{entity}es");
    }
    format!("{entity}s")
}

/// Parses a `Retry-After` header value (delta-seconds form).
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn parse_dop_hint(headers: &HeaderMap) -> Option<u32> {
    headers.get(DOP_HINT_HEADER)?.to_str().ok()?.trim().parse().ok()
}

/// Returns the outer entity logical name of a FetchXML document.
pub fn fetch_entity_name(fetch_xml: &str) -> Option<&str> {
    let start = fetch_xml.find("<entity")?;
    let rest = &fetch_xml[start..];
    let name_at = rest.find("name=\"")? + "name=\"".len();
    let end = rest[name_at..].find('"')?;
    Some(&rest[name_at..name_at + end])
}

/// Splices `page`/`count`/`paging-cookie` attributes into the `<fetch`
/// element of a query.
pub fn inject_paging(fetch_xml: &str, paging: &PagingInfo) -> String {
    let Some(pos) = fetch_xml.find("<fetch") else {
        return fetch_xml.to_string();
    };
    let insert_at = pos + "<fetch".len();
    let mut attrs = format!(" page=\"{}\" count=\"{}\"", paging.page, paging.count);
    if let Some(cookie) = &paging.cookie {
        attrs.push_str(&format!(" paging-cookie=\"{}\"", xml_attr_escape(cookie)));
    }
    let mut out = String::with_capacity(fetch_xml.len() + attrs.len());
    out.push_str(&fetch_xml[..insert_at]);
    out.push_str(&attrs);
    out.push_str(&fetch_xml[insert_at..]);
    out
}

fn xml_attr_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Parses the platform's `{"error": {"code": ..., "message": ...}}` body.
pub fn parse_error_body(status: u16, headers: &HeaderMap, body: &str) -> ServiceError {
    let (code, message) = match serde_json::from_str::<Value>(body) {
        Ok(value) => {
            let code = value["error"]["code"]
                .as_str()
                .and_then(|c| c.parse::<i32>().ok())
                .or_else(|| value["error"]["code"].as_i64().map(|c| c as i32));
            let message = value["error"]["message"]
                .as_str()
                .map(|m| m.to_string())
                .unwrap_or_else(|| body.to_string());
            (code, message)
        }
        Err(_) => (None, body.to_string()),
    };
    let mut err = ServiceError::status(status, message);
    if let Some(code) = code {
        err = err.with_platform_code(code);
    }
    if let Some(retry_after) = parse_retry_after(headers) {
        err = err.with_retry_after(retry_after);
    }
    err
}

fn map_transport_error(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::timeout(e.to_string())
    } else {
        ServiceError::network(e.to_string())
    }
}

/// The row as it goes over the wire: attributes plus the primary key when the
/// row carries an id.
fn wire_row(entity: &str, row: &Row) -> Value {
    let mut map: Map<String, Value> = row.attributes.clone();
    if let Some(id) = row.id {
        map.insert(format!("{entity}id"), json!(id.to_string()));
    }
    Value::Object(map)
}

pub struct RestOrganizationService {
    http: reqwest::Client,
    base: Url,
    access_token: String,
    /// 0 means "no hint observed yet".
    dop_hint: AtomicU32,
}

impl RestOrganizationService {
    pub fn new(environment_url: &str, access_token: &str) -> Result<Self, ServiceError> {
        Self::with_timeout(environment_url, access_token, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        environment_url: &str,
        access_token: &str,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let base = Url::parse(environment_url)
            .map_err(|e| ServiceError::network(format!("invalid environment url: {e}")))?;
        // No cookie store: the server's affinity cookie would pin every
        // request to one backend node and serialize throughput.
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_transport_error)?;
        Ok(RestOrganizationService {
            http,
            base,
            access_token: access_token.to_string(),
            dop_hint: AtomicU32::new(0),
        })
    }

    fn api_url(&self, suffix: &str) -> Result<Url, ServiceError> {
        self.base
            .join(&format!("{API_PATH}/{suffix}"))
            .map_err(|e| ServiceError::network(format!("invalid request url: {e}")))
    }

    fn record_hints(&self, headers: &HeaderMap) {
        if let Some(hint) = parse_dop_hint(headers) {
            self.dop_hint.store(hint, Ordering::Relaxed);
        }
    }

    fn apply_options(
        &self,
        mut req: reqwest::RequestBuilder,
        options: &CallOptions,
    ) -> reqwest::RequestBuilder {
        req = req
            .bearer_auth(&self.access_token)
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header(http::header::ACCEPT, "application/json");
        match options.bypass_plugins {
            BypassPlugins::None => {}
            BypassPlugins::Sync => {
                req = req.header("MSCRM.BypassBusinessLogicExecution", "CustomSync");
            }
            BypassPlugins::Async => {
                req = req.header("MSCRM.BypassBusinessLogicExecution", "CustomAsync");
            }
            BypassPlugins::All => {
                req = req.header("MSCRM.BypassBusinessLogicExecution", "CustomSync,CustomAsync");
            }
        }
        if options.bypass_flows {
            req = req.header("MSCRM.SuppressCallbackRegistrationExpanderJob", "true");
        }
        if options.continue_on_error {
            req = req.header("Prefer", "odata.continue-on-error");
        }
        req
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<(u16, HeaderMap, String), ServiceError> {
        let response = req.send().await.map_err(map_transport_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        self.record_hints(&headers);
        let body = response.text().await.map_err(map_transport_error)?;
        if (200..300).contains(&status) {
            Ok((status, headers, body))
        } else {
            Err(parse_error_body(status, &headers, &body))
        }
    }

    /// Extracts the created row id from an `OData-EntityId` header.
    fn entity_id_from(headers: &HeaderMap) -> Result<Uuid, ServiceError> {
        let raw = headers
            .get("OData-EntityId")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServiceError::network("missing OData-EntityId header".to_string()))?;
        let open = raw.rfind('(');
        let close = raw.rfind(')');
        match (open, close) {
            (Some(open), Some(close)) if open < close => Uuid::parse_str(&raw[open + 1..close])
                .map_err(|e| ServiceError::network(format!("malformed entity id: {e}"))),
            _ => Err(ServiceError::network(format!("malformed OData-EntityId: {raw}"))),
        }
    }

    /// Parses a bulk action response: `Ids` for creates/upserts, `Errors`
    /// with per-index failures under continue-on-error.
    fn parse_bulk_response(body: &str, row_count: usize) -> BulkResponse {
        let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        let mut outcomes: Vec<Result<RowSuccess, BulkRowError>> = (0..row_count)
            .map(|_| Ok(RowSuccess::default()))
            .collect();
        if let Some(ids) = value["Ids"].as_array() {
            for (index, id) in ids.iter().enumerate().take(row_count) {
                if let Some(id) = id.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    outcomes[index] = Ok(RowSuccess { id: Some(id), created: None });
                }
            }
        }
        if let Some(errors) = value["Errors"].as_array() {
            for error in errors {
                let Some(index) = error["Index"].as_u64().map(|i| i as usize) else {
                    continue;
                };
                if index < row_count {
                    outcomes[index] = Err(BulkRowError {
                        index,
                        code: error["Code"].as_i64().map(|c| c as i32),
                        message: error["Message"].as_str().unwrap_or("row failed").to_string(),
                    });
                }
            }
        }
        BulkResponse { outcomes }
    }

    async fn bulk_action(
        &self,
        entity: &str,
        action: &str,
        rows: &[Row],
        options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError> {
        let set = entity_set_name(entity);
        let url = self.api_url(&format!("{set}/Microsoft.Dynamics.CRM.{action}"))?;
        let targets: Vec<Value> = rows.iter().map(|row| wire_row(entity, row)).collect();
        let req = self
            .apply_options(self.http.post(url), options)
            .json(&json!({ "Targets": targets }));
        let (_, _, body) = self.send(req).await?;
        Ok(Self::parse_bulk_response(&body, rows.len()))
    }
}

#[async_trait]
impl OrganizationService for RestOrganizationService {
    async fn create(
        &self,
        entity: &str,
        row: &Row,
        options: &CallOptions,
    ) -> Result<Uuid, ServiceError> {
        let url = self.api_url(&entity_set_name(entity))?;
        let req = self
            .apply_options(self.http.post(url), options)
            .json(&wire_row(entity, row));
        let (_, headers, _) = self.send(req).await?;
        Self::entity_id_from(&headers)
    }

    async fn update(
        &self,
        entity: &str,
        row: &Row,
        options: &CallOptions,
    ) -> Result<(), ServiceError> {
        let id = row
            .id
            .ok_or_else(|| ServiceError::network("update row is missing an id".to_string()))?;
        let url = self.api_url(&format!("{}({id})", entity_set_name(entity)))?;
        let req = self
            .apply_options(self.http.patch(url), options)
            // Update-only: never create through the update path
            .header(http::header::IF_MATCH, "*")
            .json(&Value::Object(row.attributes.clone()));
        self.send(req).await.map(|_| ())
    }

    async fn upsert(
        &self,
        entity: &str,
        row: &Row,
        options: &CallOptions,
    ) -> Result<UpsertOutcome, ServiceError> {
        let id = row
            .id
            .ok_or_else(|| ServiceError::network("upsert row is missing an id".to_string()))?;
        let url = self.api_url(&format!("{}({id})", entity_set_name(entity)))?;
        let req = self
            .apply_options(self.http.patch(url), options)
            .json(&Value::Object(row.attributes.clone()));
        let (status, _, _) = self.send(req).await?;
        Ok(UpsertOutcome { id, created: status == 201 })
    }

    async fn delete(
        &self,
        entity: &str,
        id: Uuid,
        options: &CallOptions,
    ) -> Result<(), ServiceError> {
        let url = self.api_url(&format!("{}({id})", entity_set_name(entity)))?;
        let req = self.apply_options(self.http.delete(url), options);
        self.send(req).await.map(|_| ())
    }

    async fn create_multiple(
        &self,
        entity: &str,
        rows: &[Row],
        options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError> {
        self.bulk_action(entity, "CreateMultiple", rows, options).await
    }

    async fn update_multiple(
        &self,
        entity: &str,
        rows: &[Row],
        options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError> {
        self.bulk_action(entity, "UpdateMultiple", rows, options).await
    }

    async fn upsert_multiple(
        &self,
        entity: &str,
        rows: &[Row],
        options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError> {
        self.bulk_action(entity, "UpsertMultiple", rows, options).await
    }

    async fn delete_multiple(
        &self,
        entity: &str,
        ids: &[Uuid],
        options: &CallOptions,
    ) -> Result<BulkResponse, ServiceError> {
        let rows: Vec<Row> = ids.iter().map(|id| Row::new().with_id(*id)).collect();
        self.bulk_action(entity, "DeleteMultiple", &rows, options).await
    }

    async fn retrieve_multiple(
        &self,
        fetch_xml: &str,
        paging: Option<&PagingInfo>,
    ) -> Result<RowPage, ServiceError> {
        let entity = fetch_entity_name(fetch_xml).ok_or_else(|| {
            ServiceError::network("fetch query has no entity element".to_string())
        })?;
        let query = match paging {
            Some(paging) => inject_paging(fetch_xml, paging),
            None => fetch_xml.to_string(),
        };
        let mut url = self.api_url(&entity_set_name(entity))?;
        url.query_pairs_mut().append_pair("fetchXml", &query);
        let req = self.apply_options(self.http.get(url), &CallOptions::default());
        let (_, _, body) = self.send(req).await?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ServiceError::network(format!("malformed query response: {e}")))?;
        let rows = value["value"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| serde_json::from_value::<Row>(row.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(RowPage {
            rows,
            more_records: value["@Microsoft.Dynamics.CRM.morerecords"]
                .as_bool()
                .unwrap_or(false),
            paging_cookie: value["@Microsoft.Dynamics.CRM.fetchxmlpagingcookie"]
                .as_str()
                .map(|c| c.to_string()),
        })
    }

    async fn associate(
        &self,
        relationship: &str,
        entity: &str,
        id: Uuid,
        related_entity: &str,
        related_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        let set = entity_set_name(entity);
        let related_set = entity_set_name(related_entity);
        for related_id in related_ids {
            let url = self.api_url(&format!("{set}({id})/{relationship}/$ref"))?;
            let reference = self.api_url(&format!("{related_set}({related_id})"))?;
            let req = self
                .apply_options(self.http.post(url), &CallOptions::default())
                .json(&json!({ "@odata.id": reference.as_str() }));
            self.send(req).await?;
        }
        Ok(())
    }

    async fn disassociate(
        &self,
        relationship: &str,
        entity: &str,
        id: Uuid,
        _related_entity: &str,
        related_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        let set = entity_set_name(entity);
        for related_id in related_ids {
            let url =
                self.api_url(&format!("{set}({id})/{relationship}({related_id})/$ref"))?;
            let req = self.apply_options(self.http.delete(url), &CallOptions::default());
            self.send(req).await?;
        }
        Ok(())
    }

    fn dop_hint(&self) -> Option<u32> {
        match self.dop_hint.load(Ordering::Relaxed) {
            0 => None,
            hint => Some(hint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_entity_set_name() {
        assert_eq!(entity_set_name("account"), "accounts");
        assert_eq!(entity_set_name("opportunity"), "opportunities");
        assert_eq!(entity_set_name("salesorderdetail"), "salesorderdetails");
        assert_eq!(entity_set_name("queueitembusiness"), "queueitembusinesses");
        assert_eq!(entity_set_name("fax"), "faxes");
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("nope"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_fetch_entity_name() {
        let xml = r#"<fetch top="10"><entity name="account"><attribute name="name"/></entity></fetch>"#;
        assert_eq!(fetch_entity_name(xml), Some("account"));
        assert_eq!(fetch_entity_name("<fetch/>"), None);
    }

    #[test]
    fn test_inject_paging() {
        let xml = r#"<fetch><entity name="account"/></fetch>"#;
        let paging = PagingInfo { page: 2, count: 500, cookie: Some("<cookie page=\"1\"/>".into()) };
        let paged = inject_paging(xml, &paging);
        assert!(paged.starts_with(r#"<fetch page="2" count="500" paging-cookie="#));
        assert!(paged.contains("&lt;cookie"));
    }

    #[test]
    fn test_parse_error_body() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("5"));
        let body = r#"{"error":{"code":"1205","message":"deadlock victim"}}"#;
        let err = parse_error_body(429, &headers, body);
        assert_eq!(err.status, Some(429));
        assert_eq!(err.platform_code, Some(1205));
        assert_eq!(err.retry_after, Some(Duration::from_secs(5)));
        assert!(err.is_throttle());
        assert!(err.is_deadlock());
    }

    #[test]
    fn test_parse_bulk_response_with_failures() {
        let body = r#"{"Ids":["0d4ed8b5-9f62-45a8-b0a3-79c1a5b8e201"],"Errors":[{"Index":1,"Code":-2147220685,"Message":"duplicate"}]}"#;
        let response = RestOrganizationService::parse_bulk_response(body, 2);
        assert_eq!(response.success_count(), 1);
        assert_eq!(response.failure_count(), 1);
        assert!(response.outcomes[0].is_ok());
        let err = response.outcomes[1].as_ref().unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.message, "duplicate");
    }

    #[test]
    fn test_wire_row_includes_primary_key() {
        let id = Uuid::parse_str("0d4ed8b5-9f62-45a8-b0a3-79c1a5b8e201").unwrap();
        let mut row = Row::new().with_id(id);
        row.set("name", serde_json::json!("Contoso"));
        let wire = wire_row("account", &row);
        assert_eq!(wire["accountid"], "0d4ed8b5-9f62-45a8-b0a3-79c1a5b8e201");
        assert_eq!(wire["name"], "Contoso");
    }
}
