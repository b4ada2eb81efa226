use std::path::Path;
use std::sync::Arc;

use dvt_api::StaticTokenProvider;
use dvt_error::{DvResult, ErrorCode, err};
use dvt_pool::{ConnectionPool, ConnectionSource, CredentialIdentity, PoolConfig};
use serde::Deserialize;

/// Test-only credential override: bypasses secure credential storage so CI
/// and local smoke tests can run without an interactive flow.
pub const ACCESS_TOKEN_ENV: &str = "DVT_ACCESS_TOKEN";

/// One credential identity in the connections file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEntry {
    pub name: String,
    /// Defaults to the command's environment url.
    #[serde(default)]
    pub url: Option<String>,
    /// Defaults to the `DVT_ACCESS_TOKEN` override.
    #[serde(default)]
    pub access_token: Option<String>,
}

fn read_entries(path: &Path) -> DvResult<Vec<ConnectionEntry>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        dvt_error::dv_err!(
            ErrorCode::InvalidPath,
            "cannot read connections file {}: {e}",
            path.display()
        )
    })?;
    let entries: Vec<ConnectionEntry> = serde_json::from_str(&raw).map_err(|e| {
        dvt_error::dv_err!(
            ErrorCode::InvalidConfig,
            "malformed connections file {}: {e}",
            path.display()
        )
    })?;
    if entries.is_empty() {
        return err!(
            ErrorCode::InvalidConfig,
            "connections file {} lists no connections",
            path.display()
        );
    }
    Ok(entries)
}

/// Builds the pool for `environment_url` from the connections file, or from
/// the token override when no file is given.
pub fn build_pool(
    connections: Option<&Path>,
    environment_url: &str,
    config: PoolConfig,
) -> DvResult<ConnectionPool> {
    let env_token = std::env::var(ACCESS_TOKEN_ENV).ok();
    let sources: Vec<ConnectionSource> = match connections {
        Some(path) => read_entries(path)?
            .into_iter()
            .map(|entry| {
                let url = entry.url.unwrap_or_else(|| environment_url.to_string());
                let token = entry
                    .access_token
                    .or_else(|| env_token.clone())
                    .unwrap_or_default();
                let provider = Arc::new(StaticTokenProvider::new(url.clone(), token));
                ConnectionSource::new(CredentialIdentity::new(entry.name, url), provider)
            })
            .collect(),
        None => {
            let Some(token) = env_token else {
                return err!(
                    ErrorCode::InvalidConfig,
                    "no connections file given and {ACCESS_TOKEN_ENV} is not set"
                );
            };
            vec![ConnectionSource::new(
                CredentialIdentity::new("default", environment_url),
                Arc::new(StaticTokenProvider::new(environment_url, token)),
            )]
        }
    };
    ConnectionPool::new(sources, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connections_file_builds_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        std::fs::write(
            &path,
            r#"[
                {"name": "conn-a", "accessToken": "token-a"},
                {"name": "conn-b", "accessToken": "token-b", "url": "https://other.crm.dynamics.com"}
            ]"#,
        )
        .unwrap();

        let pool = build_pool(
            Some(&path),
            "https://target.crm.dynamics.com",
            PoolConfig::default(),
        )
        .unwrap();
        let statuses = pool.source_statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].0, "conn-a");
        assert_eq!(statuses[1].0, "conn-b");
    }

    #[test]
    fn test_empty_connections_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        std::fs::write(&path, "[]").unwrap();
        let err = build_pool(Some(&path), "https://t", PoolConfig::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_malformed_connections_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        std::fs::write(&path, "{oops").unwrap();
        let err = build_pool(Some(&path), "https://t", PoolConfig::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }
}
