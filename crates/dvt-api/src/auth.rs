use std::sync::Arc;

use async_trait::async_trait;
use dvt_cancel::CancellationToken;

use crate::rest::RestOrganizationService;
use crate::{InitFailure, OrganizationService};

/// Produces a ready client for one credential identity, or a classified
/// failure. The core never sees credentials; it only sees this trait.
#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    async fn authenticate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn OrganizationService>, InitFailure>;
}

/// Provider that wraps a pre-acquired bearer token.
///
/// Used by the CLI's connections file and by the test-only token override;
/// interactive token acquisition lives outside the core.
pub struct StaticTokenProvider {
    environment_url: String,
    access_token: String,
}

impl StaticTokenProvider {
    pub fn new(environment_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        StaticTokenProvider {
            environment_url: environment_url.into(),
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl AuthenticationProvider for StaticTokenProvider {
    async fn authenticate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn OrganizationService>, InitFailure> {
        if cancel.is_cancelled() {
            return Err(InitFailure::Unknown("cancelled".to_string()));
        }
        if self.access_token.is_empty() {
            return Err(InitFailure::Auth("empty access token".to_string()));
        }
        let service = RestOrganizationService::new(&self.environment_url, &self.access_token)
            .map_err(|e| InitFailure::ConnectionNotReady(e.to_string()))?;
        Ok(Arc::new(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvt_cancel::never_cancels;

    #[tokio::test]
    async fn test_empty_token_is_auth_failure() {
        let provider = StaticTokenProvider::new("https://org.crm.dynamics.com", "");
        let err = provider.authenticate(&never_cancels()).await.unwrap_err();
        assert!(matches!(err, InitFailure::Auth(_)));
    }

    #[tokio::test]
    async fn test_token_provider_builds_client() {
        let provider = StaticTokenProvider::new("https://org.crm.dynamics.com", "token");
        assert!(provider.authenticate(&never_cancels()).await.is_ok());
    }
}
