use std::sync::{Arc, Mutex};

use dvt_api::{AuthenticationProvider, InitFailure, OrganizationService};
use dvt_cancel::CancellationToken;
use tracing::{debug, warn};

/// A credential identity within the pool: a stable name plus the environment
/// it authenticates against. Immutable once constructed; the opaque bearer
/// credentials stay inside the [AuthenticationProvider].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialIdentity {
    pub name: String,
    pub environment_url: String,
}

impl CredentialIdentity {
    pub fn new(name: impl Into<String>, environment_url: impl Into<String>) -> Self {
        CredentialIdentity {
            name: name.into(),
            environment_url: environment_url.into(),
        }
    }
}

/// Externally visible lifecycle state of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Uninitialized,
    Ready,
    Failed(InitFailure),
}

enum InitState {
    Uninitialized,
    Ready(Arc<dyn OrganizationService>),
    Failed(InitFailure),
}

/// One authenticated client identity.
///
/// `ensure_ready` is idempotent: concurrent callers rendezvous on an async
/// mutex and at most one authentication attempt is in flight. A failure is
/// cached for inspection; later calls re-attempt only after an explicit
/// [invalidate](ConnectionSource::invalidate).
pub struct ConnectionSource {
    identity: CredentialIdentity,
    provider: Arc<dyn AuthenticationProvider>,
    /// Serializes initialization attempts; never held across service calls.
    init: tokio::sync::Mutex<()>,
    state: Mutex<InitState>,
}

impl std::fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSource").field("identity", &self.identity).finish_non_exhaustive()
    }
}

impl ConnectionSource {
    pub fn new(identity: CredentialIdentity, provider: Arc<dyn AuthenticationProvider>) -> Self {
        ConnectionSource {
            identity,
            provider,
            init: tokio::sync::Mutex::new(()),
            state: Mutex::new(InitState::Uninitialized),
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn identity(&self) -> &CredentialIdentity {
        &self.identity
    }

    pub fn status(&self) -> SourceStatus {
        match &*self.state.lock().unwrap() {
            InitState::Uninitialized => SourceStatus::Uninitialized,
            InitState::Ready(_) => SourceStatus::Ready,
            InitState::Failed(failure) => SourceStatus::Failed(failure.clone()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), InitState::Ready(_))
    }

    /// The authenticated client, when the source is ready.
    pub fn client(&self) -> Option<Arc<dyn OrganizationService>> {
        match &*self.state.lock().unwrap() {
            InitState::Ready(client) => Some(client.clone()),
            _ => None,
        }
    }

    /// Drives the source to `Ready`, or returns the classified failure.
    pub async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<(), InitFailure> {
        // Fast path without touching the init mutex
        match &*self.state.lock().unwrap() {
            InitState::Ready(_) => return Ok(()),
            InitState::Failed(failure) => return Err(failure.clone()),
            InitState::Uninitialized => {}
        }

        let _guard = self.init.lock().await;
        // Someone may have finished while we waited for the rendezvous
        match &*self.state.lock().unwrap() {
            InitState::Ready(_) => return Ok(()),
            InitState::Failed(failure) => return Err(failure.clone()),
            InitState::Uninitialized => {}
        }

        if cancel.is_cancelled() {
            return Err(InitFailure::Unknown("initialization cancelled".to_string()));
        }

        debug!(source = %self.identity.name, "authenticating connection source");
        match self.provider.authenticate(cancel).await {
            Ok(client) => {
                *self.state.lock().unwrap() = InitState::Ready(client);
                Ok(())
            }
            Err(failure) => {
                warn!(
                    source = %self.identity.name,
                    classification = failure.classification(),
                    "connection source failed to initialize"
                );
                *self.state.lock().unwrap() = InitState::Failed(failure.clone());
                Err(failure)
            }
        }
    }

    /// Clears a cached failure (or a ready client) so the next `ensure_ready`
    /// re-attempts authentication.
    pub fn invalidate(&self) {
        *self.state.lock().unwrap() = InitState::Uninitialized;
    }

    /// True if this source failed in a way a background health check may
    /// re-attempt. Auth rejections are terminal.
    pub fn is_recoverable_failure(&self) -> bool {
        matches!(
            &*self.state.lock().unwrap(),
            InitState::Failed(failure) if failure.is_recoverable()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvt_cancel::never_cancels;
    use dvt_test_utils::{MockAuthProvider, MockService};

    fn identity() -> CredentialIdentity {
        CredentialIdentity::new("conn-a", "https://src.crm.dynamics.com")
    }

    #[tokio::test]
    async fn test_ensure_ready_transitions_to_ready() {
        let provider = MockAuthProvider::ready(MockService::new());
        let source = ConnectionSource::new(identity(), provider.clone());

        assert_eq!(source.status(), SourceStatus::Uninitialized);
        assert!(source.client().is_none());

        source.ensure_ready(&never_cancels()).await.unwrap();
        assert_eq!(source.status(), SourceStatus::Ready);
        assert!(source.client().is_some());

        // idempotent: a second call does not re-authenticate
        source.ensure_ready(&never_cancels()).await.unwrap();
        assert_eq!(provider.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_cached_until_invalidated() {
        let service = MockService::new();
        let provider = MockAuthProvider::failing_then_ready(
            service,
            vec![InitFailure::Network("dns failure".to_string())],
        );
        let source = ConnectionSource::new(identity(), provider.clone());

        let failure = source.ensure_ready(&never_cancels()).await.unwrap_err();
        assert!(matches!(failure, InitFailure::Network(_)));
        assert!(source.is_recoverable_failure());

        // cached: no second attempt happens on its own
        let _ = source.ensure_ready(&never_cancels()).await.unwrap_err();
        assert_eq!(provider.attempts(), 1);

        source.invalidate();
        source.ensure_ready(&never_cancels()).await.unwrap();
        assert_eq!(provider.attempts(), 2);
        assert!(source.is_ready());
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_recoverable() {
        let provider = MockAuthProvider::failing(InitFailure::Auth("rejected".to_string()));
        let source = ConnectionSource::new(identity(), provider);
        let _ = source.ensure_ready(&never_cancels()).await.unwrap_err();
        assert!(!source.is_recoverable_failure());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_ready_authenticates_once() {
        let provider = MockAuthProvider::ready(MockService::new());
        let source = Arc::new(ConnectionSource::new(identity(), provider.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let source = source.clone();
                tokio::spawn(async move { source.ensure_ready(&never_cancels()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(provider.attempts(), 1);
    }
}
