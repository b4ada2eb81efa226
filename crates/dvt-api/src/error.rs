use std::fmt;
use std::time::Duration;

/// Platform error code raised by a table-valued-parameter race.
pub const CODE_TVP_RACE: i32 = 1205;
/// Platform error code raised by a SQL deadlock victim.
pub const CODE_SQL_DEADLOCK: i32 = 3732;

const BULK_REFUSAL_MARKERS: [&str; 2] = ["not enabled on the entity", "multiple is not supported"];

/// Transport-level shape of a failed service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The server answered with a non-success HTTP status.
    Status,
    /// DNS/TCP/TLS failure or a broken connection mid-response.
    Network,
    /// The request timed out client-side.
    Timeout,
}

/// An error returned by the organization service.
///
/// Carries everything the retry policy and the error classifier need: the
/// HTTP status, the platform fault code, the raw fault message and the
/// server-advised `Retry-After`.
#[derive(Debug, Clone)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub status: Option<u16>,
    pub platform_code: Option<i32>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.platform_code) {
            (Some(status), Some(code)) => {
                write!(f, "HTTP {status} (code {code}): {}", self.message)
            }
            (Some(status), None) => write!(f, "HTTP {status}: {}", self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ServiceError {}

impl ServiceError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        ServiceError {
            kind: ServiceErrorKind::Status,
            status: Some(status),
            platform_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        ServiceError {
            kind: ServiceErrorKind::Network,
            status: None,
            platform_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        ServiceError {
            kind: ServiceErrorKind::Timeout,
            status: None,
            platform_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_platform_code(mut self, code: i32) -> Self {
        self.platform_code = Some(code);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// True for 429/503 responses, the platform's throttle signals.
    pub fn is_throttle(&self) -> bool {
        matches!(self.status, Some(429) | Some(503))
    }

    /// True for transport failures worth a retry on a fresh connection.
    pub fn is_transient_network(&self) -> bool {
        matches!(self.kind, ServiceErrorKind::Network | ServiceErrorKind::Timeout)
    }

    /// True for the server-side race conditions (TVP race, deadlock victim)
    /// that resolve on a simple replay.
    pub fn is_deadlock(&self) -> bool {
        matches!(self.platform_code, Some(CODE_TVP_RACE) | Some(CODE_SQL_DEADLOCK))
            || self.message.to_ascii_lowercase().contains("deadlock")
    }

    /// True when the server refuses the bulk form of an operation for this
    /// entity. The executor downgrades these to per-row execution.
    pub fn is_bulk_refusal(&self) -> bool {
        let lower = self.message.to_ascii_lowercase();
        BULK_REFUSAL_MARKERS.iter().any(|m| lower.contains(m))
    }
}

/// Classified failure of a connection source's initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitFailure {
    /// Credentials rejected. Never retried by background health checks.
    Auth(String),
    /// DNS/TCP/TLS failure on the way to the token or service endpoint.
    Network(String),
    /// HTTP 5xx at authentication time.
    Service(String),
    /// Handshake succeeded but the client refuses requests.
    ConnectionNotReady(String),
    Unknown(String),
}

impl fmt::Display for InitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitFailure::Auth(m) => write!(f, "authentication rejected: {m}"),
            InitFailure::Network(m) => write!(f, "network failure: {m}"),
            InitFailure::Service(m) => write!(f, "service failure: {m}"),
            InitFailure::ConnectionNotReady(m) => write!(f, "connection not ready: {m}"),
            InitFailure::Unknown(m) => write!(f, "unknown failure: {m}"),
        }
    }
}

impl std::error::Error for InitFailure {}

impl InitFailure {
    /// Auth failures are terminal; the rest may heal and are eligible for
    /// background re-initialization.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, InitFailure::Auth(_))
    }

    pub fn classification(&self) -> &'static str {
        match self {
            InitFailure::Auth(_) => "Auth",
            InitFailure::Network(_) => "Network",
            InitFailure::Service(_) => "Service",
            InitFailure::ConnectionNotReady(_) => "ConnectionNotReady",
            InitFailure::Unknown(_) => "Unknown",
        }
    }
}
