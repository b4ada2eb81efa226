use std::fmt::Display;

use int_enum::IntEnum;

/// Error codes for the dvt CLI.
///
/// Error codes define the general "semantic type" of a [DvError]. Each error
/// code is a 4-digit number stored as a u16 type.
#[repr(u16)]
#[non_exhaustive]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntEnum)]
pub enum ErrorCode {
    // ----------------- SQL frontend errors [100, 999] -----------------------
    //
    // User-facing error codes originating from the SQL lexer, parser and
    // FetchXML transpiler.
    SqlSyntaxError = 100,
    SqlUnexpectedToken = 101,
    SqlUnexpectedEof = 102,
    SqlInvalidLiteral = 103,
    SqlUnsupported = 104,
    TranspileUnsupported = 120,

    // ----------------- CLI and runtime errors [1000, 8999] ------------------
    /// Default catch-all code for when you're too lazy to specify a proper code
    Generic = 1000,
    IoError = 1001,
    SerializationError = 1002,
    InvalidConfig = 1005,
    InvalidPath = 1006,
    InvalidArgument = 1007,
    MissingArgument = 1008,
    SchemaError = 1010,
    ArchiveError = 1011,

    // Connection initialization
    AuthenticationError = 1100,
    NetworkError = 1101,
    ServiceUnavailable = 1102,
    ConnectionNotReady = 1103,
    RemoteError = 1104,

    // Throttling and pool pressure
    Throttled = 1200,
    ThrottleGaveUp = 1201,
    PoolExhaustion = 1202,
    RequestTimeout = 1203,
    ServerDeadlock = 1204,

    // Row-level business failures and structural downgrades
    BulkNotSupported = 1300,
    DuplicateRecord = 1301,
    PermissionDenied = 1302,
    RequiredFieldMissing = 1303,
    MissingReference = 1304,

    // Planning
    CyclicDependency = 1400,

    OperationCanceled = 8995,
    InvalidOptions = 8996,
    RuntimeError = 8999,

    // ----------------- Internal errors [9000, 9999] --------------------------
    // Everything below this line is an internal error. They will be presented
    // as bugs if surfaced to the user.
    NotSupported = 9000,
    Unknown = 9001,
    Unexpected = 9002,
    NotImplemented = 9003,
}

impl std::hash::Hash for ErrorCode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (*self as u16).hash(state)
    }
}

impl Default for ErrorCode {
    fn default() -> Self {
        Self::Generic
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04}", *self as u16)
    }
}

impl ErrorCode {
    pub fn is_bug(&self) -> bool {
        (*self as u16) >= (Self::NotSupported as u16)
    }

    pub fn is_frontend(&self) -> bool {
        (*self as u16) < (Self::Generic as u16)
    }
}
