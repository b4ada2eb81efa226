#[macro_use]
pub mod macros;

mod codes;
mod patterns;
mod record;
mod types;

// Re-export all public types and utilities
pub use codes::ErrorCode;
pub use patterns::{ErrorPattern, classify_message, extract_missing_reference};
pub use record::{ErrorRecord, ReferenceDiagnostic, WarningRecord};
pub use types::{DvError, DvResult, SourceLocation};
