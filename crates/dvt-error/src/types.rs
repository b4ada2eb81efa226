use dvt_cancel::{Cancellable, CancelledError};
use std::{
    fmt::{self, Debug, Display, Formatter},
    io,
};

use super::ErrorCode;

pub type DvResult<T, E = Box<DvError>> = Result<T, E>;

/// A position in a SQL source text, tracked by the lexer and carried on
/// parse errors and AST nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    /// 1-based line number.
    pub line: usize,
    /// 1-based column number.
    pub col: usize,
    /// Byte offset into the source text.
    pub offset: usize,
}

impl SourceLocation {
    pub fn new(line: usize, col: usize, offset: usize) -> Self {
        SourceLocation { line, col, offset }
    }

    /// Computes the location of `offset` within `source`.
    pub fn of_offset(source: &str, offset: usize) -> Self {
        let clamped = offset.min(source.len());
        let mut line = 1;
        let mut line_start = 0;
        for (idx, ch) in source.char_indices() {
            if idx >= clamped {
                break;
            }
            if ch == '\n' {
                line += 1;
                line_start = idx + 1;
            }
        }
        let col = source[line_start..clamped].chars().count() + 1;
        SourceLocation {
            line,
            col,
            offset: clamped,
        }
    }

    /// A short source snippet around this location, for error messages.
    pub fn snippet(&self, source: &str) -> String {
        let line = source.lines().nth(self.line - 1).unwrap_or("");
        let max = 60;
        if line.len() <= max {
            line.to_string()
        } else {
            let start = self.col.saturating_sub(1).min(line.len());
            let window_start = start.saturating_sub(max / 2);
            let end = (window_start + max).min(line.len());
            // Stay on char boundaries for multi-byte input
            let ws = (window_start..=start)
                .find(|i| line.is_char_boundary(*i))
                .unwrap_or(0);
            let we = (end..line.len())
                .find(|i| line.is_char_boundary(*i))
                .unwrap_or(line.len());
            format!("...{}...", &line[ws..we])
        }
    }
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.col)
    }
}

/// The error type threaded through every fallible dvt operation.
///
/// Constructed through the [`dv_err!`]/[`err!`] macros; always boxed so that
/// `Result`s stay a single word wide.
pub struct DvError {
    pub code: ErrorCode,
    pub location: Option<SourceLocation>,
    pub context: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Debug for DvError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DvError")
            .field("code", &self.code)
            .field("location", &self.location)
            .field("context", &self.context)
            .field("cause", &self.cause)
            .finish()
    }
}

impl Display for DvError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.context)?;
        if let Some(cause) = &self.cause {
            if !self.context.is_empty() {
                write!(f, ": ")?;
            }
            write!(f, "{cause}")?
        }
        Ok(())
    }
}

impl std::error::Error for DvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl DvError {
    pub fn new(code: ErrorCode, context: impl Into<String>) -> Self {
        DvError {
            code,
            location: None,
            context: context.into(),
            cause: None,
        }
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_cause(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Returns a pretty-printed version of this error, including the error
    /// code and source location as a suffix.
    pub fn pretty(&self) -> String {
        let mut s = format!("dvt{}: {}", self.code, self);
        if let Some(location) = &self.location {
            s.push_str(&format!("\n  --> {location}"));
        }
        s
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == ErrorCode::OperationCanceled
    }
}

impl From<CancelledError> for DvError {
    fn from(_: CancelledError) -> Self {
        DvError::new(ErrorCode::OperationCanceled, "operation cancelled")
    }
}

impl From<CancelledError> for Box<DvError> {
    fn from(e: CancelledError) -> Self {
        Box::new(DvError::from(e))
    }
}

impl From<Cancellable<Box<DvError>>> for Box<DvError> {
    fn from(value: Cancellable<Box<DvError>>) -> Self {
        match value {
            Cancellable::Cancelled => CancelledError.into(),
            Cancellable::Error(e) => e,
        }
    }
}

impl From<io::Error> for Box<DvError> {
    fn from(e: io::Error) -> Self {
        Box::new(DvError::new(ErrorCode::IoError, "i/o error").with_cause(e))
    }
}

impl From<serde_json::Error> for Box<DvError> {
    fn from(e: serde_json::Error) -> Self {
        Box::new(DvError::new(ErrorCode::SerializationError, "serialization error").with_cause(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_of_offset() {
        let src = "SELECT name\nFROM account\nWHERE x = 1";
        assert_eq!(
            SourceLocation::of_offset(src, 0),
            SourceLocation::new(1, 1, 0)
        );
        assert_eq!(
            SourceLocation::of_offset(src, 12),
            SourceLocation::new(2, 1, 12)
        );
        assert_eq!(
            SourceLocation::of_offset(src, 17),
            SourceLocation::new(2, 6, 17)
        );
        // past the end clamps to the last position
        assert_eq!(SourceLocation::of_offset(src, 9999).line, 3);
    }

    #[test]
    fn test_snippet() {
        let src = "SELECT name FROM account";
        let loc = SourceLocation::of_offset(src, 12);
        assert_eq!(loc.snippet(src), "SELECT name FROM account");
    }

    #[test]
    fn test_pretty() {
        let err = DvError::new(ErrorCode::SqlSyntaxError, "unexpected token ')'")
            .with_location(SourceLocation::new(2, 7, 19));
        assert_eq!(
            err.pretty(),
            "dvt0100: unexpected token ')'\n  --> line 2, column 7"
        );
    }

    #[test]
    fn test_cause_display() {
        let io = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let err = DvError::new(ErrorCode::ArchiveError, "failed to open archive").with_cause(io);
        assert_eq!(err.to_string(), "failed to open archive: no such file");
    }
}
