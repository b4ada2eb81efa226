use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ErrorPattern;

/// Identifies which row and which reference field caused a dangling-reference
/// failure inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDiagnostic {
    pub row_index: usize,
    pub field_name: String,
    pub referenced_entity: String,
    pub referenced_id: String,
}

/// One durable line in `*.errors.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<ErrorPattern>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Vec<ReferenceDiagnostic>>,
}

impl ErrorRecord {
    pub fn new(entity: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorRecord {
            entity: entity.into(),
            record_id: None,
            record_index: None,
            error_code: None,
            message: message.into(),
            pattern: None,
            timestamp: Utc::now(),
            diagnostics: None,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.record_index = Some(index);
        self
    }

    pub fn with_record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn with_error_code(mut self, code: i32) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn with_pattern(mut self, pattern: ErrorPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<ReferenceDiagnostic>) -> Self {
        if !diagnostics.is_empty() {
            self.diagnostics = Some(diagnostics);
        }
        self
    }
}

/// A non-fatal condition worth surfacing in the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningRecord {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
}

impl WarningRecord {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        WarningRecord {
            code: code.into(),
            entity: None,
            message: message.into(),
            impact: None,
        }
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.impact = Some(impact.into());
        self
    }
}
