use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::ErrorCode;

/// Closed set of row-level failure patterns used for triage.
///
/// The summary file prints a histogram over these so that a run with 40,000
/// identical "user does not exist" failures reads as one line, not 40,000.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum ErrorPattern {
    MissingUser,
    MissingTeam,
    MissingReference,
    MissingParent,
    DuplicateRecord,
    PermissionDenied,
    RequiredField,
    BulkNotSupported,
    PoolExhaustion,
    Uncategorized,
}

/// `<entity> With Id(s) = <guid> ... Not Exist` is the platform's canonical
/// shape for dangling references in both singular and plural spellings.
static RE_DOES_NOT_EXIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z_][a-z0-9_]*)\s+with\s+ids?\s*=\s*([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})[^.]*not\s+exist")
        .expect("valid regex")
});

/// `attribute 'name'` / `attribute name` spellings in validation messages.
static RE_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\battribute:?\s+'?([a-z_][a-z0-9_]*)'?").expect("valid regex")
});

/// A dangling reference extracted from a server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingReferenceInfo {
    /// Logical name of the entity type the message blames.
    pub referenced_entity: String,
    /// The id that did not resolve, when the message carries one.
    pub referenced_id: Option<String>,
    /// Field name, when the message names the attribute.
    pub field_name: Option<String>,
}

/// Extracts the referenced entity/id/field from a "does not exist" message.
///
/// The field-name spelling varies across server versions; callers that know
/// the row payload should fall back to scanning attribute values for
/// `referenced_id` when `field_name` is `None`.
pub fn extract_missing_reference(message: &str) -> Option<MissingReferenceInfo> {
    let caps = RE_DOES_NOT_EXIST.captures(message)?;
    let field_name = RE_ATTRIBUTE
        .captures(message)
        .map(|c| c[1].to_ascii_lowercase());
    Some(MissingReferenceInfo {
        referenced_entity: caps[1].to_ascii_lowercase(),
        referenced_id: Some(caps[2].to_ascii_lowercase()),
        field_name,
    })
}

/// Classifies a server error message (plus an optional platform error code)
/// into the closed [ErrorPattern] set.
pub fn classify_message(code: Option<i32>, message: &str) -> ErrorPattern {
    let lower = message.to_ascii_lowercase();

    if lower.contains("not enabled on the entity") || lower.contains("multiple is not supported") {
        return ErrorPattern::BulkNotSupported;
    }
    if let Some(info) = extract_missing_reference(message) {
        return match info.referenced_entity.as_str() {
            "systemuser" => ErrorPattern::MissingUser,
            "team" => ErrorPattern::MissingTeam,
            _ if info
                .field_name
                .as_deref()
                .is_some_and(|f| f.starts_with("parent")) =>
            {
                ErrorPattern::MissingParent
            }
            _ => ErrorPattern::MissingReference,
        };
    }
    if lower.contains("does not exist") || lower.contains("do not exist") {
        // Dangling reference with no extractable entity name
        return ErrorPattern::MissingReference;
    }
    if lower.contains("duplicate") || code == Some(-2147220685) {
        return ErrorPattern::DuplicateRecord;
    }
    if lower.contains("privilege") || lower.contains("permission") || lower.contains("access is denied")
    {
        return ErrorPattern::PermissionDenied;
    }
    if lower.contains("required field") || lower.contains("cannot be null") || lower.contains("is required")
    {
        return ErrorPattern::RequiredField;
    }
    ErrorPattern::Uncategorized
}

impl ErrorPattern {
    /// The error code a pattern is reported under when it needs one.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ErrorPattern::MissingUser
            | ErrorPattern::MissingTeam
            | ErrorPattern::MissingReference
            | ErrorPattern::MissingParent => ErrorCode::MissingReference,
            ErrorPattern::DuplicateRecord => ErrorCode::DuplicateRecord,
            ErrorPattern::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorPattern::RequiredField => ErrorCode::RequiredFieldMissing,
            ErrorPattern::BulkNotSupported => ErrorCode::BulkNotSupported,
            ErrorPattern::PoolExhaustion => ErrorCode::PoolExhaustion,
            ErrorPattern::Uncategorized => ErrorCode::Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISSING_USER: &str =
        "systemuser With Ids = 5f5bf8e9-2c29-44bc-a091-39b9cdbcc44b Do Not Exist";
    const MISSING_ACCOUNT: &str =
        "account With Id = 0d4ed8b5-9f62-45a8-b0a3-79c1a5b8e201 Does Not Exist";

    #[test]
    fn test_extract_missing_reference() {
        let info = extract_missing_reference(MISSING_USER).unwrap();
        assert_eq!(info.referenced_entity, "systemuser");
        assert_eq!(
            info.referenced_id.as_deref(),
            Some("5f5bf8e9-2c29-44bc-a091-39b9cdbcc44b")
        );
        assert_eq!(info.field_name, None);

        assert_eq!(extract_missing_reference("Generic SQL error."), None);
    }

    #[test]
    fn test_extract_with_attribute() {
        let msg = "contact With Id = 0d4ed8b5-9f62-45a8-b0a3-79c1a5b8e201 Does Not Exist. \
                   Check attribute 'parentcontactid'.";
        let info = extract_missing_reference(msg).unwrap();
        assert_eq!(info.field_name.as_deref(), Some("parentcontactid"));
    }

    #[test]
    fn test_classify_missing_variants() {
        assert_eq!(classify_message(None, MISSING_USER), ErrorPattern::MissingUser);
        assert_eq!(
            classify_message(None, MISSING_ACCOUNT),
            ErrorPattern::MissingReference
        );
        let team = "team With Ids = 5f5bf8e9-2c29-44bc-a091-39b9cdbcc44b Do Not Exist";
        assert_eq!(classify_message(None, team), ErrorPattern::MissingTeam);
        let parent = "contact With Id = 0d4ed8b5-9f62-45a8-b0a3-79c1a5b8e201 Does Not Exist. \
                      Check attribute 'parentcustomerid'.";
        assert_eq!(classify_message(None, parent), ErrorPattern::MissingParent);
    }

    #[test]
    fn test_classify_business_variants() {
        assert_eq!(
            classify_message(None, "A record was not created or updated because a duplicate of the current record already exists."),
            ErrorPattern::DuplicateRecord
        );
        assert_eq!(
            classify_message(None, "The user does not hold the prvCreateAccount privilege."),
            ErrorPattern::PermissionDenied
        );
        assert_eq!(
            classify_message(None, "Attribute name: value is required but cannot be null"),
            ErrorPattern::RequiredField
        );
        assert_eq!(
            classify_message(None, "CreateMultiple is not enabled on the entity customtable"),
            ErrorPattern::BulkNotSupported
        );
        assert_eq!(
            classify_message(None, "Generic SQL error."),
            ErrorPattern::Uncategorized
        );
    }

    #[test]
    fn test_pattern_names_are_stable() {
        // These names appear verbatim in summary histograms.
        assert_eq!(ErrorPattern::MissingUser.to_string(), "MissingUser");
        assert_eq!(ErrorPattern::BulkNotSupported.to_string(), "BulkNotSupported");
        assert_eq!(ErrorPattern::Uncategorized.to_string(), "Uncategorized");
    }
}
