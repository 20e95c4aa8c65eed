//! Error taxonomy for change processing.
//!
//! Every submitted change receives exactly one categorized outcome.
//! Validation and rule violations are terminal rejections; version
//! mismatches and missing entities are recoverable conflicts.

use thiserror::Error;

/// Wire code for a malformed or out-of-range request, rejected before
/// any state is touched.
pub const CODE_VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Wire code for a business invariant that would be broken.
pub const CODE_RULE_VIOLATION: &str = "RULE_VIOLATION";
/// Wire code for an optimistic concurrency failure.
pub const CODE_VERSION_MISMATCH: &str = "VERSION_MISMATCH";
/// Wire code for a target that does not exist (possibly a deletion race).
pub const CODE_MISSING_ENTITY: &str = "MISSING_ENTITY";
/// Wire code for an idempotent replay of an already-applied change.
pub const CODE_DUPLICATE: &str = "DUPLICATE";

/// Errors that categorize why a change could not be applied as submitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Malformed input, rejected before any state mutation.
    #[error("{0}")]
    Validation(String),

    /// A business invariant would be broken (e.g. negative remaining portions).
    #[error("{0}")]
    RuleViolation(String),

    /// The submitted base version no longer matches the current version.
    #[error("expected version {expected}, current version is {current}")]
    VersionMismatch { expected: i64, current: i64 },

    /// The target entity does not exist.
    #[error("{entity_type}/{id} does not exist")]
    MissingEntity { entity_type: String, id: String },
}

impl SyncError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation(message.into())
    }

    /// Create a rule violation.
    pub fn rule_violation(message: impl Into<String>) -> Self {
        SyncError::RuleViolation(message.into())
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => CODE_VALIDATION_ERROR,
            SyncError::RuleViolation(_) => CODE_RULE_VIOLATION,
            SyncError::VersionMismatch { .. } => CODE_VERSION_MISMATCH,
            SyncError::MissingEntity { .. } => CODE_MISSING_ENTITY,
        }
    }

    /// True for errors that are terminal for the change (reported in
    /// `rejected[]` rather than `conflicts[]`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Validation(_) | SyncError::RuleViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(
            SyncError::validation("bad").code(),
            CODE_VALIDATION_ERROR
        );
        assert_eq!(
            SyncError::rule_violation("no").code(),
            CODE_RULE_VIOLATION
        );
        assert_eq!(
            SyncError::VersionMismatch {
                expected: 1,
                current: 2
            }
            .code(),
            CODE_VERSION_MISMATCH
        );
        assert_eq!(
            SyncError::MissingEntity {
                entity_type: "preferences".into(),
                id: "x".into()
            }
            .code(),
            CODE_MISSING_ENTITY
        );
    }

    #[test]
    fn test_terminal_classification() {
        assert!(SyncError::validation("bad").is_terminal());
        assert!(SyncError::rule_violation("no").is_terminal());
        assert!(!SyncError::VersionMismatch {
            expected: 1,
            current: 2
        }
        .is_terminal());
        assert!(!SyncError::MissingEntity {
            entity_type: "mealSlot".into(),
            id: "x".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = SyncError::VersionMismatch {
            expected: 3,
            current: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('7'));
    }
}
