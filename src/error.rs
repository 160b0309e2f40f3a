//! Diagnostic error types for colony-core.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! so callers get an error code and help text alongside the message. Rule
//! rejections carry the full evaluation result for inspection.

use miette::Diagnostic;
use thiserror::Error;

use crate::entity::EntityType;
use crate::rules::EvaluationResult;

/// Top-level error type for colony-core.
#[derive(Debug, Error, Diagnostic)]
pub enum ColonyError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("{entity} {id:?} not found")]
    #[diagnostic(
        code(colony::store::not_found),
        help("The referenced record does not exist in the current transaction scope. Verify the id.")
    )]
    NotFound { entity: EntityType, id: String },

    #[error("{entity} {id:?} already exists")]
    #[diagnostic(
        code(colony::store::already_exists),
        help("Identifiers are never reused. Leave the id empty to have one assigned.")
    )]
    AlreadyExists { entity: EntityType, id: String },

    #[error("{entity} {id:?} is still referenced by {by_entity} {by_id:?}")]
    #[diagnostic(
        code(colony::store::referenced),
        help("Delete or re-point the referencing record first.")
    )]
    Referenced {
        entity: EntityType,
        id: String,
        by_entity: EntityType,
        by_id: String,
    },

    #[error("invalid {entity}: {message}")]
    #[diagnostic(code(colony::store::invalid))]
    Invalid { entity: EntityType, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Blocked(#[from] RuleViolationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Rule(#[from] RuleError),

    #[error("transaction cancelled")]
    #[diagnostic(
        code(colony::store::cancelled),
        help("The context was cancelled before commit. No state was changed.")
    )]
    Cancelled,

    #[error("transaction aborted: {message}")]
    #[diagnostic(code(colony::store::aborted))]
    Aborted { message: String },

    #[error("I/O error: {source}")]
    #[diagnostic(
        code(colony::store::io),
        help(
            "A filesystem operation failed. Check that the storage directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(colony::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             This may indicate corruption; try opening a copy of the database file."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(colony::store::serde),
        help("Failed to encode or decode a stored record. The on-disk format may be from an incompatible version.")
    )]
    Serialization { message: String },

    #[error("memory map error: {message}")]
    #[diagnostic(
        code(colony::store::mmap),
        help("Failed to map the snapshot file. Check file permissions and available address space.")
    )]
    Mmap { message: String },
}

impl StoreError {
    /// Shorthand for a not-found error.
    pub fn not_found(entity: EntityType, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for a caller-defined abort.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// The evaluation result attached to a rule rejection, if this is one.
    pub fn violations(&self) -> Option<&EvaluationResult> {
        match self {
            Self::Blocked(err) => Some(&err.result),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Rule errors
// ---------------------------------------------------------------------------

/// Raised instead of committing when evaluation produced blocking violations.
///
/// The wrapped result holds every violation from every rule, blocking or not.
#[derive(Debug, Error, Diagnostic)]
#[error("transaction blocked by rules: {}", summarize(.result))]
#[diagnostic(
    code(colony::rules::blocked),
    help("Inspect `result.violations` for the blocking entries and retry with corrected input.")
)]
pub struct RuleViolationError {
    pub result: EvaluationResult,
}

impl RuleViolationError {
    pub fn new(result: EvaluationResult) -> Self {
        Self { result }
    }

    /// Consume the error and return the wrapped evaluation result.
    pub fn into_result(self) -> EvaluationResult {
        self.result
    }
}

fn summarize(result: &EvaluationResult) -> String {
    let names: Vec<&str> = result.blocking().map(|v| v.rule.as_str()).collect();
    if names.is_empty() {
        return "no blocking violations".into();
    }
    format!("{} blocking violation(s) from {}", names.len(), names.join(", "))
}

/// A rule failed internally (malformed stored data, unexpected shape).
///
/// Distinct from a violation: this aborts evaluation of every rule.
#[derive(Debug, Error, Diagnostic)]
#[error("rule {rule} failed: {message}")]
#[diagnostic(
    code(colony::rules::internal),
    help("This is a rule bug or corrupt data, not a policy rejection. No rules after it were run.")
)]
pub struct RuleError {
    pub rule: String,
    pub message: String,
}

impl RuleError {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read store config: {path}")]
    #[diagnostic(
        code(colony::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write store config: {path}")]
    #[diagnostic(
        code(colony::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse store config: {message}")]
    #[diagnostic(
        code(colony::config::parse),
        help("Check the TOML syntax and field names in the store config.")
    )]
    Parse { message: String },

    #[error("unknown storage driver: {driver}")]
    #[diagnostic(
        code(colony::config::driver),
        help("Valid drivers are: memory, snapshot, durable.")
    )]
    UnknownDriver { driver: String },

    #[error("unknown rule set: {name}")]
    #[diagnostic(
        code(colony::config::rule_set),
        help("Valid rule sets are: default, bare, extended.")
    )]
    UnknownRuleSet { name: String },

    #[error("driver {driver} requires a storage path")]
    #[diagnostic(
        code(colony::config::path),
        help("Set `path` in the config file or COLONY_STORAGE_PATH in the environment.")
    )]
    MissingPath { driver: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Convenience alias for functions returning colony-core results.
pub type ColonyResult<T> = std::result::Result<T, ColonyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Severity, Violation};

    #[test]
    fn store_error_converts_to_colony_error() {
        let err = StoreError::not_found(EntityType::Organism, "o-1");
        let colony: ColonyError = err.into();
        assert!(matches!(colony, ColonyError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn violations_are_extractable_from_blocked() {
        let mut result = EvaluationResult::default();
        result.push(Violation::new("housing_capacity", Severity::Block, "full"));
        let err: StoreError = RuleViolationError::new(result).into();

        let extracted = err.violations().expect("blocked error carries result");
        assert_eq!(extracted.len(), 1);
        assert!(extracted.has_blocking());

        match err {
            StoreError::Blocked(blocked) => {
                assert_eq!(blocked.into_result().violations[0].rule, "housing_capacity");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = StoreError::not_found(EntityType::HousingUnit, "h-9");
        let msg = format!("{err}");
        assert!(msg.contains("housing_unit"));
        assert!(msg.contains("h-9"));

        let mut result = EvaluationResult::default();
        result.push(Violation::new("lineage_integrity", Severity::Block, "bad parent"));
        result.push(Violation::new("audit", Severity::Warn, "note"));
        let msg = RuleViolationError::new(result).to_string();
        assert!(msg.contains("1 blocking violation(s) from lineage_integrity"));
    }

    #[test]
    fn other_errors_have_no_violations() {
        assert!(StoreError::Cancelled.violations().is_none());
        assert!(StoreError::Cancelled.is_cancelled());
        assert!(StoreError::not_found(EntityType::Protocol, "p").is_not_found());
    }
}
