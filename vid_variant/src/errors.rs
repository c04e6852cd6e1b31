//! Domain errors for selection, execution and gating
//!
//! Every error maps onto an [`ErrorCategory`] so the coordinator decides
//! "fall back / retry / abort" from one place:
//!
//! | error                | category    | handled by                       |
//! |----------------------|-------------|----------------------------------|
//! | `ResourceError`      | Recoverable | executor, CPU fallback           |
//! | `StageError::AcceleratorFault` | Recoverable | executor, CPU fallback |
//! | `SelectionError`     | Recoverable | coordinator, re-select up to cap |
//! | `QualityRejection`   | Recoverable | coordinator, rollback + re-select|
//! | other `StageError`   | Fatal       | run aborted, manifest returned   |

use std::path::PathBuf;

use shared_utils::ErrorCategory;
use thiserror::Error;

use crate::catalog::Category;
use crate::pipeline::PipelineManifest;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("catalog is empty")]
    Empty,

    #[error("transformation at position {position} has an empty id")]
    EmptyId { position: usize },

    #[error("duplicate transformation id '{0}'")]
    DuplicateId(String),

    #[error("transformation '{id}' has invalid weight {weight} (must be finite and > 0)")]
    InvalidWeight { id: String, weight: String },

    #[error("failed to read catalog {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("failed to parse catalog: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("invalid bounds for '{field}': min {min} > max {max}")]
    InvalidBounds {
        field: String,
        min: String,
        max: String,
    },

    #[error("non-finite bound for '{field}'")]
    NonFinite { field: String },

    #[error("option set '{field}' is empty")]
    EmptyOptions { field: String },

    #[error("unknown placeholder '{{{name}}}' in filter template")]
    UnknownPlaceholder { name: String },

    #[error("unterminated placeholder in filter template '{0}'")]
    MalformedTemplate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error(
        "insufficient eligible transformations: {eligible} eligible, {selected} selected, \
         minimum {min}, missing categories {missing:?}"
    )]
    InsufficientEligibleTransformations {
        eligible: usize,
        selected: usize,
        min: usize,
        missing: Vec<Category>,
    },

    #[error("invalid selection constraints: {0}")]
    InvalidConstraints(String),
}

impl SelectionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            // the ledger moves on as other runs commit
            SelectionError::InsufficientEligibleTransformations { .. } => {
                ErrorCategory::Recoverable
            }
            SelectionError::InvalidConstraints(_) => ErrorCategory::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("timed out after {waited_ms}ms waiting for an accelerator slot")]
    Timeout { waited_ms: u64 },

    #[error("accelerator unavailable: {0}")]
    Unavailable(String),
}

impl ResourceError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Recoverable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("stage '{stage}' failed: {message}")]
    ExecutionFailed { stage: String, message: String },

    #[error("stage '{stage}' rejected its input as corrupt: {message}")]
    CorruptInput { stage: String, message: String },

    #[error("accelerator fault in stage '{stage}': {message}")]
    AcceleratorFault { stage: String, message: String },

    #[error("transformation '{0}' is not in the catalog")]
    UnknownTransformation(String),
}

impl StageError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StageError::AcceleratorFault { .. } => ErrorCategory::Recoverable,
            _ => ErrorCategory::Fatal,
        }
    }

    pub fn is_accelerator_fault(&self) -> bool {
        matches!(self, StageError::AcceleratorFault { .. })
    }
}

/// Reason a rendered artifact was refused. Names the failing check.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("quality check '{predicate}' failed: {reason}")]
pub struct QualityRejection {
    pub predicate: String,
    pub reason: String,
}

impl QualityRejection {
    pub fn new(predicate: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Recoverable
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(
        "ledger moved from version {seen_version} to {current_version}; \
         now in cooldown: {ids:?}"
    )]
    Conflict {
        ids: Vec<String>,
        seen_version: u64,
        current_version: u64,
    },
}

impl LedgerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::Conflict { .. } => ErrorCategory::Recoverable,
            _ => ErrorCategory::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Params(#[from] ParamError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why a stage run stopped early
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("run cancelled")]
    Cancelled,
}

/// Terminal outcome of a run that produced no committed variant
#[derive(Debug, Error)]
pub enum RunError {
    #[error("selection failed: {0}")]
    Selection(#[source] SelectionError),

    #[error("stage failed: {error}")]
    Stage {
        #[source]
        error: StageError,
        manifest: Box<PipelineManifest>,
    },

    #[error("run cancelled")]
    Cancelled { manifest: Option<Box<PipelineManifest>> },

    #[error("quality gate rejected all {attempts} attempts, last: {last}")]
    QualityExhausted { attempts: u32, last: QualityRejection },

    #[error("ledger conflicts on all {attempts} attempts, last: {ids:?}")]
    ConflictExhausted { attempts: u32, ids: Vec<String> },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    /// Manifest of the attempt that ended the run, if execution started.
    pub fn manifest(&self) -> Option<&PipelineManifest> {
        match self {
            RunError::Stage { manifest, .. } => Some(&**manifest),
            RunError::Cancelled { manifest } => manifest.as_deref(),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RunError::Cancelled { .. } => ErrorCategory::Optional,
            _ => ErrorCategory::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            ResourceError::Timeout { waited_ms: 100 }.category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            StageError::AcceleratorFault {
                stage: "color".into(),
                message: "CUDA_ERROR".into()
            }
            .category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            StageError::CorruptInput {
                stage: "audio".into(),
                message: "moov atom not found".into()
            }
            .category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            SelectionError::InvalidConstraints("min > max".into()).category(),
            ErrorCategory::Fatal
        );
    }

    #[test]
    fn test_rejection_names_predicate() {
        let r = QualityRejection::new("duration_within_tolerance", "output duration is zero");
        assert_eq!(
            r.to_string(),
            "quality check 'duration_within_tolerance' failed: output duration is zero"
        );
    }

    #[test]
    fn test_unknown_placeholder_message() {
        let e = ParamError::UnknownPlaceholder { name: "gain".into() };
        assert_eq!(e.to_string(), "unknown placeholder '{gain}' in filter template");
    }
}
