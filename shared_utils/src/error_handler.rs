//! Unified Error Handler Module
//!
//! ## Error categories
//! - Recoverable: logged as a warning, caller continues with a fallback
//!   (CPU stage path, re-selection, retry)
//! - Fatal: propagated, the current run is aborted
//! - Optional: non-critical operation failed, logged and ignored
//!
//! Domain error types expose `category()` so callers route them through
//! [`handle_error`] instead of hand-written match arms.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Recoverable,
    Fatal,
    Optional,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Recoverable => write!(f, "RECOVERABLE"),
            ErrorCategory::Fatal => write!(f, "FATAL"),
            ErrorCategory::Optional => write!(f, "OPTIONAL"),
        }
    }
}

#[derive(Debug)]
pub enum ErrorAction {
    Continue,
    Abort(anyhow::Error),
}

impl ErrorAction {
    pub fn is_continue(&self) -> bool {
        matches!(self, ErrorAction::Continue)
    }
}

/// Log `error` according to `category` and decide whether the caller continues.
pub fn handle_error<E: std::error::Error + Send + Sync + 'static>(
    category: ErrorCategory,
    context: &str,
    error: E,
    suggestion: Option<&str>,
) -> ErrorAction {
    let suggestion_str = suggestion.unwrap_or("No specific action required");

    match category {
        ErrorCategory::Recoverable => {
            tracing::warn!(
                category = %category,
                context = context,
                error = %error,
                suggestion = suggestion_str,
                "Recoverable error, continuing with fallback"
            );
            ErrorAction::Continue
        }
        ErrorCategory::Fatal => {
            tracing::error!(
                category = %category,
                context = context,
                error = %error,
                suggestion = suggestion_str,
                "Fatal error, operation aborted"
            );
            ErrorAction::Abort(anyhow::anyhow!("{}: {}", context, error))
        }
        ErrorCategory::Optional => {
            tracing::info!(
                category = %category,
                context = context,
                error = %error,
                "Non-critical error ignored"
            );
            ErrorAction::Continue
        }
    }
}

/// Log an error with its full `source()` chain.
pub fn report_error<E: std::error::Error + ?Sized>(error: &E) {
    let mut chain = Vec::new();
    let mut source = error.source();
    while let Some(err) = source {
        chain.push(err.to_string());
        source = err.source();
    }
    tracing::error!(error = %error, caused_by = ?chain, "Operation failed");
}
