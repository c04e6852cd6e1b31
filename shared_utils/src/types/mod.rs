//! Type-Safe Wrappers Module
//!
//! ## Modules
//! - `iteration`: bounded-iteration guard for retry/search loops

pub mod iteration;

pub use iteration::{IterationError, IterationGuard, EMERGENCY_MAX_ITERATIONS};

// ============================================================================
// Property-Based Tests
// ============================================================================
