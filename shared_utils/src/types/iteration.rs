//! IterationGuard - bounded iteration budget
//!
//! Every retry loop in the engine (selector redraws, attempt loops) runs
//! under a guard so termination does not depend on the randomness.

use std::fmt;

/// Absolute cap regardless of the requested budget.
pub const EMERGENCY_MAX_ITERATIONS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct IterationError {
    pub current: u32,
    pub max: u32,
    pub context: String,
}

impl fmt::Display for IterationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Iteration limit exceeded: {}/{} in {}",
            self.current, self.max, self.context
        )
    }
}

impl std::error::Error for IterationError {}

#[derive(Debug, Clone)]
pub struct IterationGuard {
    current: u32,
    max: u32,
    context: String,
}

impl IterationGuard {
    pub fn new(max: u32, context: &str) -> Self {
        Self {
            current: 0,
            max: max.min(EMERGENCY_MAX_ITERATIONS),
            context: context.to_string(),
        }
    }

    /// Budget of `factor` draws per candidate, at least one.
    pub fn for_candidates(candidates: usize, factor: u32, context: &str) -> Self {
        let budget = (candidates as u64)
            .saturating_mul(factor as u64)
            .clamp(1, EMERGENCY_MAX_ITERATIONS as u64) as u32;
        Self::new(budget, context)
    }

    pub fn increment(&mut self) -> Result<u32, IterationError> {
        self.current += 1;
        if self.current > self.max {
            Err(IterationError {
                current: self.current,
                max: self.max,
                context: self.context.clone(),
            })
        } else {
            Ok(self.current)
        }
    }

    #[inline]
    pub fn current(&self) -> u32 {
        self.current
    }

    #[inline]
    pub fn max(&self) -> u32 {
        self.max
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.current)
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.current >= self.max
    }

    pub fn context(&self) -> &str {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_guard_basic() {
        let mut guard = IterationGuard::new(5, "test");

        for i in 1..=5 {
            assert_eq!(guard.increment().unwrap(), i);
        }

        assert!(guard.increment().is_err());
    }

    #[test]
    fn test_iteration_guard_remaining() {
        let mut guard = IterationGuard::new(10, "test");

        assert_eq!(guard.remaining(), 10);
        guard.increment().unwrap();
        assert_eq!(guard.remaining(), 9);
    }

    #[test]
    fn test_iteration_guard_emergency_limit() {
        let guard = IterationGuard::new(u32::MAX, "test");
        assert_eq!(guard.max(), EMERGENCY_MAX_ITERATIONS);
    }

    #[test]
    fn test_for_candidates_scales_with_pool() {
        assert_eq!(IterationGuard::for_candidates(6, 10, "select").max(), 60);
        assert_eq!(IterationGuard::for_candidates(0, 10, "select").max(), 1);
    }

    #[test]
    fn test_iteration_error_display() {
        let error = IterationError {
            current: 61,
            max: 60,
            context: "selector redraw".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Iteration limit exceeded: 61/60 in selector redraw"
        );
    }
}
