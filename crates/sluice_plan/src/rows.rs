//! Row-count bounds on typed inputs and outputs.

use serde::{Deserialize, Serialize};

/// Inclusive min/max row bounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBounds {
    /// Minimum rows
    pub min: Option<u64>,
    /// Maximum rows
    pub max: Option<u64>,
}

impl RowBounds {
    /// Unbounded
    #[must_use]
    pub const fn new() -> Self {
        Self {
            min: None,
            max: None,
        }
    }

    /// Set minimum
    #[must_use]
    pub const fn with_min(mut self, min: u64) -> Self {
        self.min = Some(min);
        self
    }

    /// Set maximum
    #[must_use]
    pub const fn with_max(mut self, max: u64) -> Self {
        self.max = Some(max);
        self
    }

    /// Check if a row count is within bounds
    #[must_use]
    pub fn check(&self, rows: u64) -> bool {
        self.min.is_none_or(|min| rows >= min) && self.max.is_none_or(|max| rows <= max)
    }

    /// Whether no bound is set
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

impl std::fmt::Display for RowBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => write!(f, "[{}, {}]", lo, hi),
            (Some(lo), None) => write!(f, ">= {}", lo),
            (None, Some(hi)) => write!(f, "<= {}", hi),
            (None, None) => write!(f, "any"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_accepts_everything() {
        let bounds = RowBounds::new();
        assert!(bounds.is_unbounded());
        assert!(bounds.check(0));
        assert!(bounds.check(u64::MAX));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let bounds = RowBounds::new().with_min(2).with_max(5);
        assert!(!bounds.check(1));
        assert!(bounds.check(2));
        assert!(bounds.check(5));
        assert!(!bounds.check(6));
        assert_eq!(bounds.to_string(), "[2, 5]");
    }
}
