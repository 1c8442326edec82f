//! Job priority levels.

use serde::{Deserialize, Serialize};

/// Scheduling priority, clamped to `[MIN_PRIO, MAX_PRIO]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority value
    pub const MIN_PRIO: i64 = 0;
    /// Highest priority value
    pub const MAX_PRIO: i64 = 2;

    /// Background work
    pub const LOW: Self = Self(0);
    /// Default
    pub const MEDIUM: Self = Self(1);
    /// Interactive work
    pub const HIGH: Self = Self(2);

    /// Clamp any integer into range
    #[must_use]
    pub fn clamped(value: i64) -> Self {
        let v = value.clamp(Self::MIN_PRIO, Self::MAX_PRIO);
        Self(u8::try_from(v).unwrap_or(0))
    }

    /// Parse a level name or an integer, clamping integers
    ///
    /// # Errors
    ///
    /// Returns the rejected text if it is neither
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::LOW),
            "medium" => Ok(Self::MEDIUM),
            "high" => Ok(Self::HIGH),
            other => other
                .parse::<i64>()
                .map(Self::clamped)
                .map_err(|_| s.to_string()),
        }
    }

    /// Numeric value
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0 as i64
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::LOW => write!(f, "low"),
            Self::MEDIUM => write!(f, "medium"),
            _ => write!(f, "high"),
        }
    }
}
