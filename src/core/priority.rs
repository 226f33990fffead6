//! Priority levels for queued work.

use serde::{Deserialize, Serialize};

/// Priority of a queued change.
///
/// Higher value = higher priority (processed first). Retries lower the
/// priority by one step so a failing write cannot starve fresh work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Bulk regeneration (many files at once)
    pub const BULK: Self = Self(10);
    /// Default for ad-hoc writes
    pub const NORMAL: Self = Self(50);
    /// Visual editor action - user is waiting on the preview
    pub const EDITOR: Self = Self(100);

    /// One step lower, used when re-inserting a failed change.
    pub const fn lowered(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::EDITOR > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::BULK);
    }

    #[test]
    fn test_lowered() {
        assert_eq!(Priority(5).lowered(), Priority(4));
        assert_eq!(Priority(i32::MIN).lowered(), Priority(i32::MIN));
    }
}
