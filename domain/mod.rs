//! Shared domain primitives
//!
//! Small types referenced across the piece engine, the instruction builder,
//! and the provider contract. Anything that belongs to exactly one component
//! lives next to that component instead.

use serde::{Deserialize, Serialize};

/// Permission floor/ceiling for a movement's provider call.
///
/// Ordered `Readonly < Edit < Full`; resolution in [`crate::config`] picks the
/// highest-precedence configured value and then clamps it to be at least the
/// movement's own floor (§6 permission mode resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    #[default]
    Readonly,
    Edit,
    Full,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Readonly => write!(f, "readonly"),
            Self::Edit => write!(f, "edit"),
            Self::Full => write!(f, "full"),
        }
    }
}

impl PermissionMode {
    /// Clamp `self` up to at least `floor`, returning the higher of the two.
    pub fn at_least(self, floor: PermissionMode) -> PermissionMode {
        self.max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_mode_ordering() {
        assert!(PermissionMode::Readonly < PermissionMode::Edit);
        assert!(PermissionMode::Edit < PermissionMode::Full);
    }

    #[test]
    fn at_least_clamps_up_not_down() {
        assert_eq!(PermissionMode::Readonly.at_least(PermissionMode::Edit), PermissionMode::Edit);
        assert_eq!(PermissionMode::Full.at_least(PermissionMode::Edit), PermissionMode::Full);
    }
}
