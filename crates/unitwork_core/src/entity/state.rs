//! Entity lifecycle state.

use std::fmt;

/// State of an entity within one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Created in this transaction (or an ancestor's child view) and never persisted.
    New,
    /// Loaded and unchanged.
    Existing,
    /// Loaded, with changed properties or relations.
    Changed,
    /// Marked for removal from the backing store at commit.
    Deleted,
    /// Gone from this transaction; the identity can no longer be used here.
    Discarded,
}

impl EntityState {
    /// Returns true for states that permit reads and mutations.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::New | Self::Existing | Self::Changed)
    }

    /// Returns true for states that must be written on commit.
    #[must_use]
    pub const fn needs_persisting(self) -> bool {
        matches!(self, Self::New | Self::Changed | Self::Deleted)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Existing => "existing",
            Self::Changed => "changed",
            Self::Deleted => "deleted",
            Self::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

/// Stored lifecycle of a registered entity; `Changed` and `Discarded` are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    New,
    Existing,
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_states() {
        assert!(EntityState::New.is_live());
        assert!(EntityState::Changed.is_live());
        assert!(!EntityState::Deleted.is_live());
        assert!(!EntityState::Discarded.is_live());
    }

    #[test]
    fn persisting_states() {
        assert!(EntityState::Deleted.needs_persisting());
        assert!(!EntityState::Existing.needs_persisting());
        assert!(!EntityState::Discarded.needs_persisting());
    }
}
