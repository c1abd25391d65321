//! Session configuration.

/// Configuration for a [`crate::Session`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of nested transactions, root included.
    pub max_hierarchy_depth: usize,

    /// Whether deletes also clear unidirectional references held by other
    /// loaded entities.
    pub fix_up_unidirectional_references: bool,

    /// History bound for lifecycle feeds created by the session.
    pub feed_history: usize,

    /// Whether unloading an identity unknown to every level is an error.
    pub strict_unload: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_hierarchy_depth: 16,
            fix_up_unidirectional_references: true,
            feed_history: 1024,
            strict_unload: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum hierarchy depth.
    #[must_use]
    pub const fn max_hierarchy_depth(mut self, depth: usize) -> Self {
        self.max_hierarchy_depth = depth;
        self
    }

    /// Sets whether unidirectional references are fixed up on delete.
    #[must_use]
    pub const fn fix_up_unidirectional_references(mut self, value: bool) -> Self {
        self.fix_up_unidirectional_references = value;
        self
    }

    /// Sets the lifecycle feed history bound.
    #[must_use]
    pub const fn feed_history(mut self, size: usize) -> Self {
        self.feed_history = size;
        self
    }

    /// Sets whether unloading unknown identities is an error.
    #[must_use]
    pub const fn strict_unload(mut self, value: bool) -> Self {
        self.strict_unload = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_hierarchy_depth, 16);
        assert!(config.fix_up_unidirectional_references);
        assert!(!config.strict_unload);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_hierarchy_depth(3)
            .fix_up_unidirectional_references(false)
            .strict_unload(true)
            .feed_history(8);

        assert_eq!(config.max_hierarchy_depth, 3);
        assert!(!config.fix_up_unidirectional_references);
        assert!(config.strict_unload);
        assert_eq!(config.feed_history, 8);
    }
}
