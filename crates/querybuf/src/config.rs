//! Query buffer configuration.
//!
//! Tuning knobs for the per-query caches. The defaults match what a single
//! query execution needs; embedders running very wide result sets may want
//! a larger association sweep interval.

/// Default number of new row associations between dead-entry sweeps.
pub const DEFAULT_ASSOCIATION_SWEEP_INTERVAL: usize = 256;

/// Options controlling cache maintenance inside a [`crate::QueryBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryBufferOptions {
    /// Drop dead weak entries from an identity-map slot before inserting a
    /// brand new key (default: true)
    pub collect_garbage_on_insert: bool,
    /// Prune dead row associations after this many new associations
    /// (default: 256, 0 disables pruning)
    pub association_sweep_interval: usize,
}

impl Default for QueryBufferOptions {
    fn default() -> Self {
        Self {
            collect_garbage_on_insert: true,
            association_sweep_interval: DEFAULT_ASSOCIATION_SWEEP_INTERVAL,
        }
    }
}

impl QueryBufferOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the identity-map sweep on insert.
    pub fn collect_garbage_on_insert(mut self, enabled: bool) -> Self {
        self.collect_garbage_on_insert = enabled;
        self
    }

    /// Set how many associations are recorded between sweeps.
    pub fn association_sweep_interval(mut self, interval: usize) -> Self {
        self.association_sweep_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = QueryBufferOptions::default();
        assert!(opts.collect_garbage_on_insert);
        assert_eq!(opts.association_sweep_interval, 256);
    }

    #[test]
    fn builder_overrides() {
        let opts = QueryBufferOptions::new()
            .collect_garbage_on_insert(false)
            .association_sweep_interval(8);
        assert!(!opts.collect_garbage_on_insert);
        assert_eq!(opts.association_sweep_interval, 8);
    }
}
