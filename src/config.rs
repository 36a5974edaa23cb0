//! Ambient configuration: concurrency knobs, the mirror retry budget, and
//! which HTTP status codes the web transport treats as transient.
//!
//! A plain struct, not a file-backed config layer — that belongs one layer
//! up, in whatever CLI/app embeds this engine.

/// Tunables for a [`crate::manager::ResourceManager`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max concurrent transfers in the normal-priority queue.
    pub simultaneous_downloads: usize,
    /// Whether a second, high/urgent priority tier queue is maintained
    /// alongside the normal queue.
    pub enable_priority_tier: bool,
    /// Max concurrent transfers in the priority-tier queue, if enabled.
    /// Defaults to `simultaneous_downloads` when unset.
    pub priority_simultaneous_downloads: Option<usize>,
    /// Per-mirror retry attempts before the mirror policy marks a mirror
    /// exhausted and moves to the next one.
    pub retry_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            simultaneous_downloads: 4,
            enable_priority_tier: true,
            priority_simultaneous_downloads: None,
            retry_budget: 3,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn priority_concurrency(&self) -> usize {
        self.priority_simultaneous_downloads
            .unwrap_or(self.simultaneous_downloads)
    }
}

/// Directory qualifiers passed to `directories::ProjectDirs` when resolving
/// the default cache/permanent storage roots.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub qualifier: String,
    pub organization: String,
    pub application: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            qualifier: String::new(),
            organization: String::new(),
            application: "resource-download-engine".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_priority_concurrency_falls_back() {
        let config = EngineConfig::default();
        assert_eq!(config.priority_concurrency(), config.simultaneous_downloads);
    }

    #[test]
    fn test_explicit_priority_concurrency_overrides() {
        let config = EngineConfig {
            priority_simultaneous_downloads: Some(2),
            ..Default::default()
        };
        assert_eq!(config.priority_concurrency(), 2);
    }
}
