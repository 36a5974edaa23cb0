//! Atomic counters tracking engine-wide activity (component I).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe counters for the lifetime of a [`crate::manager::ResourceManager`].
///
/// Mirrors the teacher's `DownloadStats` pattern: private `increment_*`
/// bumpers used internally, public zero-argument readers for callers.
#[derive(Debug, Default)]
pub struct Metrics {
    requested: AtomicU64,
    download_began: AtomicU64,
    download_finished: AtomicU64,
    download_failed: AtomicU64,
    download_cancelled: AtomicU64,
    priority_raised: AtomicU64,
    priority_lowered: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
}

macro_rules! counter_accessors {
    ($field:ident, $inc:ident, $get:ident) => {
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::SeqCst);
        }

        /// Current value of this counter.
        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::SeqCst)
        }
    };
}

impl Metrics {
    /// Builds a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter_accessors!(requested, increment_requested, requested);
    counter_accessors!(download_began, increment_download_began, download_began);
    counter_accessors!(
        download_finished,
        increment_download_finished,
        download_finished
    );
    counter_accessors!(
        download_failed,
        increment_download_failed,
        download_failed
    );
    counter_accessors!(
        download_cancelled,
        increment_download_cancelled,
        download_cancelled
    );
    counter_accessors!(
        priority_raised,
        increment_priority_raised,
        priority_raised
    );
    counter_accessors!(
        priority_lowered,
        increment_priority_lowered,
        priority_lowered
    );
    counter_accessors!(cache_hits, increment_cache_hits, cache_hits);
    counter_accessors!(cache_misses, increment_cache_misses, cache_misses);
    counter_accessors!(retries, increment_retries, retries);

    /// Captures an immutable point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requested: self.requested(),
            download_began: self.download_began(),
            download_finished: self.download_finished(),
            download_failed: self.download_failed(),
            download_cancelled: self.download_cancelled(),
            priority_raised: self.priority_raised(),
            priority_lowered: self.priority_lowered(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            retries: self.retries(),
        }
    }
}

/// A serializable point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requested: u64,
    pub download_began: u64,
    pub download_finished: u64,
    pub download_failed: u64,
    pub download_cancelled: u64,
    pub priority_raised: u64,
    pub priority_lowered: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retries: u64,
}
