//! Mirror Policy (component C): given a resource and the outcome of its
//! last attempt, decides which mirror to try next, tracking a per-mirror
//! retry budget.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::download::{Downloadable, DownloadableFactory};
use crate::error::DownloadError;
use crate::model::{Mirror, Resource};

/// Per-(resource, mirror) retry bookkeeping, tracked internally by
/// [`WeightedMirrorPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCounter {
    pub count: u32,
    pub budget: u32,
}

impl RetryCounter {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.count >= self.budget
    }
}

/// Notified of mirror-policy-level events that don't map to a single
/// task's terminal failure.
#[async_trait]
pub trait MirrorPolicyDelegate: Send + Sync {
    /// A mirror could not be instantiated into a downloadable (e.g.
    /// unsupported scheme) and was marked exhausted without ever being
    /// tried.
    async fn failed_to_generate_downloadable(&self, resource_id: &str, mirror_id: &str);

    /// Every mirror for a resource is exhausted; no further attempts are
    /// possible without caller intervention (e.g. adding mirrors).
    async fn exhausted_all_mirrors(&self, resource_id: &str);
}

/// Chooses the next mirror (and builds a fresh [`Downloadable`] for it)
/// given a resource and the outcome of its previous attempt.
#[async_trait]
pub trait MirrorPolicy: Send + Sync {
    /// Returns a downloadable for the next mirror to try, or `None` if
    /// every mirror is exhausted.
    ///
    /// `last_mirror_id`/`last_error` are `None` on the first attempt.
    async fn next_downloadable(
        &self,
        resource: &Resource,
        last_mirror_id: Option<&str>,
        last_error: Option<&DownloadError>,
    ) -> Option<Arc<dyn Downloadable>>;

    /// Clears retry bookkeeping for `resource_id` on success, so a later
    /// request for the same resource starts with a fresh budget.
    async fn download_complete(&self, resource_id: &str);
}

/// Default policy: ranks mirrors by descending `weight` (ties broken by
/// declaration order), enforcing a fixed retry budget per mirror before
/// moving to the next.
pub struct WeightedMirrorPolicy {
    retry_budget: u32,
    counters: DashMap<(String, String), RetryCounter>,
    exhausted: DashMap<String, std::collections::HashSet<String>>,
    delegate: tokio::sync::Mutex<Option<Weak<dyn MirrorPolicyDelegate>>>,
    factory: Arc<dyn DownloadableFactory>,
}

impl WeightedMirrorPolicy {
    #[must_use]
    pub fn new(retry_budget: u32, factory: Arc<dyn DownloadableFactory>) -> Self {
        Self {
            retry_budget,
            counters: DashMap::new(),
            exhausted: DashMap::new(),
            delegate: tokio::sync::Mutex::new(None),
            factory,
        }
    }

    pub async fn set_delegate(&self, delegate: Weak<dyn MirrorPolicyDelegate>) {
        *self.delegate.lock().await = Some(delegate);
    }

    fn ranked_candidates<'a>(&self, resource: &'a Resource) -> Vec<&'a Mirror> {
        let mut mirrors = resource.all_mirrors();
        mirrors.sort_by(|a, b| b.weight().cmp(&a.weight()));
        mirrors
    }

    fn is_mirror_exhausted(&self, resource_id: &str, mirror_id: &str) -> bool {
        if self
            .exhausted
            .get(resource_id)
            .is_some_and(|set| set.contains(mirror_id))
        {
            return true;
        }
        self.counters
            .get(&(resource_id.to_string(), mirror_id.to_string()))
            .is_some_and(|counter| counter.is_exhausted())
    }

    fn mark_exhausted(&self, resource_id: &str, mirror_id: &str) {
        self.exhausted
            .entry(resource_id.to_string())
            .or_default()
            .insert(mirror_id.to_string());
    }

    fn record_attempt(&self, resource_id: &str, mirror_id: &str) {
        let mut counter = self
            .counters
            .entry((resource_id.to_string(), mirror_id.to_string()))
            .or_insert(RetryCounter {
                count: 0,
                budget: self.retry_budget,
            });
        counter.count += 1;
        if counter.is_exhausted() {
            self.mark_exhausted(resource_id, mirror_id);
        }
    }

    async fn notify_failed_to_generate(&self, resource_id: &str, mirror_id: &str) {
        let delegate = self.delegate.lock().await.as_ref().and_then(Weak::upgrade);
        if let Some(delegate) = delegate {
            delegate
                .failed_to_generate_downloadable(resource_id, mirror_id)
                .await;
        }
    }

    async fn notify_exhausted(&self, resource_id: &str) {
        let delegate = self.delegate.lock().await.as_ref().and_then(Weak::upgrade);
        if let Some(delegate) = delegate {
            delegate.exhausted_all_mirrors(resource_id).await;
        }
    }
}

#[async_trait]
impl MirrorPolicy for WeightedMirrorPolicy {
    async fn next_downloadable(
        &self,
        resource: &Resource,
        last_mirror_id: Option<&str>,
        last_error: Option<&DownloadError>,
    ) -> Option<Arc<dyn Downloadable>> {
        if let (Some(mirror_id), Some(_)) = (last_mirror_id, last_error) {
            self.record_attempt(&resource.id, mirror_id);
        }

        loop {
            let candidates = self.ranked_candidates(resource);
            let Some(mirror) = candidates
                .into_iter()
                .find(|m| !self.is_mirror_exhausted(&resource.id, &m.id))
            else {
                warn!(resource_id = %resource.id, "all mirrors exhausted");
                self.notify_exhausted(&resource.id).await;
                return None;
            };

            match self.factory.create(&resource.id, mirror) {
                Ok(downloadable) => return Some(downloadable),
                Err(err) => {
                    debug!(resource_id = %resource.id, mirror_id = %mirror.id, %err, "mirror instantiation failed");
                    self.mark_exhausted(&resource.id, &mirror.id);
                    self.notify_failed_to_generate(&resource.id, &mirror.id).await;
                }
            }
        }
    }

    async fn download_complete(&self, resource_id: &str) {
        self.exhausted.remove(resource_id);
        self.counters.retain(|(rid, _), _| rid != resource_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::mock::MockFactory;
    use crate::error::NetworkError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resource_with_weights() -> Resource {
        let main = Mirror::new("main", "mock://main").with_weight(1);
        let alt = Mirror::new("alt", "mock://alt").with_weight(10);
        Resource::new("r1", main).with_alternatives(vec![alt])
    }

    #[tokio::test]
    async fn test_first_attempt_picks_highest_weight() {
        let policy = WeightedMirrorPolicy::new(3, Arc::new(MockFactory::default()));
        let resource = resource_with_weights();
        let downloadable = policy.next_downloadable(&resource, None, None).await.unwrap();
        assert_eq!(downloadable.mirror().id, "alt");
    }

    #[tokio::test]
    async fn test_retry_budget_moves_to_next_mirror_after_exhaustion() {
        let policy = WeightedMirrorPolicy::new(2, Arc::new(MockFactory::default()));
        let resource = resource_with_weights();
        let error = DownloadError::Network(NetworkError::ConnectionFailed { reason: "x".into() });

        // alt fails twice, exhausting its budget of 2.
        let first = policy.next_downloadable(&resource, None, None).await.unwrap();
        assert_eq!(first.mirror().id, "alt");
        let second = policy
            .next_downloadable(&resource, Some("alt"), Some(&error))
            .await
            .unwrap();
        assert_eq!(second.mirror().id, "alt");
        let third = policy
            .next_downloadable(&resource, Some("alt"), Some(&error))
            .await
            .unwrap();
        assert_eq!(third.mirror().id, "main");
    }

    #[tokio::test]
    async fn test_all_mirrors_exhausted_returns_none_and_notifies_delegate() {
        struct CountingDelegate {
            exhausted_calls: AtomicUsize,
        }
        #[async_trait]
        impl MirrorPolicyDelegate for CountingDelegate {
            async fn failed_to_generate_downloadable(&self, _resource_id: &str, _mirror_id: &str) {}
            async fn exhausted_all_mirrors(&self, _resource_id: &str) {
                self.exhausted_calls.fetch_add(1, Ordering::SeqCst);
            }
        }

        let policy = WeightedMirrorPolicy::new(1, Arc::new(MockFactory::default()));
        let delegate = Arc::new(CountingDelegate {
            exhausted_calls: AtomicUsize::new(0),
        });
        policy
            .set_delegate(Arc::downgrade(&delegate) as Weak<dyn MirrorPolicyDelegate>)
            .await;

        let resource = Resource::new("r1", Mirror::new("only", "mock://only"));
        let error = DownloadError::Network(NetworkError::ConnectionFailed { reason: "x".into() });
        let first = policy.next_downloadable(&resource, None, None).await;
        assert!(first.is_some());
        let second = policy
            .next_downloadable(&resource, Some("only"), Some(&error))
            .await;
        assert!(second.is_none());
        assert_eq!(delegate.exhausted_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_instantiation_failure_marks_exhausted_and_notifies() {
        struct CountingDelegate {
            failed_calls: AtomicUsize,
        }
        #[async_trait]
        impl MirrorPolicyDelegate for CountingDelegate {
            async fn failed_to_generate_downloadable(&self, _resource_id: &str, _mirror_id: &str) {
                self.failed_calls.fetch_add(1, Ordering::SeqCst);
            }
            async fn exhausted_all_mirrors(&self, _resource_id: &str) {}
        }

        let policy = WeightedMirrorPolicy::new(3, Arc::new(MockFactory { fail_scheme: Some("mock") }));
        let delegate = Arc::new(CountingDelegate {
            failed_calls: AtomicUsize::new(0),
        });
        policy
            .set_delegate(Arc::downgrade(&delegate) as Weak<dyn MirrorPolicyDelegate>)
            .await;

        let resource = resource_with_weights();
        let result = policy.next_downloadable(&resource, None, None).await;
        assert!(result.is_none());
        assert_eq!(delegate.failed_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_download_complete_resets_budget() {
        let policy = WeightedMirrorPolicy::new(1, Arc::new(MockFactory::default()));
        let resource = Resource::new("r1", Mirror::new("only", "mock://only"));
        let error = DownloadError::Network(NetworkError::ConnectionFailed { reason: "x".into() });

        let _ = policy.next_downloadable(&resource, None, None).await;
        let exhausted = policy
            .next_downloadable(&resource, Some("only"), Some(&error))
            .await;
        assert!(exhausted.is_none());

        policy.download_complete("r1").await;
        let after_reset = policy.next_downloadable(&resource, None, None).await;
        assert!(after_reset.is_some());
    }
}
