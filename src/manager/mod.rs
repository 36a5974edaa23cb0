//! Resource Manager (component F): the public façade. Deduplicates
//! requests against the cache, coordinates the normal/priority queue tiers,
//! and fans out completion callbacks and observer events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::cache::{CacheLookup, CacheManager};
use crate::config::EngineConfig;
use crate::download::{DownloadQueue, DownloadTask, Processor, QueueObserver, RetryContext};
use crate::error::DownloadError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::mirror::MirrorPolicy;
use crate::model::{DownloadPriority, RequestOptions, Resource};
use crate::progress::ProgressNode;

/// Receives the Resource Manager's per-task lifecycle callbacks: the
/// externally-facing counterpart to [`QueueObserver`], already translated
/// out of Queue-internal concepts like temp files.
#[async_trait]
pub trait ManagerObserver: Send + Sync {
    async fn did_start(&self, task_id: &str);
    async fn will_retry(&self, task_id: &str, context: &RetryContext);
    async fn did_finish(&self, task_id: &str, error: Option<&DownloadError>);
}

/// A resource that survived the cache lookup and is ready to be admitted
/// to a queue via [`ResourceManager::process`].
pub struct PendingRequest {
    pub(crate) task: DownloadTask,
}

impl PendingRequest {
    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.task.id
    }
}

type CompletionCallback = Box<dyn Fn(Result<PathBuf, DownloadError>) + Send + Sync>;

struct ActiveTaskInfo {
    resource: Resource,
    options: RequestOptions,
    /// Set if `CacheManager::store` failed in `did_finish_transfer`; checked
    /// by `did_complete` so a storage failure still surfaces as a terminal
    /// failure rather than a false success.
    store_error: Option<DownloadError>,
}

/// Coordinates the two download-queue tiers, the local cache, and
/// observer/completion fan-out.
pub struct ResourceManager {
    normal_queue: Arc<DownloadQueue>,
    priority_queue: Option<Arc<DownloadQueue>>,
    cache: Arc<CacheManager>,
    policy: Arc<dyn MirrorPolicy>,
    metrics: Arc<Metrics>,
    progress: AsyncMutex<ProgressNode>,
    completions: DashMap<String, Vec<CompletionCallback>>,
    active_tasks: DashMap<String, ActiveTaskInfo>,
    observers: AsyncMutex<Vec<Weak<dyn ManagerObserver>>>,
    registered_processors: AsyncMutex<Vec<Arc<dyn Processor>>>,
    seq: AtomicU64,
}

impl ResourceManager {
    /// Builds a manager with its own normal (and, unless disabled,
    /// priority) download queue, wired as that queue's observer.
    pub async fn new(
        config: EngineConfig,
        cache: Arc<CacheManager>,
        policy: Arc<dyn MirrorPolicy>,
    ) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let normal_queue = DownloadQueue::new(
            Arc::clone(&policy),
            Arc::clone(&metrics),
            config.simultaneous_downloads,
        );
        let priority_queue = config.enable_priority_tier.then(|| {
            DownloadQueue::new(
                Arc::clone(&policy),
                Arc::clone(&metrics),
                config.priority_concurrency(),
            )
        });

        let manager = Arc::new(Self {
            normal_queue: Arc::clone(&normal_queue),
            priority_queue: priority_queue.clone(),
            cache,
            policy,
            metrics,
            progress: AsyncMutex::new(ProgressNode::new_unit_mode(&[])),
            completions: DashMap::new(),
            active_tasks: DashMap::new(),
            observers: AsyncMutex::new(Vec::new()),
            registered_processors: AsyncMutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        });

        let observer: Weak<dyn QueueObserver> = Arc::downgrade(&manager) as Weak<dyn QueueObserver>;
        normal_queue.set_observer(Weak::clone(&observer)).await;
        if let Some(priority_queue) = &manager.priority_queue {
            priority_queue.set_observer(observer).await;
        }

        manager
    }

    /// Registers a transport with every queue tier this manager runs.
    pub async fn register_processor(&self, processor: Arc<dyn Processor>) {
        self.normal_queue.register_processor(Arc::clone(&processor)).await;
        if let Some(priority_queue) = &self.priority_queue {
            priority_queue.register_processor(Arc::clone(&processor)).await;
        }
        self.registered_processors.lock().await.push(processor);
    }

    /// Registers an external observer (held weakly).
    pub async fn add_observer(&self, observer: Weak<dyn ManagerObserver>) {
        self.observers.lock().await.push(observer);
    }

    /// Registers a one-shot completion callback for `resource_id`. Fires
    /// with the final local path on success, or the terminal error.
    pub fn on_completion(&self, resource_id: impl Into<String>, callback: CompletionCallback) {
        self.completions
            .entry(resource_id.into())
            .or_default()
            .push(callback);
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn progress(&self) -> ProgressNode {
        self.progress.lock().await.clone()
    }

    /// Checks the cache for each resource, performing in-place storage-class
    /// upgrades and firing completion callbacks for hits immediately.
    /// Returns the subset that still needs a download, each already bound
    /// to a policy-selected mirror.
    #[instrument(skip(self, resources))]
    pub async fn request(
        &self,
        resources: Vec<Resource>,
        options: RequestOptions,
    ) -> Vec<PendingRequest> {
        let mut pending = Vec::new();
        for resource in resources {
            self.metrics.increment_requested();
            match self.cache.classify(&resource.id, options.storage_priority).await {
                CacheLookup::Hit => {
                    self.metrics.increment_cache_hits();
                    self.complete_from_cache(&resource.id).await;
                }
                CacheLookup::UpgradeNeeded => {
                    self.metrics.increment_cache_hits();
                    let _ = self
                        .cache
                        .update_storage(&[resource.id.clone()], options.storage_priority)
                        .await;
                    self.complete_from_cache(&resource.id).await;
                }
                CacheLookup::Miss => {
                    self.metrics.increment_cache_misses();
                    match self.policy.next_downloadable(&resource, None, None).await {
                        Some(downloadable) => {
                            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                            let task = DownloadTask::new(resource, options, downloadable, seq);
                            pending.push(PendingRequest { task });
                        }
                        None => {
                            let error = DownloadError::Mirror(
                                crate::error::MirrorError::NoMirrors {
                                    resource_id: resource.id.clone(),
                                },
                            );
                            self.fire_completion(&resource.id, Err(error)).await;
                        }
                    }
                }
            }
        }
        pending
    }

    async fn complete_from_cache(&self, resource_id: &str) {
        let path = self.cache.file_url(resource_id).await;
        match path {
            Some(path) => self.fire_completion(resource_id, Ok(path)).await,
            None => {
                self.fire_completion(
                    resource_id,
                    Err(DownloadError::Cache(crate::error::CacheError::FileNotFound {
                        path: resource_id.to_string(),
                    })),
                )
                .await
            }
        }
    }

    /// Admits previously-requested tasks at `priority`, implementing the
    /// two-tier preemption rules: `High` relocates an already-queued
    /// `Normal` task up; `Urgent` additionally drains the priority queue's
    /// other queued tasks back down to `Normal` so it dispatches promptly.
    #[instrument(skip(self, requests))]
    pub async fn process(
        &self,
        requests: Vec<PendingRequest>,
        priority: DownloadPriority,
    ) -> Vec<String> {
        let mut admitted = Vec::new();
        for pending in requests {
            let mut task = pending.task;
            task.priority = priority.weight();
            let resource_id = task.id.clone();

            let use_priority_tier = priority != DownloadPriority::Normal && self.priority_queue.is_some();

            self.active_tasks.insert(
                resource_id.clone(),
                ActiveTaskInfo {
                    resource: task.resource.clone(),
                    options: task.options,
                    store_error: None,
                },
            );

            if use_priority_tier {
                let priority_queue = self.priority_queue.as_ref().unwrap();
                // If the same resource is already sitting in the normal
                // queue (e.g. a prior Normal-tier request), relocate that
                // task rather than admitting a second, duplicate one.
                let admitted_task = self
                    .normal_queue
                    .relocate_out(&resource_id)
                    .await
                    .unwrap_or(task);
                priority_queue.download(admitted_task).await;
                self.metrics.increment_priority_raised();

                if priority == DownloadPriority::Urgent {
                    let relocated = priority_queue.drain_queued_except(&resource_id).await;
                    for task in relocated {
                        self.normal_queue.download(task).await;
                        self.metrics.increment_priority_lowered();
                    }
                }
            } else {
                self.normal_queue.download(task).await;
            }

            admitted.push(resource_id);
        }

        if !admitted.is_empty() {
            let batch = ProgressNode::new_unit_mode(&admitted);
            let mut progress = self.progress.lock().await;
            let current = std::mem::replace(&mut *progress, ProgressNode::new_unit_mode(&[]));
            match current.merge(batch) {
                Ok(merged) => *progress = merged,
                Err(err) => warn!(%err, "dropping progress batch after mode mismatch"),
            }
        }

        admitted
    }

    async fn notify_observers_did_start(&self, task_id: &str) {
        let observers: Vec<Arc<dyn ManagerObserver>> = self
            .observers
            .lock()
            .await
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.did_start(task_id).await;
        }
    }

    async fn notify_observers_will_retry(&self, task_id: &str, context: &RetryContext) {
        let observers: Vec<Arc<dyn ManagerObserver>> = self
            .observers
            .lock()
            .await
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.will_retry(task_id, context).await;
        }
    }

    async fn notify_observers_did_finish(&self, task_id: &str, error: Option<&DownloadError>) {
        let observers: Vec<Arc<dyn ManagerObserver>> = self
            .observers
            .lock()
            .await
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.did_finish(task_id, error).await;
        }
    }

    async fn fire_completion(&self, resource_id: &str, result: Result<PathBuf, DownloadError>) {
        if let Some((_, callbacks)) = self.completions.remove(resource_id) {
            for callback in callbacks {
                callback(result.clone());
            }
        }
    }

    /// Terminal failure path shared by genuine transport/queue failures and
    /// by a `CacheManager::store` failure discovered after a transfer
    /// otherwise succeeded.
    async fn fail_task(&self, task_id: &str, error: DownloadError) {
        self.active_tasks.remove(task_id);
        self.progress
            .lock()
            .await
            .complete_with_error(task_id, error.clone());
        self.fire_completion(task_id, Err(error.clone())).await;
        self.notify_observers_did_finish(task_id, Some(&error)).await;
    }

    /// The local path of `resource_id`'s cached file, if any.
    pub async fn file_url(&self, resource_id: &str) -> Option<PathBuf> {
        self.cache.file_url(resource_id).await
    }

    /// Cancels the given resource ids across whichever tier(s) currently
    /// hold them.
    pub async fn cancel(&self, resource_ids: &[String]) {
        for id in resource_ids {
            self.normal_queue.cancel(id).await;
            if let Some(priority_queue) = &self.priority_queue {
                priority_queue.cancel(id).await;
            }
        }
    }

    /// Cancels every queued and in-flight download across both tiers.
    pub async fn cancel_all(&self) {
        self.normal_queue.cancel_all().await;
        if let Some(priority_queue) = &self.priority_queue {
            priority_queue.cancel_all().await;
        }
    }

    /// Total queued (not yet dispatched) tasks across both tiers.
    pub async fn queued_download_count(&self) -> usize {
        let mut count = self.normal_queue.queued_count().await;
        if let Some(priority_queue) = &self.priority_queue {
            count += priority_queue.queued_count().await;
        }
        count
    }

    /// Total in-flight tasks across both tiers.
    pub fn current_download_count(&self) -> usize {
        let mut count = self.normal_queue.current_count();
        if let Some(priority_queue) = &self.priority_queue {
            count += priority_queue.current_count();
        }
        count
    }

    /// Enables or disables every registered processor on both tiers.
    pub async fn set_active(&self, active: bool) {
        if active {
            self.resume().await;
        } else {
            self.pause_all().await;
        }
    }

    /// Resumes every registered processor on both tiers.
    pub async fn resume(&self) {
        for processor in self.all_processors().await {
            processor.resume();
        }
    }

    async fn pause_all(&self) {
        for processor in self.all_processors().await {
            processor.pause();
        }
    }

    async fn all_processors(&self) -> Vec<Arc<dyn Processor>> {
        // The queues don't expose their processor list directly, so the
        // manager tracks its own registrations for pause/resume fan-out.
        self.registered_processors.lock().await.clone()
    }
}

#[async_trait]
impl QueueObserver for ResourceManager {
    async fn did_start(&self, task_id: &str) {
        self.notify_observers_did_start(task_id).await;
    }

    async fn did_transfer_data(&self, _task_id: &str, _transferred: u64, _total: Option<u64>) {}

    async fn did_finish_transfer(&self, task_id: &str, mirror_id: &str, temp_path: &std::path::Path) {
        let Some(info) = self.active_tasks.get(task_id) else {
            return;
        };
        let resource = info.resource.clone();
        let options = info.options;
        drop(info);

        let mirror = resource
            .all_mirrors()
            .into_iter()
            .find(|m| m.id == mirror_id)
            .cloned()
            .unwrap_or_else(|| crate::model::Mirror::new(mirror_id, "unknown"));

        if let Err(err) = self.cache.store(&resource, &mirror, temp_path, options).await {
            warn!(resource_id = %task_id, %err, "failed to store finished download in cache");
            if let Some(mut info) = self.active_tasks.get_mut(task_id) {
                info.store_error = Some(DownloadError::Cache(err));
            }
        }
    }

    async fn did_complete(&self, task_id: &str) {
        let store_error = self
            .active_tasks
            .get(task_id)
            .and_then(|info| info.store_error.clone());
        if let Some(error) = store_error {
            self.fail_task(task_id, error).await;
            return;
        }

        self.active_tasks.remove(task_id);
        let path = self.cache.file_url(task_id).await.unwrap_or_default();
        self.progress.lock().await.complete(task_id);
        self.fire_completion(task_id, Ok(path)).await;
        self.notify_observers_did_finish(task_id, None).await;
        info!(resource_id = %task_id, "download complete");
    }

    async fn did_fail(&self, task_id: &str, error: &DownloadError) {
        self.fail_task(task_id, error.clone()).await;
    }

    async fn will_retry(&self, task_id: &str, context: &RetryContext) {
        self.progress.lock().await.retry(task_id);
        self.notify_observers_will_retry(task_id, context).await;
    }
}
