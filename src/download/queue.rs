//! Download Queue (component E): dedups by id, caps simultaneous
//! downloads, and serializes all state transitions through a single
//! command-processing task (the actor-serialization model in the design
//! notes).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, instrument, warn};

use super::{DownloadEvent, DownloadEventSender, DownloadTask, Processor, TaskEvent};
use crate::error::{DownloadError, QueueError};
use crate::metrics::Metrics;
use crate::mirror::MirrorPolicy;
use crate::queue::PriorityQueue;

/// Receives the Download Queue's per-task lifecycle callbacks.
///
/// Held by weak reference: once the last strong `Arc` to an observer is
/// dropped, the Queue silently stops delivering to it rather than keeping
/// it alive.
#[async_trait]
pub trait QueueObserver: Send + Sync {
    async fn did_start(&self, task_id: &str);
    async fn did_transfer_data(&self, task_id: &str, transferred: u64, total: Option<u64>);
    /// Called once the transfer finishes, with the mirror that produced it
    /// and the processor's temporary file. The observer must consume or
    /// move the file before returning; the Queue deletes whatever remains
    /// at `temp_path` immediately after.
    async fn did_finish_transfer(&self, task_id: &str, mirror_id: &str, temp_path: &std::path::Path);
    /// Called after `did_finish_transfer` returns: the task is now
    /// terminally successful.
    async fn did_complete(&self, task_id: &str);
    async fn did_fail(&self, task_id: &str, error: &DownloadError);
    async fn will_retry(&self, task_id: &str, context: &super::RetryContext);
}

enum QueueMsg {
    Admit(DownloadTask),
    Cancel(String),
    CancelAll,
    RelocateOut(String, oneshot::Sender<Option<DownloadTask>>),
    DrainExcept(String, oneshot::Sender<Vec<DownloadTask>>),
    Event(TaskEvent),
}

/// Schedules [`DownloadTask`]s across registered [`Processor`]s.
pub struct DownloadQueue {
    heap: PriorityQueue<DownloadTask>,
    in_flight: DashMap<String, DownloadTask>,
    known_ids: DashSet<String>,
    processors: AsyncMutex<Vec<Arc<dyn Processor>>>,
    simultaneous_downloads: AtomicUsize,
    observer: AsyncMutex<Option<Weak<dyn QueueObserver>>>,
    policy: Arc<dyn MirrorPolicy>,
    metrics: Arc<Metrics>,
    cmd_tx: mpsc::UnboundedSender<QueueMsg>,
    seq: AtomicUsize,
}

impl DownloadQueue {
    /// Builds a queue and spawns its serialized command-processing task.
    #[must_use]
    pub fn new(
        policy: Arc<dyn MirrorPolicy>,
        metrics: Arc<Metrics>,
        simultaneous_downloads: usize,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let queue = Arc::new(Self {
            heap: PriorityQueue::new(),
            in_flight: DashMap::new(),
            known_ids: DashSet::new(),
            processors: AsyncMutex::new(Vec::new()),
            simultaneous_downloads: AtomicUsize::new(simultaneous_downloads.max(1)),
            observer: AsyncMutex::new(None),
            policy,
            metrics,
            cmd_tx,
            seq: AtomicUsize::new(0),
        });

        // Events funnel into the same serialized loop as commands, so a
        // task's retry re-admission can never race its own cancellation.
        let forward_tx = queue.cmd_tx.clone();
        tokio::spawn(forward_events(event_rx, forward_tx));

        let worker = Arc::clone(&queue);
        tokio::spawn(async move { worker.run(cmd_rx, event_tx).await });

        queue
    }

    /// Registers a processor. Registration order is the tie-break when
    /// multiple processors claim to support the same downloadable kind.
    pub async fn register_processor(&self, processor: Arc<dyn Processor>) {
        self.processors.lock().await.push(processor);
    }

    /// Sets (or clears, via a dropped `Arc`) the single queue observer.
    pub async fn set_observer(&self, observer: Weak<dyn QueueObserver>) {
        *self.observer.lock().await = Some(observer);
    }

    pub fn simultaneous_downloads(&self) -> usize {
        self.simultaneous_downloads.load(Ordering::SeqCst)
    }

    pub fn set_simultaneous_downloads(&self, count: usize) {
        self.simultaneous_downloads.store(count.max(1), Ordering::SeqCst);
    }

    /// True if `id` is queued or in flight.
    pub fn has_download(&self, id: &str) -> bool {
        self.known_ids.contains(id)
    }

    pub fn is_downloading(&self, id: &str) -> bool {
        self.in_flight.contains_key(id)
    }

    pub async fn queued_count(&self) -> usize {
        self.heap.count().await
    }

    pub fn current_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns a clone of `id`'s task, whether queued or in flight.
    pub async fn download_for(&self, id: &str) -> Option<DownloadTask> {
        if let Some(entry) = self.in_flight.get(id) {
            return Some(entry.clone());
        }
        self.heap.snapshot().await.into_iter().find(|t| t.id == id)
    }

    /// Admits a task. A second admission for an id already queued or
    /// in-flight is a no-op (invariant I1). The actual dedup check happens
    /// inside the serialized command loop (`QueueMsg::Admit`), since
    /// `known_ids` must be checked-and-inserted atomically with respect to
    /// concurrent admissions of the same id.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn download(&self, task: DownloadTask) {
        let _ = self.cmd_tx.send(QueueMsg::Admit(task));
    }

    /// Cancels `id`, whether queued or in flight.
    pub async fn cancel(&self, id: &str) {
        let _ = self.cmd_tx.send(QueueMsg::Cancel(id.to_string()));
    }

    /// Cancels every queued and in-flight task.
    pub async fn cancel_all(&self) {
        let _ = self.cmd_tx.send(QueueMsg::CancelAll);
    }

    /// Removes `id` from this queue without synthesizing a cancellation
    /// (used by the Resource Manager to relocate a task between priority
    /// tiers). Returns `None` if `id` is not currently queued (e.g. already
    /// in flight, or absent).
    pub(crate) async fn relocate_out(&self, id: &str) -> Option<DownloadTask> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(QueueMsg::RelocateOut(id.to_string(), tx));
        rx.await.ok().flatten()
    }

    /// Removes every queued task except `keep_id` (used by urgent
    /// preemption to drain the priority queue back to normal).
    pub(crate) async fn drain_queued_except(&self, keep_id: &str) -> Vec<DownloadTask> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(QueueMsg::DrainExcept(keep_id.to_string(), tx));
        rx.await.unwrap_or_default()
    }

    async fn notify<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<dyn QueueObserver>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let observer = self.observer.lock().await.as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            f(observer).await;
        }
    }

    async fn run(
        self: Arc<Self>,
        mut cmd_rx: mpsc::UnboundedReceiver<QueueMsg>,
        event_tx: mpsc::UnboundedSender<TaskEvent>,
    ) {
        while let Some(msg) = cmd_rx.recv().await {
            match msg {
                QueueMsg::Admit(task) => {
                    if !self.known_ids.insert(task.id.clone()) {
                        debug!(task_id = %task.id, "duplicate admission ignored");
                        continue;
                    }
                    self.heap.enqueue(task).await;
                    self.dispatch(&event_tx).await;
                }
                QueueMsg::Cancel(id) => {
                    self.handle_cancel(&id).await;
                    self.dispatch(&event_tx).await;
                }
                QueueMsg::CancelAll => {
                    let queued_ids: Vec<String> =
                        self.heap.snapshot().await.into_iter().map(|t| t.id).collect();
                    for id in queued_ids {
                        self.handle_cancel(&id).await;
                    }
                    let in_flight_ids: Vec<String> =
                        self.in_flight.iter().map(|e| e.key().clone()).collect();
                    for id in in_flight_ids {
                        self.handle_cancel(&id).await;
                    }
                    self.dispatch(&event_tx).await;
                }
                QueueMsg::RelocateOut(id, reply) => {
                    let removed = self.heap.remove_where(|t| t.id == id).await;
                    let task = removed.into_iter().next();
                    if task.is_some() {
                        self.known_ids.remove(&id);
                    }
                    let _ = reply.send(task);
                    self.dispatch(&event_tx).await;
                }
                QueueMsg::DrainExcept(keep_id, reply) => {
                    let removed = self.heap.remove_where(|t| t.id != keep_id).await;
                    for task in &removed {
                        self.known_ids.remove(&task.id);
                    }
                    let _ = reply.send(removed);
                    self.dispatch(&event_tx).await;
                }
                QueueMsg::Event(task_event) => {
                    self.handle_event(task_event).await;
                    self.dispatch(&event_tx).await;
                }
            }
        }
    }

    async fn handle_cancel(&self, id: &str) {
        if let Some(entry) = self.in_flight.get(id) {
            let downloadable = Arc::clone(&entry.downloadable);
            drop(entry);
            downloadable.cancel().await;
            return;
        }
        let removed = self.heap.remove_where(|t| t.id == id).await;
        for task in removed {
            self.known_ids.remove(&task.id);
            self.metrics.increment_download_cancelled();
            let error = DownloadError::Queue(QueueError::Cancelled { id: task.id.clone() });
            self.notify(|observer| async move { observer.did_fail(&task.id, &error).await })
                .await;
        }
    }

    async fn handle_event(&self, task_event: TaskEvent) {
        let TaskEvent { task_id, event } = task_event;
        match event {
            DownloadEvent::Begin => {
                self.notify(|observer| async move { observer.did_start(&task_id).await })
                    .await;
            }
            DownloadEvent::StartTransfer => {}
            DownloadEvent::BytesTransferred { transferred, total } => {
                self.notify(|observer| async move {
                    observer.did_transfer_data(&task_id, transferred, total).await
                })
                .await;
            }
            DownloadEvent::FinishTransfer { temp_path } => {
                let mirror_id = self
                    .in_flight
                    .get(&task_id)
                    .map(|task| task.selected_mirror.id.clone())
                    .unwrap_or_default();
                self.notify(|observer| async move {
                    observer
                        .did_finish_transfer(&task_id, &mirror_id, &temp_path)
                        .await;
                    let _ = tokio::fs::remove_file(&temp_path).await;
                })
                .await;
            }
            DownloadEvent::Finish => {
                if let Some((_, task)) = self.in_flight.remove(&task_id) {
                    self.known_ids.remove(&task_id);
                    self.metrics.increment_download_finished();
                    self.policy.download_complete(&task.resource.id).await;
                    self.notify(|observer| async move { observer.did_complete(&task_id).await })
                        .await;
                }
            }
            DownloadEvent::Error(error) => {
                self.handle_error(&task_id, error).await;
            }
        }
    }

    async fn handle_error(&self, task_id: &str, error: DownloadError) {
        let Some((_, task)) = self.in_flight.remove(task_id) else {
            return;
        };
        self.known_ids.remove(task_id);
        self.metrics.increment_download_failed();

        if error.is_cancellation() {
            self.notify(|observer| {
                let error = error.clone();
                async move { observer.did_fail(task_id, &error).await }
            })
            .await;
            return;
        }

        let last_mirror_id = task.selected_mirror.id.clone();
        let mut task = task;
        match self
            .policy
            .next_downloadable(&task.resource, Some(&last_mirror_id), Some(&error))
            .await
        {
            Some(downloadable) => {
                task.selected_mirror = downloadable.mirror().clone();
                task.downloadable = downloadable;
                self.metrics.increment_retries();
                let context = super::RetryContext {
                    previous_mirror_id: last_mirror_id,
                    error: error.clone(),
                };
                self.known_ids.insert(task.id.clone());
                self.notify(|observer| {
                    let task_id = task.id.clone();
                    async move { observer.will_retry(&task_id, &context).await }
                })
                .await;
                self.heap.enqueue(task).await;
            }
            None => {
                self.notify(|observer| {
                    let error = error.clone();
                    async move { observer.did_fail(task_id, &error).await }
                })
                .await;
            }
        }
    }

    /// Consumes heap heads as long as capacity and a compatible processor
    /// exist. If the head has no compatible processor, it stays at the
    /// head (no reordering to avoid starving it forever).
    async fn dispatch(&self, event_tx: &mpsc::UnboundedSender<TaskEvent>) {
        loop {
            if self.current_count() >= self.simultaneous_downloads() {
                break;
            }
            let Some(head) = self.heap.dequeue().await else {
                break;
            };
            let processors = self.processors.lock().await;
            let chosen = processors
                .iter()
                .find(|p| p.can_process(head.downloadable.as_ref()))
                .cloned();
            drop(processors);

            let Some(processor) = chosen else {
                warn!(task_id = %head.id, "no processor available; holding at head");
                self.heap.enqueue(head).await;
                break;
            };

            self.in_flight.insert(head.id.clone(), head.clone());
            self.metrics.increment_download_began();
            let downloadable = Arc::clone(&head.downloadable);
            let task_id = head.id.clone();
            let tx = event_tx.clone();
            tokio::spawn(async move {
                processor
                    .process(downloadable, DownloadEventSender { task_id, tx })
                    .await;
            });
        }
    }
}

async fn forward_events(
    mut event_rx: mpsc::UnboundedReceiver<TaskEvent>,
    cmd_tx: mpsc::UnboundedSender<QueueMsg>,
) {
    while let Some(event) = event_rx.recv().await {
        if cmd_tx.send(QueueMsg::Event(event)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::mock::{MockDownloadable, MockFactory};
    use crate::download::mock::MockProcessor;
    use crate::download::DownloadTask;
    use crate::error::NetworkError;
    use crate::mirror::WeightedMirrorPolicy;
    use crate::model::{Mirror, RequestOptions, Resource};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use tokio::sync::Notify;

    struct RecordingObserver {
        started: StdAtomicUsize,
        completed: StdAtomicUsize,
        failed: StdAtomicUsize,
        retried: StdAtomicUsize,
        done: Notify,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: StdAtomicUsize::new(0),
                completed: StdAtomicUsize::new(0),
                failed: StdAtomicUsize::new(0),
                retried: StdAtomicUsize::new(0),
                done: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl QueueObserver for RecordingObserver {
        async fn did_start(&self, _task_id: &str) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        async fn did_transfer_data(&self, _task_id: &str, _transferred: u64, _total: Option<u64>) {}
        async fn did_finish_transfer(&self, _task_id: &str, _mirror_id: &str, _temp_path: &std::path::Path) {}
        async fn did_complete(&self, _task_id: &str) {
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
        }
        async fn did_fail(&self, _task_id: &str, _error: &DownloadError) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
        }
        async fn will_retry(&self, _task_id: &str, _context: &super::super::RetryContext) {
            self.retried.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make_queue() -> (Arc<DownloadQueue>, Arc<RecordingObserver>) {
        make_queue_with_factory(MockFactory::default())
    }

    fn make_queue_with_factory(factory: MockFactory) -> (Arc<DownloadQueue>, Arc<RecordingObserver>) {
        let policy = Arc::new(WeightedMirrorPolicy::new(3, Arc::new(factory)));
        let metrics = Arc::new(Metrics::new());
        let queue = DownloadQueue::new(policy, metrics, 2);
        let observer = RecordingObserver::new();
        (queue, observer)
    }

    #[tokio::test]
    async fn test_duplicate_admission_is_ignored() {
        let (queue, observer) = make_queue();
        queue.set_observer(Arc::downgrade(&observer) as Weak<dyn QueueObserver>).await;
        queue.register_processor(Arc::new(MockProcessor::default())).await;

        let resource = Resource::new("r1", Mirror::new("m1", "mock://a"));
        let downloadable = MockDownloadable::succeeding("r1", resource.main.clone());
        let task = DownloadTask::new(resource.clone(), RequestOptions::default(), downloadable, 0);
        queue.download(task).await;

        let downloadable2 = MockDownloadable::succeeding("r1", resource.main.clone());
        let task2 = DownloadTask::new(resource, RequestOptions::default(), downloadable2, 1);
        queue.download(task2).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(queue.has_download("r1"));
    }

    #[tokio::test]
    async fn test_successful_download_notifies_completion() {
        let (queue, observer) = make_queue();
        queue.set_observer(Arc::downgrade(&observer) as Weak<dyn QueueObserver>).await;
        queue.register_processor(Arc::new(MockProcessor::default())).await;

        let resource = Resource::new("r1", Mirror::new("m1", "mock://a"));
        let downloadable = MockDownloadable::succeeding("r1", resource.main.clone());
        let task = DownloadTask::new(resource, RequestOptions::default(), downloadable, 0);
        queue.download(task).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), observer.done.notified())
            .await
            .expect("completion notification");
        assert_eq!(observer.completed.load(Ordering::SeqCst), 1);
        assert!(!queue.has_download("r1"));
    }

    #[tokio::test]
    async fn test_failure_without_fallback_mirror_notifies_fail() {
        // The factory rejects every mirror at instantiation, so the policy
        // exhausts immediately and the queue has no retry to offer.
        let (queue, observer) = make_queue_with_factory(MockFactory {
            fail_scheme: Some("mock"),
        });
        queue.set_observer(Arc::downgrade(&observer) as Weak<dyn QueueObserver>).await;
        queue.register_processor(Arc::new(MockProcessor::default())).await;

        let resource = Resource::new("r1", Mirror::new("m1", "mock://a"));
        let downloadable = MockDownloadable::failing(
            "r1",
            resource.main.clone(),
            DownloadError::Network(NetworkError::ConnectionFailed { reason: "down".into() }),
        );
        let task = DownloadTask::new(resource, RequestOptions::default(), downloadable, 0);
        queue.download(task).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), observer.done.notified())
            .await
            .expect("failure notification");
        assert_eq!(observer.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_falls_back_to_alternative_mirror() {
        let (queue, observer) = make_queue();
        queue.set_observer(Arc::downgrade(&observer) as Weak<dyn QueueObserver>).await;
        queue.register_processor(Arc::new(MockProcessor::default())).await;

        let main = Mirror::new("m1", "mock://a").with_weight(10);
        let alt = Mirror::new("m2", "mock://b").with_weight(1);
        let resource = Resource::new("r1", main.clone()).with_alternatives(vec![alt]);
        let downloadable = MockDownloadable::failing(
            "r1",
            main,
            DownloadError::Network(NetworkError::ConnectionFailed { reason: "down".into() }),
        );
        let task = DownloadTask::new(resource, RequestOptions::default(), downloadable, 0);
        queue.download(task).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), observer.done.notified())
            .await
            .expect("eventual completion");
        assert!(observer.retried.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_synthesizes_failure() {
        let (queue, observer) = make_queue();
        queue.set_observer(Arc::downgrade(&observer) as Weak<dyn QueueObserver>).await;
        // No processor registered: task stays queued forever until cancelled.
        let resource = Resource::new("r1", Mirror::new("m1", "mock://a"));
        let downloadable = MockDownloadable::succeeding("r1", resource.main.clone());
        let task = DownloadTask::new(resource, RequestOptions::default(), downloadable, 0);
        queue.download(task).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        queue.cancel("r1").await;
        tokio::time::timeout(std::time::Duration::from_secs(1), observer.done.notified())
            .await
            .expect("cancellation notification");
        assert_eq!(observer.failed.load(Ordering::SeqCst), 1);
        assert!(!queue.has_download("r1"));
    }
}
