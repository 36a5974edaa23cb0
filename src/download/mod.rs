//! Download Processor and Download Queue (components D and E): the
//! transport abstraction, its lifecycle events, and the per-task record the
//! Queue schedules.

pub mod queue;
pub mod web;

#[cfg(test)]
pub(crate) mod mock;

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DownloadError;
use crate::model::{Mirror, RequestOptions, Resource};

pub use queue::{DownloadQueue, QueueObserver};
pub use web::{WebDownload, WebDownloadProcessor, WebDownloadableFactory};

/// Tags a [`Downloadable`]'s concrete transport so processors can filter
/// without downcasting (the corpus's "tagged union" idiom for plugin
/// dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadableKind {
    Web,
    #[cfg(test)]
    Mock,
}

/// A lifecycle event emitted while a [`Downloadable`] is driven by a
/// [`Processor`]. Always observed in the order: `Begin`, `StartTransfer`,
/// zero or more `BytesTransferred`, then exactly one of `FinishTransfer`
/// followed by `Finish`, or `Error`.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Begin,
    StartTransfer,
    BytesTransferred {
        transferred: u64,
        total: Option<u64>,
    },
    FinishTransfer {
        temp_path: PathBuf,
    },
    Finish,
    Error(DownloadError),
}

/// Context describing why a task is being retried against a new (or the
/// same) mirror.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub previous_mirror_id: String,
    pub error: DownloadError,
}

#[derive(Clone)]
pub(crate) struct TaskEvent {
    pub task_id: String,
    pub event: DownloadEvent,
}

/// A per-task handle for sending lifecycle events up to the owning Download
/// Queue. Cloned cheaply; closed receivers are tolerated silently.
#[derive(Clone)]
pub struct DownloadEventSender {
    pub(crate) task_id: String,
    pub(crate) tx: tokio::sync::mpsc::UnboundedSender<TaskEvent>,
}

impl DownloadEventSender {
    pub fn send(&self, event: DownloadEvent) {
        let _ = self.tx.send(TaskEvent {
            task_id: self.task_id.clone(),
            event,
        });
    }
}

/// A polymorphic handle to one in-progress or prospective transfer.
///
/// Owned exclusively by its [`DownloadTask`] for the task's lifetime; a
/// [`Processor`] is only ever handed a shared (`Arc`) reference while
/// driving it and must not outlive that call.
#[async_trait]
pub trait Downloadable: Send + Sync {
    /// The owning resource's id (for logging and cache keying).
    fn resource_id(&self) -> &str;

    /// The transport tag used for processor dispatch.
    fn kind(&self) -> DownloadableKind;

    /// The mirror this instance was created against.
    fn mirror(&self) -> &Mirror;

    /// Drives the transfer to completion, emitting `StartTransfer` and
    /// `BytesTransferred` on `events` as bytes arrive. On success, returns
    /// the path of the fully-written temporary file.
    async fn start(&self, events: DownloadEventSender) -> Result<PathBuf, DownloadError>;

    /// Requests cancellation. The transport must stop as soon as
    /// practical and have `start` return a cancellation error.
    async fn cancel(&self);

    /// Requests a pause. This engine does not support resuming a partial
    /// transfer from an offset (non-goal), so the default behavior is
    /// equivalent to cancellation.
    async fn pause(&self) {
        self.cancel().await;
    }

    fn total_size(&self) -> Option<u64>;
    fn transferred_bytes(&self) -> u64;
    fn start_date(&self) -> Option<DateTime<Utc>>;
    fn finish_date(&self) -> Option<DateTime<Utc>>;
}

impl fmt::Debug for dyn Downloadable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloadable")
            .field("resource_id", &self.resource_id())
            .field("kind", &self.kind())
            .field("mirror_id", &self.mirror().id)
            .finish()
    }
}

/// Instantiates a [`Downloadable`] for a chosen mirror. Returns an error
/// when the mirror's location is not a scheme this transport supports.
pub trait DownloadableFactory: Send + Sync {
    fn create(
        &self,
        resource_id: &str,
        mirror: &Mirror,
    ) -> Result<Arc<dyn Downloadable>, DownloadError>;
}

/// A pluggable transport driver: the only concrete implementation shipped
/// is [`WebDownloadProcessor`]; more transports register as additional
/// `Processor`s without touching the Queue.
#[async_trait]
pub trait Processor: Send + Sync {
    /// A human-readable name for logs and error messages.
    fn name(&self) -> &str;

    /// Whether this processor is currently accepting work.
    fn is_active(&self) -> bool;

    /// Stops accepting new work; in-flight transfers are unaffected.
    fn pause(&self);

    /// Resumes accepting new work.
    fn resume(&self);

    /// Whether this processor's transport can drive the given kind.
    fn supports(&self, kind: DownloadableKind) -> bool;

    /// Whether this processor can currently accept `downloadable`
    /// (active and transport-compatible).
    fn can_process(&self, downloadable: &dyn Downloadable) -> bool {
        self.is_active() && self.supports(downloadable.kind())
    }

    /// Drives `downloadable` to completion, emitting lifecycle events on
    /// `events`. Never returns an `Err` itself; failures are reported as a
    /// terminal `DownloadEvent::Error`.
    async fn process(&self, downloadable: Arc<dyn Downloadable>, events: DownloadEventSender);

    /// Replays any transport-level state left over from a previous process
    /// lifetime (e.g. partially-initialized transfers). The web transport
    /// keeps no such state, so its implementation is a no-op.
    async fn enqueue_pending(&self, events: DownloadEventSender);
}

/// Orchestrates `Begin` -> `start()` -> (`FinishTransfer`+`Finish` |
/// `Error`) for any [`Downloadable`], shared by every concrete processor.
pub(crate) async fn drive_downloadable(
    downloadable: Arc<dyn Downloadable>,
    events: DownloadEventSender,
) {
    events.send(DownloadEvent::Begin);
    match downloadable.start(events.clone()).await {
        Ok(temp_path) => {
            events.send(DownloadEvent::FinishTransfer { temp_path });
            events.send(DownloadEvent::Finish);
        }
        Err(error) => {
            events.send(DownloadEvent::Error(error));
        }
    }
}

/// The Queue's scheduling record: a resource, the options it was requested
/// with, the mirror currently selected for it, and a live handle to the
/// transfer.
pub struct DownloadTask {
    pub id: String,
    pub resource: Resource,
    pub options: RequestOptions,
    pub selected_mirror: Mirror,
    pub downloadable: Arc<dyn Downloadable>,
    pub priority: i64,
    pub(crate) seq: u64,
}

impl DownloadTask {
    #[must_use]
    pub fn new(
        resource: Resource,
        options: RequestOptions,
        downloadable: Arc<dyn Downloadable>,
        seq: u64,
    ) -> Self {
        let selected_mirror = downloadable.mirror().clone();
        let priority = options.download_priority.weight();
        Self {
            id: resource.id.clone(),
            resource,
            options,
            selected_mirror,
            downloadable,
            priority,
            seq,
        }
    }
}

impl Clone for DownloadTask {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            resource: self.resource.clone(),
            options: self.options,
            selected_mirror: self.selected_mirror.clone(),
            downloadable: Arc::clone(&self.downloadable),
            priority: self.priority,
            seq: self.seq,
        }
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("mirror_id", &self.selected_mirror.id)
            .finish()
    }
}

impl PartialEq for DownloadTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DownloadTask {}

impl PartialOrd for DownloadTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DownloadTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; among equal priorities, older (smaller seq)
        // wins so same-tier admissions stay FIFO.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
