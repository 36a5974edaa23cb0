//! In-crate test doubles for `Downloadable`/`Processor`/`DownloadableFactory`,
//! used across the queue, mirror, and manager test modules.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    drive_downloadable, DownloadEventSender, Downloadable, DownloadableFactory, DownloadableKind,
    Processor,
};
use crate::error::{DownloadError, NetworkError};
use crate::model::Mirror;

/// A scripted downloadable: either succeeds immediately with a fake temp
/// path, or fails with a configured error.
pub(crate) struct MockDownloadable {
    resource_id: String,
    mirror: Mirror,
    outcome: Mutex<Option<Result<PathBuf, DownloadError>>>,
    cancelled: Arc<AtomicBool>,
}

impl MockDownloadable {
    pub(crate) fn succeeding(resource_id: impl Into<String>, mirror: Mirror) -> Arc<Self> {
        let path = std::env::temp_dir().join(format!("mock-{}.bin", rand::random::<u64>()));
        std::fs::write(&path, b"mock download contents").expect("write mock temp file");
        Arc::new(Self {
            resource_id: resource_id.into(),
            mirror,
            outcome: Mutex::new(Some(Ok(path))),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn failing(
        resource_id: impl Into<String>,
        mirror: Mirror,
        error: DownloadError,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource_id: resource_id.into(),
            mirror,
            outcome: Mutex::new(Some(Err(error))),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl Downloadable for MockDownloadable {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    fn kind(&self) -> DownloadableKind {
        DownloadableKind::Mock
    }

    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    async fn start(&self, events: DownloadEventSender) -> Result<PathBuf, DownloadError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(DownloadError::Network(NetworkError::Cancelled));
        }
        events.send(super::DownloadEvent::StartTransfer);
        let mut guard = self.outcome.lock().await;
        guard
            .take()
            .unwrap_or(Err(DownloadError::Network(NetworkError::Cancelled)))
    }

    async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut guard = self.outcome.lock().await;
        *guard = Some(Err(DownloadError::Network(NetworkError::Cancelled)));
    }

    fn total_size(&self) -> Option<u64> {
        Some(0)
    }

    fn transferred_bytes(&self) -> u64 {
        0
    }

    fn start_date(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn finish_date(&self) -> Option<DateTime<Utc>> {
        None
    }
}

pub(crate) struct MockFactory {
    pub(crate) fail_scheme: Option<&'static str>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self { fail_scheme: None }
    }
}

impl DownloadableFactory for MockFactory {
    fn create(
        &self,
        resource_id: &str,
        mirror: &Mirror,
    ) -> Result<Arc<dyn Downloadable>, DownloadError> {
        if let Some(scheme) = self.fail_scheme {
            if mirror.location.starts_with(scheme) {
                return Err(DownloadError::Processor(
                    crate::error::ProcessorError::CannotProcess {
                        reason: "mock factory configured to reject this scheme".to_string(),
                    },
                ));
            }
        }
        Ok(MockDownloadable::succeeding(resource_id, mirror.clone()))
    }
}

pub(crate) struct MockProcessor {
    active: AtomicBool,
}

impl Default for MockProcessor {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Processor for MockProcessor {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    fn supports(&self, kind: DownloadableKind) -> bool {
        matches!(kind, DownloadableKind::Mock)
    }

    async fn process(&self, downloadable: Arc<dyn Downloadable>, events: DownloadEventSender) {
        drive_downloadable(downloadable, events).await;
    }

    async fn enqueue_pending(&self, _events: DownloadEventSender) {}
}
