//! The one concrete transport this crate ships: plain HTTP(S) via
//! `reqwest`, streaming to a temp file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};

use super::{
    drive_downloadable, DownloadEvent, DownloadEventSender, Downloadable, DownloadableFactory,
    DownloadableKind, Processor,
};
use crate::error::{classify_reqwest_error, DownloadError, NetworkError, ProcessorError};
use crate::model::Mirror;

const USER_AGENT: &str = concat!("download-engine/", env!("CARGO_PKG_VERSION"));

/// A single HTTP(S) transfer. Progress and timestamps are exposed through
/// atomics so readers never block the transfer itself.
pub struct WebDownload {
    resource_id: String,
    mirror: Mirror,
    client: reqwest::Client,
    transferred: AtomicU64,
    total: AtomicU64,
    total_known: AtomicBool,
    cancelled: Arc<AtomicBool>,
    start_date: AsyncMutex<Option<DateTime<Utc>>>,
    finish_date: AsyncMutex<Option<DateTime<Utc>>>,
}

impl WebDownload {
    #[must_use]
    pub fn new(resource_id: impl Into<String>, mirror: Mirror, client: reqwest::Client) -> Self {
        Self {
            resource_id: resource_id.into(),
            mirror,
            client,
            transferred: AtomicU64::new(0),
            total: AtomicU64::new(0),
            total_known: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
            start_date: AsyncMutex::new(None),
            finish_date: AsyncMutex::new(None),
        }
    }
}

#[async_trait]
impl Downloadable for WebDownload {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    fn kind(&self) -> DownloadableKind {
        DownloadableKind::Web
    }

    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    #[instrument(skip(self, events), fields(resource_id = %self.resource_id, mirror_id = %self.mirror.id))]
    async fn start(&self, events: DownloadEventSender) -> Result<PathBuf, DownloadError> {
        *self.start_date.lock().await = Some(Utc::now());

        let response = self
            .client
            .get(&self.mirror.location)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|err| DownloadError::Network(classify_reqwest_error(&err)))?;

        let status = response.status();
        if !status.is_success() {
            if let Some(retry_after) = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| httpdate::parse_http_date(value).ok())
            {
                debug!(?retry_after, "server requested Retry-After delay");
            }
            return Err(DownloadError::Network(NetworkError::ServerError {
                code: status.as_u16(),
                reason: status
                    .canonical_reason()
                    .unwrap_or("unknown status")
                    .to_string(),
            }));
        }

        if let Some(len) = response.content_length() {
            self.total.store(len, Ordering::SeqCst);
            self.total_known.store(true, Ordering::SeqCst);
        }

        let temp_path = temp_path_for(&self.resource_id, &self.mirror.location);
        let mut file = tokio::fs::File::create(&temp_path).await.map_err(|err| {
            DownloadError::Processor(ProcessorError::DownloadFailed {
                reason: format!("cannot create temp file '{}': {err}", temp_path.display()),
            })
        })?;

        let mut stream = response.bytes_stream();
        let mut started_transfer = false;
        while let Some(chunk) = stream.next().await {
            if self.cancelled.load(Ordering::SeqCst) {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(DownloadError::Network(NetworkError::Cancelled));
            }
            let chunk = chunk.map_err(|err| DownloadError::Network(classify_reqwest_error(&err)))?;
            if !started_transfer {
                started_transfer = true;
                events.send(DownloadEvent::StartTransfer);
            }
            file.write_all(&chunk).await.map_err(|err| {
                DownloadError::Processor(ProcessorError::DownloadFailed {
                    reason: format!("write failed: {err}"),
                })
            })?;
            let transferred = self
                .transferred
                .fetch_add(chunk.len() as u64, Ordering::SeqCst)
                + chunk.len() as u64;
            let total = self
                .total_known
                .load(Ordering::SeqCst)
                .then(|| self.total.load(Ordering::SeqCst));
            events.send(DownloadEvent::BytesTransferred { transferred, total });
        }
        file.flush().await.ok();

        *self.finish_date.lock().await = Some(Utc::now());
        Ok(temp_path)
    }

    async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn total_size(&self) -> Option<u64> {
        self.total_known
            .load(Ordering::SeqCst)
            .then(|| self.total.load(Ordering::SeqCst))
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date.try_lock().ok().and_then(|guard| *guard)
    }

    fn finish_date(&self) -> Option<DateTime<Utc>> {
        self.finish_date.try_lock().ok().and_then(|guard| *guard)
    }
}

fn temp_path_for(resource_id: &str, location: &str) -> PathBuf {
    let extension = Path::new(location)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("part");
    let unique: u64 = rand::random();
    std::env::temp_dir().join(format!("{resource_id}-{unique:x}.{extension}"))
}

/// Builds [`WebDownload`]s for `http`/`https` mirror locations, rejecting
/// everything else at instantiation time.
pub struct WebDownloadableFactory {
    client: reqwest::Client,
}

impl WebDownloadableFactory {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for WebDownloadableFactory {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl DownloadableFactory for WebDownloadableFactory {
    fn create(
        &self,
        resource_id: &str,
        mirror: &Mirror,
    ) -> Result<Arc<dyn Downloadable>, DownloadError> {
        let parsed = url::Url::parse(&mirror.location).map_err(|err| {
            DownloadError::Processor(ProcessorError::CannotProcess {
                reason: format!("'{}' is not a valid URL: {err}", mirror.location),
            })
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::Processor(ProcessorError::CannotProcess {
                reason: format!(
                    "unsupported scheme '{}': the web transport only supports http/https",
                    parsed.scheme()
                ),
            }));
        }
        Ok(Arc::new(WebDownload::new(
            resource_id,
            mirror.clone(),
            self.client.clone(),
        )))
    }
}

/// Drives [`WebDownload`]s. Holds no state across process restarts, so
/// [`Processor::enqueue_pending`] is a no-op.
pub struct WebDownloadProcessor {
    active: AtomicBool,
}

impl WebDownloadProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }
}

impl Default for WebDownloadProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for WebDownloadProcessor {
    fn name(&self) -> &str {
        "web"
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
        matches!(kind, DownloadableKind::Web)
    }

    async fn process(&self, downloadable: Arc<dyn Downloadable>, events: DownloadEventSender) {
        if !self.is_active() {
            warn!("process() called on inactive web processor");
            events.send(DownloadEvent::Error(DownloadError::Processor(
                ProcessorError::Inactive,
            )));
            return;
        }
        drive_downloadable(downloadable, events).await;
    }

    async fn enqueue_pending(&self, _events: DownloadEventSender) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadableKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_factory_rejects_unsupported_scheme() {
        let factory = WebDownloadableFactory::default();
        let mirror = Mirror::new("m1", "ftp://example.com/a");
        let result = factory.create("r1", &mirror);
        assert!(result.is_err());
    }

    #[test]
    fn test_factory_accepts_https() {
        let factory = WebDownloadableFactory::default();
        let mirror = Mirror::new("m1", "https://example.com/a");
        let downloadable = factory.create("r1", &mirror).unwrap();
        assert_eq!(downloadable.kind(), DownloadableKind::Web);
    }

    #[tokio::test]
    async fn test_successful_download_writes_temp_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 1024]))
            .mount(&server)
            .await;

        let factory = WebDownloadableFactory::default();
        let mirror = Mirror::new("m1", format!("{}/file.bin", server.uri()));
        let downloadable = factory.create("r1", &mirror).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sender = DownloadEventSender {
            task_id: "r1".into(),
            tx,
        };
        let path = downloadable.start(sender).await.unwrap();
        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes.len(), 1024);
        tokio::fs::remove_file(&path).await.ok();

        let mut saw_start = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.event, DownloadEvent::StartTransfer) {
                saw_start = true;
            }
        }
        assert!(saw_start);
    }

    #[tokio::test]
    async fn test_server_error_maps_to_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let factory = WebDownloadableFactory::default();
        let mirror = Mirror::new("m1", format!("{}/missing", server.uri()));
        let downloadable = factory.create("r1", &mirror).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sender = DownloadEventSender {
            task_id: "r1".into(),
            tx,
        };
        let err = downloadable.start(sender).await.unwrap_err();
        match err {
            DownloadError::Network(NetworkError::ServerError { code, .. }) => assert_eq!(code, 503),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_transfer() {
        let downloadable = WebDownload::new(
            "r1",
            Mirror::new("m1", "https://example.com/never"),
            reqwest::Client::new(),
        );
        downloadable.cancel().await;
        assert!(downloadable.cancelled.load(Ordering::SeqCst));
    }
}
