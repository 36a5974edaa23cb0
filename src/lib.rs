//! A concurrent, mirror-aware resource download engine: schedules transfers
//! across priority tiers, fails over between mirrors on a retry budget, and
//! persists finished downloads in a local two-tier cache.
//!
//! The public entry point is [`manager::ResourceManager`]; it wires together
//! a [`download::DownloadQueue`] per priority tier, a [`mirror::MirrorPolicy`],
//! and a [`cache::CacheManager`].

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod mirror;
pub mod model;
pub mod progress;
pub mod queue;

pub use cache::{CacheDirs, CacheLookup, CacheManager};
pub use config::{CacheConfig, EngineConfig};
pub use download::{
    DownloadEvent, DownloadQueue, DownloadTask, DownloadableKind, Processor, QueueObserver,
    RetryContext, WebDownload, WebDownloadProcessor, WebDownloadableFactory,
};
pub use error::{CacheError, DownloadError, FilesystemError, MirrorError, NetworkError, ProcessorError, QueueError};
pub use manager::{ManagerObserver, PendingRequest, ResourceManager};
pub use metrics::{Metrics, MetricsSnapshot};
pub use mirror::{MirrorPolicy, MirrorPolicyDelegate, WeightedMirrorPolicy};
pub use model::{DownloadPriority, LocalFile, Mirror, RequestOptions, Resource, StoragePriority};
pub use progress::{ProgressMode, ProgressNode};
