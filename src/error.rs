//! Structured error taxonomy for the download engine.
//!
//! Every variant carries a human-readable message and a `Suggestion:` line,
//! following the What/Why/Fix pattern used across this codebase.

use thiserror::Error;

/// Top-level error union for the download engine.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Download Queue level failure.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Processor level failure.
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    /// Local cache manager failure.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Transport/network failure.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// Filesystem failure during storage.
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    /// Mirror selection failure.
    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

impl DownloadError {
    /// Returns true if this error is a terminal cancellation (queue- or
    /// transport-level), which the Queue never retries.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Queue(QueueError::Cancelled { .. }) | Self::Network(NetworkError::Cancelled)
        )
    }
}

/// Errors surfaced by the Download Queue.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// No registered, active processor can accept this downloadable.
    #[error(
        "no processor available for download '{id}'\n  Suggestion: register a processor that supports this downloadable's transport"
    )]
    NoProcessorAvailable {
        /// The task id that could not be dispatched.
        id: String,
    },

    /// The queue is not accepting new admissions.
    #[error("queue is inactive\n  Suggestion: call resume() before admitting downloads")]
    Inactive,

    /// The download was cancelled by the caller.
    #[error(
        "download '{id}' was cancelled\n  Suggestion: re-request the resource if it is still needed"
    )]
    Cancelled {
        /// The id of the cancelled task.
        id: String,
    },
}

/// Errors surfaced by a Download Processor.
#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    /// The processor cannot drive this downloadable's concrete transport.
    #[error(
        "processor cannot process this downloadable: {reason}\n  Suggestion: register a processor that supports this transport"
    )]
    CannotProcess {
        /// Why the processor declined the downloadable.
        reason: String,
    },

    /// The processor is paused.
    #[error(
        "processor is inactive\n  Suggestion: call resume() on the processor before dispatching work"
    )]
    Inactive,

    /// The download failed for a reason not covered by a more specific kind.
    #[error(
        "download failed: {reason}\n  Suggestion: check the mirror location and network connectivity"
    )]
    DownloadFailed {
        /// Unclassified failure reason.
        reason: String,
    },
}

/// Errors surfaced by the Local Cache Manager.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The persisted record's file is missing on disk.
    #[error("cached file not found at '{path}'\n  Suggestion: re-download the resource")]
    FileNotFound {
        /// The missing path.
        path: String,
    },

    /// A file already exists at the computed destination path.
    #[error(
        "a file already exists at '{path}'\n  Suggestion: remove or rename the existing file"
    )]
    FileAlreadyExists {
        /// The conflicting path.
        path: String,
    },

    /// The cache directory tree denied the requested operation.
    #[error(
        "permission denied during {op}\n  Suggestion: check filesystem permissions for the cache directory"
    )]
    PermissionDenied {
        /// The operation that was denied (e.g. "store", "cleanup").
        op: String,
    },

    /// Any other persistence/storage failure (database or filesystem).
    #[error(
        "storage error: {reason}\n  Suggestion: check available disk space and directory permissions"
    )]
    StorageError {
        /// Underlying failure description.
        reason: String,
    },
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageError {
            reason: err.to_string(),
        }
    }
}

/// Errors surfaced by the network transport.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    /// The connection to the mirror could not be established.
    #[error("connection failed: {reason}\n  Suggestion: verify the mirror host is reachable")]
    ConnectionFailed {
        /// Underlying failure description.
        reason: String,
    },

    /// The operation exceeded its deadline.
    #[error("operation timed out: {op}\n  Suggestion: retry or increase the configured timeout")]
    Timeout {
        /// The operation that timed out (e.g. "connect", "read").
        op: String,
    },

    /// The transport reported a user- or queue-initiated cancellation.
    #[error("download was cancelled\n  Suggestion: re-request the resource if it is still needed")]
    Cancelled,

    /// The remote server returned an HTTP error status.
    #[error("server returned {code}: {reason}\n  Suggestion: {}", retry_hint(*code))]
    ServerError {
        /// HTTP status code.
        code: u16,
        /// Server-provided or synthesized reason phrase.
        reason: String,
    },

    /// No network path to any mirror is currently available.
    #[error("no network connection available\n  Suggestion: check connectivity and retry")]
    NoConnection,
}

impl NetworkError {
    /// Returns true for HTTP status codes this engine treats as transient.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ConnectionFailed { .. } | Self::NoConnection => true,
            Self::ServerError { code, .. } => is_retriable_status(*code),
            Self::Cancelled => false,
        }
    }
}

/// Default retriable HTTP status codes (§9 Open Questions resolution).
#[must_use]
pub fn is_retriable_status(code: u16) -> bool {
    matches!(code, 408 | 429 | 500 | 502 | 503 | 504)
}

fn retry_hint(code: u16) -> &'static str {
    if is_retriable_status(code) {
        "this is transient; the mirror policy will retry or fail over"
    } else {
        "this mirror will not be retried for this status"
    }
}

/// Errors surfaced during filesystem operations backing storage moves.
#[derive(Debug, Clone, Error)]
pub enum FilesystemError {
    /// A required directory could not be created.
    #[error("cannot create directory '{path}'\n  Suggestion: check parent directory permissions")]
    CannotCreateDirectory {
        /// The directory path that failed to be created.
        path: String,
    },

    /// A file move (rename or copy+remove) failed.
    #[error(
        "cannot move file from '{from}' to '{to}'\n  Suggestion: check that the destination directory exists and is writable"
    )]
    CannotMove {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
    },

    /// The destination filesystem has no room for the file.
    #[error("insufficient disk space\n  Suggestion: free up space and retry")]
    InsufficientSpace,
}

/// Errors surfaced by the Mirror Policy.
#[derive(Debug, Clone, Error)]
pub enum MirrorError {
    /// The resource has no mirrors at all.
    #[error("resource '{resource_id}' has no mirrors\n  Suggestion: add at least one mirror to the resource")]
    NoMirrors {
        /// The resource id with no mirrors.
        resource_id: String,
    },

    /// Every mirror has exhausted its retry budget.
    #[error(
        "all mirrors exhausted for resource '{resource_id}'\n  Suggestion: add additional mirrors or raise the retry budget"
    )]
    AllExhausted {
        /// The resource id whose mirrors are all exhausted.
        resource_id: String,
    },
}

/// Maps a raw I/O error into the filesystem error taxonomy.
#[must_use]
pub fn classify_io_error(err: &std::io::Error, from: &str, to: &str) -> FilesystemError {
    match err.kind() {
        std::io::ErrorKind::StorageFull => FilesystemError::InsufficientSpace,
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            FilesystemError::CannotMove {
                from: from.to_string(),
                to: to.to_string(),
            }
        }
        _ => FilesystemError::CannotMove {
            from: from.to_string(),
            to: to.to_string(),
        },
    }
}

/// Maps a `reqwest` transport error into the network error taxonomy.
#[must_use]
pub fn classify_reqwest_error(err: &reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        return NetworkError::Timeout {
            op: "request".to_string(),
        };
    }
    if err.is_connect() {
        return NetworkError::ConnectionFailed {
            reason: err.to_string(),
        };
    }
    if let Some(status) = err.status() {
        return NetworkError::ServerError {
            code: status.as_u16(),
            reason: status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string(),
        };
    }
    NetworkError::ConnectionFailed {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_status_codes() {
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(is_retriable_status(code), "{code} should be retriable");
        }
        for code in [400, 401, 403, 404, 410] {
            assert!(!is_retriable_status(code), "{code} should not be retriable");
        }
    }

    #[test]
    fn test_network_error_is_retriable() {
        assert!(NetworkError::Timeout { op: "connect".into() }.is_retriable());
        assert!(
            NetworkError::ServerError {
                code: 503,
                reason: "unavailable".into()
            }
            .is_retriable()
        );
        assert!(
            !NetworkError::ServerError {
                code: 404,
                reason: "not found".into()
            }
            .is_retriable()
        );
        assert!(!NetworkError::Cancelled.is_retriable());
    }

    #[test]
    fn test_download_error_is_cancellation() {
        let cancelled = DownloadError::Network(NetworkError::Cancelled);
        assert!(cancelled.is_cancellation());
        let queue_cancelled = DownloadError::Queue(QueueError::Cancelled { id: "r1".into() });
        assert!(queue_cancelled.is_cancellation());
        let other = DownloadError::Mirror(MirrorError::AllExhausted {
            resource_id: "r1".into(),
        });
        assert!(!other.is_cancellation());
    }

    #[test]
    fn test_error_messages_contain_suggestion() {
        let err = CacheError::FileNotFound {
            path: "/tmp/x".into(),
        };
        assert!(err.to_string().contains("Suggestion:"));
    }
}
