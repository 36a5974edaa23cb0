//! Local Cache Manager (component G): persists [`LocalFile`] records in
//! SQLite and keeps the on-disk file in sync with them under a two-tier
//! (`cached`/`permanent`) directory layout.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use directories::ProjectDirs;
use sqlx::SqlitePool;
use tracing::{instrument, warn};

use crate::error::{CacheError, FilesystemError};
use crate::model::{LocalFile, Mirror, Resource, RequestOptions, StoragePriority};

/// Result of checking whether a resource is already cached at (or above)
/// the requested storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Cached at or above the requested storage class; no download needed.
    Hit,
    /// Cached, but at a lower storage class than requested — needs an
    /// in-place storage-class upgrade, not a re-download.
    UpgradeNeeded,
    /// No usable cached file; a download is required.
    Miss,
}

/// Resolves the OS-convention cache and permanent-data directories this
/// engine writes into.
#[derive(Debug, Clone)]
pub struct CacheDirs {
    pub cache_root: PathBuf,
    pub permanent_root: PathBuf,
}

impl CacheDirs {
    /// Resolves platform-convention directories via `directories::ProjectDirs`
    /// (XDG on Linux, Known Folders on Windows, Standard Directories on
    /// macOS).
    pub fn resolve(qualifier: &str, organization: &str, application: &str) -> Result<Self, CacheError> {
        let dirs = ProjectDirs::from(qualifier, organization, application).ok_or_else(|| {
            CacheError::StorageError {
                reason: "could not determine a home directory for this platform".to_string(),
            }
        })?;
        Ok(Self {
            cache_root: dirs.cache_dir().join("assets"),
            permanent_root: dirs.data_dir().join("assets"),
        })
    }

    /// Builds directories rooted at an arbitrary path (tests use a
    /// `tempfile::TempDir`).
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            cache_root: root.join("cached"),
            permanent_root: root.join("permanent"),
        }
    }

    fn root_for(&self, class: StoragePriority) -> &Path {
        match class {
            StoragePriority::Cached => &self.cache_root,
            StoragePriority::Permanent => &self.permanent_root,
        }
    }
}

/// Persists and serves locally-cached resource files.
pub struct CacheManager {
    pool: SqlitePool,
    dirs: CacheDirs,
}

impl CacheManager {
    /// Ensures the backing table and both storage directories exist.
    pub async fn new(pool: SqlitePool, dirs: CacheDirs) -> Result<Self, CacheError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS cached_local_files (
                resource_id      TEXT PRIMARY KEY,
                mirror_id        TEXT NOT NULL,
                local_path       TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                storage_priority TEXT NOT NULL
            )
            ",
        )
        .execute(&pool)
        .await?;

        for dir in [&dirs.cache_root, &dirs.permanent_root] {
            tokio::fs::create_dir_all(dir).await.map_err(|err| {
                let taxonomy = FilesystemError::CannotCreateDirectory {
                    path: dir.display().to_string(),
                };
                CacheError::StorageError {
                    reason: format!("{taxonomy}: {err}"),
                }
            })?;
        }

        Ok(Self { pool, dirs })
    }

    async fn find(&self, resource_id: &str) -> Result<Option<LocalFile>, CacheError> {
        let record = sqlx::query_as::<_, LocalFile>(
            "SELECT resource_id, mirror_id, local_path, created_at, storage_priority \
             FROM cached_local_files WHERE resource_id = ?1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Whether `resource_id` has a cached record whose file still exists
    /// on disk.
    #[instrument(skip(self))]
    pub async fn is_available(&self, resource_id: &str) -> bool {
        match self.find(resource_id).await {
            Ok(Some(record)) => tokio::fs::metadata(&record.local_path).await.is_ok(),
            _ => false,
        }
    }

    /// The on-disk path of a cached file, if present and still readable.
    pub async fn file_url(&self, resource_id: &str) -> Option<PathBuf> {
        let record = self.find(resource_id).await.ok().flatten()?;
        let path = PathBuf::from(&record.local_path);
        tokio::fs::metadata(&path).await.ok()?;
        Some(path)
    }

    /// Classifies whether `resource_id` needs a download, an in-place
    /// storage-class upgrade, or is already satisfied, at the requested
    /// class.
    pub async fn classify(&self, resource_id: &str, requested: StoragePriority) -> CacheLookup {
        let Some(record) = self.find(resource_id).await.ok().flatten() else {
            return CacheLookup::Miss;
        };
        if tokio::fs::metadata(&record.local_path).await.is_err() {
            return CacheLookup::Miss;
        }
        if record.storage_priority() >= requested {
            CacheLookup::Hit
        } else {
            CacheLookup::UpgradeNeeded
        }
    }

    /// Moves a finished download's temp file into the appropriate storage
    /// root and upserts its record. The filesystem move happens before the
    /// database transaction commits; a crash between the two leaves, at
    /// worst, a stale file on disk (cleaned up by [`Self::cleanup`]) while
    /// the record correctly reflects the new path.
    #[instrument(skip(self, temp_path))]
    pub async fn store(
        &self,
        resource: &Resource,
        mirror: &Mirror,
        temp_path: &Path,
        options: RequestOptions,
    ) -> Result<LocalFile, CacheError> {
        let extension = extension_of_location(&mirror.location).unwrap_or_else(|| "bin".to_string());
        let unique: u64 = rand::random();
        let file_name = format!("{}.{unique:x}.{extension}", resource.id);
        let dest = self.dirs.root_for(options.storage_priority).join(&file_name);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        move_file(temp_path, &dest).await?;

        let previous = self.find(&resource.id).await?;
        let now = Utc::now();
        sqlx::query(
            r"
            INSERT INTO cached_local_files (resource_id, mirror_id, local_path, created_at, storage_priority)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(resource_id) DO UPDATE SET
                mirror_id = excluded.mirror_id,
                local_path = excluded.local_path,
                created_at = excluded.created_at,
                storage_priority = excluded.storage_priority
            ",
        )
        .bind(&resource.id)
        .bind(&mirror.id)
        .bind(dest.to_string_lossy().to_string())
        .bind(now.to_rfc3339())
        .bind(options.storage_priority.as_str())
        .execute(&self.pool)
        .await?;

        if let Some(previous) = previous {
            if previous.local_path != dest.to_string_lossy() {
                if let Err(err) = tokio::fs::remove_file(&previous.local_path).await {
                    warn!(path = %previous.local_path, %err, "could not remove superseded cache file");
                }
            }
        }

        Ok(LocalFile::new(
            resource.id.clone(),
            mirror.id.clone(),
            dest.to_string_lossy().to_string(),
            now,
            options.storage_priority,
        ))
    }

    /// Moves already-cached resources to a new storage class in place
    /// (no re-download). Returns the ids actually moved.
    pub async fn update_storage(
        &self,
        resource_ids: &[String],
        new_class: StoragePriority,
    ) -> Result<Vec<String>, CacheError> {
        let mut moved = Vec::new();
        for resource_id in resource_ids {
            let Some(record) = self.find(resource_id).await? else {
                continue;
            };
            if record.storage_priority() == new_class {
                moved.push(resource_id.clone());
                continue;
            }
            let old_path = PathBuf::from(&record.local_path);
            let file_name = old_path
                .file_name()
                .map(|name| name.to_owned())
                .unwrap_or_default();
            let new_path = self.dirs.root_for(new_class).join(file_name);
            if let Some(parent) = new_path.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            move_file(&old_path, &new_path).await?;

            sqlx::query(
                "UPDATE cached_local_files SET local_path = ?1, storage_priority = ?2 WHERE resource_id = ?3",
            )
            .bind(new_path.to_string_lossy().to_string())
            .bind(new_class.as_str())
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
            moved.push(resource_id.clone());
        }
        Ok(moved)
    }

    /// Of the given resource ids, returns the subset that need a
    /// (re-)download: either there is no record, or the record's file is
    /// missing on disk (heals a cache whose file was deleted out-of-band).
    pub async fn downloads_from(&self, resource_ids: &[String]) -> Vec<String> {
        let mut needed = Vec::new();
        for resource_id in resource_ids {
            if !self.is_available(resource_id).await {
                needed.push(resource_id.clone());
            }
        }
        needed
    }

    /// Deletes every `cached`-class file (and its record) not in
    /// `excluding`. `permanent`-class files are never touched.
    pub async fn cleanup(&self, excluding: &HashSet<String>) -> Result<(), CacheError> {
        let records = sqlx::query_as::<_, LocalFile>(
            "SELECT resource_id, mirror_id, local_path, created_at, storage_priority FROM cached_local_files",
        )
        .fetch_all(&self.pool)
        .await?;

        for record in records {
            if record.storage_priority() != StoragePriority::Cached {
                continue;
            }
            if excluding.contains(&record.resource_id) {
                continue;
            }
            tokio::fs::remove_file(&record.local_path).await.ok();
            sqlx::query("DELETE FROM cached_local_files WHERE resource_id = ?1")
                .bind(&record.resource_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Deletes every record and file, regardless of storage class.
    pub async fn reset(&self) -> Result<(), CacheError> {
        let records = sqlx::query_as::<_, LocalFile>(
            "SELECT resource_id, mirror_id, local_path, created_at, storage_priority FROM cached_local_files",
        )
        .fetch_all(&self.pool)
        .await?;
        for record in records {
            tokio::fs::remove_file(&record.local_path).await.ok();
        }
        sqlx::query("DELETE FROM cached_local_files")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Derives a stored-file extension from a mirror location (a URL, or a bare
/// path for non-URL test locations), mirroring `download::web::temp_path_for`.
fn extension_of_location(location: &str) -> Option<String> {
    let path = match url::Url::parse(location) {
        Ok(url) => url.path().to_string(),
        Err(_) => location.to_string(),
    };
    Path::new(&path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_string)
}

async fn move_file(from: &Path, to: &Path) -> Result<(), CacheError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Cross-filesystem rename fails with EXDEV; fall back to copy+remove.
    tokio::fs::copy(from, to).await.map_err(|err| {
        CacheError::StorageError {
            reason: format!(
                "{}: {err}",
                FilesystemError::CannotMove {
                    from: from.display().to_string(),
                    to: to.display().to_string(),
                }
            ),
        }
    })?;
    tokio::fs::remove_file(from).await.ok();
    Ok(())
}
