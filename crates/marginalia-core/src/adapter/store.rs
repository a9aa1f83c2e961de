//! Filesystem-backed adapter persistence
//!
//! Layout under the store root:
//!
//! ```text
//! user-<id>/
//!     CURRENT             # "<version>\n", replaced atomically
//!     v000001/            # immutable bundle directories
//!     v000002/
//! ```
//!
//! A save builds the bundle in a staging directory, renames it to the next
//! version, and only then swaps `CURRENT`. Readers resolve `CURRENT` first, so
//! they see either the previous complete bundle or the new one.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bundle::{AdapterBundle, ADAPTER_CONFIG_FILE};
use crate::config::AdapterConfig;
use crate::model::{AdaptedModel, NoteModel};
use crate::{CoreError, Result, UserId};

const CURRENT_FILE: &str = "CURRENT";
const USER_DIR_PREFIX: &str = "user-";

/// Result of a successful save
#[derive(Debug, Clone)]
pub struct SavedAdapter {
    pub user_id: UserId,
    pub version: u64,
    pub path: PathBuf,
    pub bundle: Arc<AdapterBundle>,
}

/// Persists, discovers and loads per-user adapters
pub struct AdapterStore {
    root: PathBuf,
    keep_versions: usize,
    max_storage_retries: u32,
    cache: Mutex<LruCache<UserId, Arc<AdapterBundle>>>,
}

impl AdapterStore {
    /// Create a store rooted at `config.root_dir`; the directory is created lazily
    pub fn new(config: &AdapterConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            root: config.root_dir.clone(),
            keep_versions: config.keep_versions.max(1),
            max_storage_retries: config.max_storage_retries,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Store with default settings at `root`
    pub fn at<P: Into<PathBuf>>(root: P) -> Self {
        Self::new(&AdapterConfig {
            root_dir: root.into(),
            ..AdapterConfig::default()
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic directory for a user's adapters
    pub fn path_for(&self, user_id: UserId) -> PathBuf {
        self.root.join(format!("{}{}", USER_DIR_PREFIX, user_id))
    }

    fn version_dir(&self, user_id: UserId, version: u64) -> PathBuf {
        self.path_for(user_id).join(format!("v{:06}", version))
    }

    /// Version named by the user's `CURRENT` pointer, if it resolves to a bundle
    pub fn current_version(&self, user_id: UserId) -> Result<Option<u64>> {
        let pointer = self.path_for(user_id).join(CURRENT_FILE);
        let content = match std::fs::read_to_string(&pointer) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CoreError::storage(
                    "ADAPTER_POINTER_READ_FAILED",
                    "Failed to read adapter pointer",
                    pointer,
                    e,
                ))
            }
        };

        let version: u64 = content.trim().parse().map_err(|_| {
            CoreError::corrupt(
                "ADAPTER_POINTER_INVALID",
                format!("Adapter pointer holds '{}'", content.trim()),
                &pointer,
            )
        })?;

        if !self.version_dir(user_id, version).join(ADAPTER_CONFIG_FILE).is_file() {
            warn!("Adapter pointer for user {} names missing version {}", user_id, version);
            return Ok(None);
        }
        Ok(Some(version))
    }

    /// Whether a complete adapter bundle is stored for the user.
    ///
    /// An unreadable or corrupt pointer is an error here as it is for `load`.
    pub fn exists(&self, user_id: UserId) -> Result<bool> {
        Ok(self.current_version(user_id)?.is_some())
    }

    /// Load the user's current bundle, or `None` when the user has none
    pub fn try_load_bundle(&self, user_id: UserId) -> Result<Option<Arc<AdapterBundle>>> {
        let version = match self.current_version(user_id)? {
            Some(version) => version,
            None => return Ok(None),
        };

        if let Some(cached) = self.cache.lock().get(&user_id) {
            if cached.version() == version {
                return Ok(Some(Arc::clone(cached)));
            }
        }

        let dir = self.version_dir(user_id, version);
        let bundle = AdapterBundle::read_from(&dir)?;
        if bundle.user_id() != user_id {
            return Err(CoreError::corrupt(
                "ADAPTER_OWNER_MISMATCH",
                format!("Bundle belongs to user {}, stored under user {}", bundle.user_id(), user_id),
                dir,
            ));
        }

        let bundle = Arc::new(bundle);
        self.cache.lock().put(user_id, Arc::clone(&bundle));
        debug!("Loaded adapter v{} for user {}", version, user_id);
        Ok(Some(bundle))
    }

    /// Load the user's current bundle, failing with `AdapterNotFound` when absent
    pub fn load_bundle(&self, user_id: UserId) -> Result<Arc<AdapterBundle>> {
        self.try_load_bundle(user_id)?
            .ok_or_else(|| CoreError::adapter_not_found(user_id, self.path_for(user_id)))
    }

    /// Overlay the user's adapter on `base`, or `None` to signal base-model fallback
    pub fn try_load(&self, user_id: UserId, base: Arc<NoteModel>) -> Result<Option<AdaptedModel>> {
        match self.try_load_bundle(user_id)? {
            Some(bundle) => Ok(Some(AdaptedModel::new(base, bundle, user_id)?)),
            None => Ok(None),
        }
    }

    /// Overlay the user's adapter on `base`, failing with `AdapterNotFound` when absent
    pub fn load(&self, user_id: UserId, base: Arc<NoteModel>) -> Result<AdaptedModel> {
        let bundle = self.load_bundle(user_id)?;
        AdaptedModel::new(base, bundle, user_id)
    }

    /// Persist `bundle` as the user's next version and make it current
    pub fn save(&self, user_id: UserId, mut bundle: AdapterBundle) -> Result<SavedAdapter> {
        if bundle.user_id() != user_id {
            return Err(CoreError::invalid_named(
                "ADAPTER_OWNER_MISMATCH",
                "user_id",
                format!("Bundle was trained for user {}, not user {}", bundle.user_id(), user_id),
                "Save adapters only under the user they were trained for",
            ));
        }

        let user_dir = self.path_for(user_id);
        std::fs::create_dir_all(&user_dir).map_err(|e| {
            CoreError::storage("ADAPTER_DIR_CREATE_FAILED", "Failed to create adapter directory", &user_dir, e)
        })?;

        let existing = self.versions(user_id)?;
        let version = existing.last().copied().unwrap_or(0) + 1;
        bundle.set_version(version);

        let staging = user_dir.join(format!(".staging-{}", Uuid::new_v4()));
        std::fs::create_dir(&staging).map_err(|e| {
            CoreError::storage("ADAPTER_STAGING_FAILED", "Failed to create staging directory", &staging, e)
        })?;

        if let Err(e) = bundle.write_to(&staging) {
            remove_quietly(&staging);
            return Err(e);
        }

        let target = self.version_dir(user_id, version);
        if let Err(e) = std::fs::rename(&staging, &target) {
            remove_quietly(&staging);
            return Err(CoreError::storage(
                "ADAPTER_PUBLISH_FAILED",
                "Failed to move adapter into place",
                &target,
                e,
            ));
        }

        self.write_pointer(&user_dir, version)?;

        let bundle = Arc::new(bundle);
        self.cache.lock().put(user_id, Arc::clone(&bundle));
        info!("Saved adapter v{} for user {} at {}", version, user_id, target.display());

        self.prune(user_id, version);

        Ok(SavedAdapter {
            user_id,
            version,
            path: target,
            bundle,
        })
    }

    /// Versions on disk for the user, ascending
    pub fn versions(&self, user_id: UserId) -> Result<Vec<u64>> {
        let user_dir = self.path_for(user_id);
        let entries = match std::fs::read_dir(&user_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CoreError::storage(
                    "ADAPTER_LIST_FAILED",
                    "Failed to list adapter versions",
                    user_dir,
                    e,
                ))
            }
        };

        let mut versions: Vec<u64> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_str()?.strip_prefix('v')?.parse().ok()
            })
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Users with a current adapter
    pub fn list_users(&self) -> Result<Vec<UserId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CoreError::storage(
                    "ADAPTER_LIST_FAILED",
                    "Failed to list adapter root",
                    &self.root,
                    e,
                ))
            }
        };

        let mut users: Vec<UserId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_str()?.strip_prefix(USER_DIR_PREFIX)?.parse().ok()
            })
            .filter(|&user| match self.exists(user) {
                Ok(exists) => exists,
                Err(e) => {
                    warn!("Skipping user {} with unreadable adapter: {}", user, e);
                    false
                }
            })
            .collect();
        users.sort_unstable();
        Ok(users)
    }

    /// On-disk size of the user's current bundle
    pub fn bundle_size_bytes(&self, user_id: UserId) -> Result<u64> {
        let version = self
            .current_version(user_id)?
            .ok_or_else(|| CoreError::adapter_not_found(user_id, self.path_for(user_id)))?;
        let dir = self.version_dir(user_id, version);

        let entries = std::fs::read_dir(&dir)
            .map_err(|e| CoreError::storage("ADAPTER_SIZE_FAILED", "Failed to read adapter bundle", &dir, e))?;
        let mut total = 0u64;
        for entry in entries {
            let metadata = entry
                .and_then(|e| e.metadata())
                .map_err(|e| CoreError::storage("ADAPTER_SIZE_FAILED", "Failed to stat adapter file", &dir, e))?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    /// Run `op`, retrying retryable storage failures a bounded number of times
    pub fn with_storage_retry<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            match op() {
                Err(e) if e.is_retryable() && attempt < self.max_storage_retries => {
                    attempt += 1;
                    warn!("Storage operation failed (attempt {}): {}", attempt, e);
                    std::thread::sleep(Duration::from_millis(25 * u64::from(attempt)));
                }
                result => return result,
            }
        }
    }

    fn write_pointer(&self, user_dir: &Path, version: u64) -> Result<()> {
        let tmp = user_dir.join(format!(".{}-{}", CURRENT_FILE, Uuid::new_v4()));
        let pointer = user_dir.join(CURRENT_FILE);

        let written = std::fs::write(&tmp, format!("{}\n", version))
            .and_then(|_| std::fs::File::open(&tmp)?.sync_all())
            .and_then(|_| std::fs::rename(&tmp, &pointer));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(CoreError::storage(
                "ADAPTER_POINTER_WRITE_FAILED",
                "Failed to update adapter pointer",
                pointer,
                e,
            ));
        }
        Ok(())
    }

    fn prune(&self, user_id: UserId, current: u64) {
        let versions = match self.versions(user_id) {
            Ok(versions) => versions,
            Err(e) => {
                warn!("Skipping adapter pruning for user {}: {}", user_id, e);
                return;
            }
        };

        let excess = versions.len().saturating_sub(self.keep_versions);
        for &version in versions.iter().take(excess).filter(|&&v| v != current) {
            let dir = self.version_dir(user_id, version);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!("Pruned adapter v{} for user {}", version, user_id),
                Err(e) => warn!("Failed to prune {}: {}", dir.display(), e),
            }
        }
    }
}

fn remove_quietly(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!("Failed to clean up {}: {}", dir.display(), e);
    }
}
