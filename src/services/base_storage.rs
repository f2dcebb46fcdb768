//! The storage engine contract.
//!
//! `BaseStorage` is implemented by concrete backends, which supply the data
//! plane (`create`, `write`, `get`, `delete`, ...). Everything that does not
//! depend on where bytes live is provided here on top of [`StorageCore`]:
//! validation, cached metadata access, expiration, purge, metadata updates and
//! batch fan-out.

use crate::{
    config::StorageConfig,
    errors::{ErrorCode, UploadError, UploadResult},
    handlers::UploadResponse,
    models::{
        BodyStream, File, FileInit, FileListItem, FilePart, UploadStatus,
        metadata::merge_metadata,
    },
    services::{
        locker::{LockGuard, Locker},
        meta_storage::MetaStorage,
        validation::{ValidationRule, Validator},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle callbacks. All methods default to no-ops.
pub trait UploadHooks: Send + Sync {
    fn on_create(&self, _file: &File) {}
    fn on_update(&self, _file: &File) {}
    fn on_complete(&self, _file: &File) {}
    fn on_delete(&self, _file: &File) {}
    /// Last chance to reshape an error response before it is sent.
    fn on_error(&self, _error: &UploadError, _response: &mut UploadResponse) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl UploadHooks for NoopHooks {}

/// Per-operation instrumentation sink.
pub trait Metrics: Send + Sync {
    fn record(&self, operation: &'static str, elapsed: Duration, error: Option<&UploadError>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record(&self, _operation: &'static str, _elapsed: Duration, _error: Option<&UploadError>) {}
}

/// Emits one `debug!` event per storage operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn record(&self, operation: &'static str, elapsed: Duration, error: Option<&UploadError>) {
        debug!(
            operation,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            error = error.map(|e| e.code.as_str()),
            "storage operation"
        );
    }
}

/// Data returned by `get_stream`.
pub struct FileStream {
    pub file: File,
    pub content_length: u64,
    pub body: BodyStream,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub id: String,
    pub error: UploadError,
}

/// Outcome of a batch operation; every member is reported.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub successful: Vec<File>,
    pub failed: Vec<BatchFailure>,
    pub successful_count: usize,
    pub failed_count: usize,
}

impl BatchResult {
    fn from_outcomes(outcomes: Vec<(String, UploadResult<File>)>) -> Self {
        let mut result = Self::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(file) => result.successful.push(file),
                Err(error) => result.failed.push(BatchFailure { id, error }),
            }
        }
        result.successful_count = result.successful.len();
        result.failed_count = result.failed.len();
        result
    }

    pub fn to_json(&self) -> Value {
        json!({
            "successful": self.successful,
            "failed": self.failed.iter().map(|f| json!({
                "id": f.id,
                "error": f.error.body()["error"].clone(),
            })).collect::<Vec<_>>(),
            "successfulCount": self.successful_count,
            "failedCount": self.failed_count,
        })
    }
}

/// State shared by every storage implementation.
///
/// Owns the metadata cache, the locker, validation rules, hooks and metrics.
/// A storage is unusable until [`StorageCore::mark_ready`] has been called by
/// its `init`.
pub struct StorageCore {
    name: &'static str,
    pub config: StorageConfig,
    pub meta: Arc<dyn MetaStorage>,
    cache: Mutex<HashMap<String, File>>,
    locker: Arc<Locker>,
    validator: Validator,
    hooks: Arc<dyn UploadHooks>,
    metrics: Arc<dyn Metrics>,
    ready: AtomicBool,
}

impl StorageCore {
    pub fn new(name: &'static str, config: StorageConfig, meta: Arc<dyn MetaStorage>) -> Self {
        let locker = Arc::new(Locker::new(config.lock_ttl, config.max_concurrent_uploads));
        let validator = Validator::from_config(&config);
        Self {
            name,
            config,
            meta,
            cache: Mutex::new(HashMap::new()),
            locker,
            validator,
            hooks: Arc::new(NoopHooks),
            metrics: Arc::new(NoopMetrics),
            ready: AtomicBool::new(false),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn UploadHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validator.add(rule);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn hooks(&self) -> &dyn UploadHooks {
        self.hooks.as_ref()
    }

    pub fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn ensure_ready(&self) -> UploadResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(UploadError::new(ErrorCode::StorageNotReady).in_storage(self.name))
        }
    }

    /// Run one storage operation with readiness check, timing and error
    /// accounting. Internal failures are tagged with this storage's name.
    pub async fn instrument<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = UploadResult<T>>,
    ) -> UploadResult<T> {
        self.ensure_ready()?;
        let started = Instant::now();
        let result = fut.await.map_err(|err| {
            if err.status().is_server_error() {
                err.in_storage(self.name)
            } else {
                err
            }
        });
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => self.metrics.record(operation, elapsed, None),
            Err(err) => {
                if err.status().is_server_error() {
                    warn!(storage = self.name, operation, error = %err, "storage operation failed");
                } else {
                    debug!(storage = self.name, operation, code = err.code.as_str(), "storage operation rejected");
                }
                self.metrics.record(operation, elapsed, Some(err));
            }
        }
        result
    }

    pub fn cache_get(&self, id: &str) -> Option<File> {
        self.cache.lock().get(id).cloned()
    }

    pub fn cache_put(&self, file: &File) {
        self.cache.lock().insert(file.id.clone(), file.clone());
    }

    pub fn cache_remove(&self, id: &str) {
        self.cache.lock().remove(id);
    }

    /// Drop cached tombstones of expired uploads; returns how many went.
    pub fn cache_evict_deleted(&self) -> usize {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, file| file.status != UploadStatus::Deleted);
        before - cache.len()
    }

    /// Hold the write lock on `key` until the guard drops.
    pub fn lock_guard(&self, key: &str) -> UploadResult<LockGuard> {
        LockGuard::acquire(&self.locker, key)
    }

    /// Fill timestamps and recompute the expiry deadline.
    pub fn stamp(&self, file: &mut File) {
        let now = Utc::now();
        let created_at = *file.created_at.get_or_insert(now);
        file.modified_at = Some(now);
        if let Some(expiration) = &self.config.expiration {
            let max_age = chrono::Duration::from_std(expiration.max_age).ok();
            if expiration.rolling {
                file.expired_at = max_age.and_then(|age| now.checked_add_signed(age));
            } else if file.expired_at.is_none() {
                file.expired_at = max_age.and_then(|age| created_at.checked_add_signed(age));
            }
        }
    }
}

/// The storage engine contract.
#[async_trait]
pub trait BaseStorage: Send + Sync {
    fn core(&self) -> &StorageCore;

    /// Prepare the backend (directories, access checks) and mark it ready.
    async fn init(&self) -> UploadResult<()>;

    async fn create(&self, init: FileInit) -> UploadResult<File>;

    async fn write(&self, part: FilePart) -> UploadResult<File>;

    /// Buffered content with a computed ETag.
    async fn get(&self, id: &str) -> UploadResult<(File, Bytes)>;

    async fn get_stream(&self, id: &str) -> UploadResult<FileStream>;

    async fn delete(&self, id: &str) -> UploadResult<File>;

    async fn copy(&self, id: &str, dest: &str) -> UploadResult<File>;

    async fn move_to(&self, id: &str, dest: &str) -> UploadResult<File>;

    async fn list(&self) -> UploadResult<Vec<FileListItem>>;

    fn name(&self) -> &'static str {
        self.core().name()
    }

    fn is_ready(&self) -> bool {
        self.core().is_ready()
    }

    fn validate(&self, file: &File) -> UploadResult<()> {
        self.core().validator().validate(file)
    }

    /// Never fails: any lookup error counts as absence.
    async fn exists(&self, id: &str) -> bool {
        match self.get_meta(id).await {
            Ok(file) => file.status != UploadStatus::Deleted,
            Err(_) => false,
        }
    }

    async fn get_meta(&self, id: &str) -> UploadResult<File> {
        if let Some(file) = self.core().cache_get(id) {
            return Ok(file);
        }
        let file = self.core().meta.get(id).await?;
        self.core().cache_put(&file);
        Ok(file)
    }

    async fn save_meta(&self, mut file: File) -> UploadResult<File> {
        self.core().stamp(&mut file);
        self.core().meta.save(&file.id, &file).await?;
        self.core().cache_put(&file);
        Ok(file)
    }

    async fn delete_meta(&self, id: &str) -> UploadResult<()> {
        self.core().cache_remove(id);
        self.core().meta.delete(id).await
    }

    /// Raise `Gone` for an expired upload after removing its data.
    ///
    /// Cleanup is best effort. The expired record stays cached as a tombstone
    /// so later requests keep answering `Gone` until the next purge.
    async fn check_if_expired(&self, file: File) -> UploadResult<File> {
        if !file.is_expired() {
            return Ok(file);
        }
        if file.status != UploadStatus::Deleted {
            if let Err(err) = self.delete(&file.id).await {
                debug!(id = %file.id, error = %err, "expired upload cleanup failed");
            }
            self.core().cache_put(&file.tagged(UploadStatus::Deleted));
        }
        Err(UploadError::with_message(
            ErrorCode::Gone,
            format!("upload `{}` has expired", file.id),
        ))
    }

    /// Delete every upload older than `max_age` (or the configured lifetime).
    ///
    /// Age is measured from `modifiedAt` under rolling expiration, otherwise
    /// from `createdAt`. Per-item failures are logged and skipped.
    async fn purge(&self, max_age: Option<Duration>) -> UploadResult<Vec<File>> {
        let core = self.core();
        core.instrument("purge", async {
            let expiration = core.config.expiration.as_ref();
            let Some(max_age) = max_age.or_else(|| expiration.map(|e| e.max_age)) else {
                return Ok(Vec::new());
            };
            let rolling = expiration.is_some_and(|e| e.rolling);
            let cutoff = chrono::Duration::from_std(max_age)
                .ok()
                .and_then(|age| Utc::now().checked_sub_signed(age))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            let evicted = core.cache_evict_deleted();
            if evicted > 0 {
                debug!(evicted, "dropped expired upload tombstones");
            }

            let items = self.list().await?;
            let expired: Vec<FileListItem> = items
                .into_iter()
                .filter(|item| {
                    let stamp: Option<DateTime<Utc>> = if rolling {
                        item.modified_at.or(item.created_at)
                    } else {
                        item.created_at
                    };
                    stamp.is_some_and(|at| at < cutoff)
                })
                .collect();

            let outcomes = join_all(expired.iter().map(|item| self.delete(&item.id))).await;
            let mut purged = Vec::new();
            for (item, outcome) in expired.iter().zip(outcomes) {
                match outcome {
                    Ok(file) => purged.push(file),
                    Err(err) => warn!(id = %item.id, error = %err, "purge failed"),
                }
            }
            if !purged.is_empty() {
                info!(count = purged.len(), "purged expired uploads");
            }
            Ok(purged)
        })
        .await
    }

    /// Merge a partial update into an upload.
    ///
    /// `patch` is a JSON object. `metadata` is deep-merged (arrays replace),
    /// `ttl` in seconds sets an absolute `expiredAt`, `size`, `contentType`
    /// and `originalName` set their fields, and any other key is merged into
    /// the metadata map.
    async fn update(&self, id: &str, patch: Value) -> UploadResult<File> {
        let core = self.core();
        core.instrument("update", async {
            let file = self.get_meta(id).await?;
            let mut file = self.check_if_expired(file).await?;
            let Value::Object(patch) = patch else {
                return Err(UploadError::bad_request("update must be a JSON object"));
            };

            let mut ttl = None;
            for (key, value) in patch {
                match key.as_str() {
                    "metadata" => match value {
                        Value::Object(partial) => merge_metadata(&mut file.metadata, partial),
                        _ => return Err(UploadError::bad_request("metadata must be an object")),
                    },
                    "ttl" => ttl = Some(parse_seconds(&value)?),
                    "size" => file.size = Some(parse_u64(&value)?),
                    "contentType" => {
                        if let Value::String(s) = value {
                            file.content_type = s;
                        }
                    }
                    "originalName" => {
                        if let Value::String(s) = value {
                            file.original_name = s;
                        }
                    }
                    "id" | "name" | "bytesWritten" | "status" | "createdAt" => {}
                    other => {
                        let mut partial = serde_json::Map::new();
                        partial.insert(other.to_string(), value);
                        merge_metadata(&mut file.metadata, partial);
                    }
                }
            }
            if let Some(size) = file.size {
                if file.bytes_written > size {
                    return Err(UploadError::conflict(format!(
                        "size {size} is smaller than the {} bytes already written",
                        file.bytes_written
                    )));
                }
            }
            self.validate(&file)?;

            core.stamp(&mut file);
            if let Some(ttl) = ttl {
                file.expired_at = Utc::now()
                    .checked_add_signed(chrono::Duration::seconds(ttl as i64));
            }
            core.meta.save(&file.id, &file).await?;
            core.cache_put(&file);
            core.hooks().on_update(&file);
            Ok(file.tagged(UploadStatus::Updated))
        })
        .await
    }

    async fn delete_batch(&self, ids: Vec<String>) -> BatchResult {
        let outcomes = join_all(ids.into_iter().map(|id| async move {
            let outcome = self.delete(&id).await;
            (id, outcome)
        }))
        .await;
        BatchResult::from_outcomes(outcomes)
    }

    async fn copy_batch(&self, pairs: Vec<(String, String)>) -> BatchResult {
        let outcomes = join_all(pairs.into_iter().map(|(id, dest)| async move {
            let outcome = self.copy(&id, &dest).await;
            (id, outcome)
        }))
        .await;
        BatchResult::from_outcomes(outcomes)
    }

    async fn move_batch(&self, pairs: Vec<(String, String)>) -> BatchResult {
        let outcomes = join_all(pairs.into_iter().map(|(id, dest)| async move {
            let outcome = self.move_to(&id, &dest).await;
            (id, outcome)
        }))
        .await;
        BatchResult::from_outcomes(outcomes)
    }

    fn lock(&self, key: &str) -> UploadResult<String> {
        self.core().locker().lock(key)
    }

    fn unlock(&self, key: &str) {
        self.core().locker().unlock(key)
    }
}

fn parse_u64(value: &Value) -> UploadResult<u64> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        UploadError::with_message(ErrorCode::InvalidFileSize, format!("invalid size `{value}`"))
    })
}

fn parse_seconds(value: &Value) -> UploadResult<u64> {
    parse_u64(value).map_err(|_| UploadError::bad_request(format!("invalid ttl `{value}`")))
}

/// Run `purge` on a fixed interval until the task is aborted.
pub fn spawn_purge_task(storage: Arc<dyn BaseStorage>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match storage.purge(None).await {
                Ok(purged) => debug!(count = purged.len(), "purge sweep finished"),
                Err(err) => warn!(error = %err, "purge sweep failed"),
            }
        }
    })
}
