//! DiskStorage: uploads stored as plain files beneath one root directory.
//!
//! Each upload is a data file at `{directory}/{name}` plus a JSON metadata
//! sidecar at `{directory}/{id}.META`. Chunks are written in place at their
//! byte offset; a failed chunk is rolled back by truncating to the length the
//! file had before it.

use crate::{
    config::{FileNaming, StorageConfig},
    errors::{ErrorCode, UploadError, UploadResult},
    models::{File, FileInit, FileListItem, FilePart, UploadStatus},
    services::{
        base_storage::{BaseStorage, FileStream, Metrics, StorageCore, UploadHooks},
        meta_storage::{DiskMetaStorage, MetaStorage},
        pipeline::{self, ChunkError, ChunkLimits},
        validation::{ValidationRule, mime_allowed},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STORAGE_NAME: &str = "DiskStorage";
const GENERIC_TYPES: [&str; 2] = ["application/octet-stream", ""];

pub struct DiskStorage {
    core: StorageCore,
    directory: PathBuf,
    meta_store: Arc<DiskMetaStorage>,
}

impl DiskStorage {
    /// Build the storage. No I/O happens until [`BaseStorage::init`].
    pub fn new(config: StorageConfig) -> Self {
        let directory = config.directory.clone();
        let meta_store = Arc::new(DiskMetaStorage::new(&directory, config.meta_suffix.clone()));
        let core = StorageCore::new(STORAGE_NAME, config, meta_store.clone());
        Self {
            core,
            directory,
            meta_store,
        }
    }

    pub fn with_hooks(self, hooks: Arc<dyn UploadHooks>) -> Self {
        Self {
            core: self.core.with_hooks(hooks),
            ..self
        }
    }

    pub fn with_metrics(self, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            core: self.core.with_metrics(metrics),
            ..self
        }
    }

    pub fn with_rule(self, rule: ValidationRule) -> Self {
        Self {
            core: self.core.with_rule(rule),
            ..self
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn physical_name(&self, id: &str) -> String {
        match self.core.config.naming {
            FileNaming::Id => id.to_string(),
            FileNaming::Random => Uuid::new_v4().simple().to_string(),
        }
    }

    /// Create the data file if missing; never truncates an existing one.
    async fn ensure_data_file(&self, path: &Path) -> UploadResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn is_internal_path(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.meta_store.is_reserved_name(n))
    }

    /// Relative paths of every data file under the root.
    async fn walk_data_files(&self) -> UploadResult<Vec<(String, std::fs::Metadata)>> {
        let mut found = Vec::new();
        let mut pending = vec![self.directory.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if self.is_internal_path(&path) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&self.directory) {
                    found.push((rel.to_string_lossy().replace('\\', "/"), meta));
                }
            }
        }
        Ok(found)
    }

    /// Remove empty directories between `start` and the storage root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.directory) && current != self.directory {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn remove_data(&self, name: &str) -> UploadResult<()> {
        let path = self.data_path(name);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed data file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("data file {} already missing", path.display());
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// Load an upload for a data-plane operation, refusing expired ones.
    async fn load(&self, id: &str) -> UploadResult<File> {
        let file = self.get_meta(id).await?;
        self.check_if_expired(file).await
    }

    /// Clone `src` under `dest`, giving it its own physical name.
    fn derive_copy(&self, src: &File, dest: &str) -> UploadResult<File> {
        self.meta_store.check_id(dest)?;
        let mut file = src.clone();
        file.id = dest.to_string();
        file.name = self.physical_name(dest);
        file.created_at = None;
        file.expired_at = None;
        Ok(file)
    }

    async fn write_chunk(&self, part: FilePart, mut file: File) -> UploadResult<File> {
        let was_completed = file.is_completed();
        let manual_completion = part.manual_completion;

        if let Some(size) = part.size {
            match file.size {
                None if size < file.bytes_written => {
                    return Err(UploadError::conflict(format!(
                        "size {size} is smaller than the {} bytes already written",
                        file.bytes_written
                    )));
                }
                None => {
                    file.size = Some(size);
                    self.validate(&file)?;
                }
                Some(current) if current != size => {
                    return Err(UploadError::conflict("upload size is already set"));
                }
                Some(_) => {}
            }
        }

        let start = part.start.unwrap_or(file.bytes_written);
        if let Some(size) = file.size {
            let end = start.saturating_add(part.content_length.unwrap_or(0));
            if start > size || end > size {
                return Err(UploadError::conflict(format!(
                    "chunk {start}..{end} exceeds upload size {size}"
                )));
            }
        }

        let path = self.data_path(&file.name);
        let _guard = self.core.lock_guard(&path.to_string_lossy())?;

        if let Some(body) = part.body {
            let mut handle = OpenOptions::new().write(true).open(&path).await?;
            let pre_len = handle.metadata().await?.len();
            handle.seek(SeekFrom::Start(start)).await?;

            let limits = ChunkLimits {
                content_length: part.content_length,
                room: file.size.map(|size| size - start),
                ceiling: file
                    .size
                    .is_none()
                    .then(|| self.core.config.max_upload_size.saturating_sub(start)),
                checksum: part.checksum.as_ref(),
                sniff: start == 0 && GENERIC_TYPES.contains(&file.content_type.as_str()),
            };
            let result = pipeline::write_chunk(&mut handle, body, limits, part.abort.as_ref()).await;

            match result {
                Ok(outcome) => {
                    handle.sync_data().await?;
                    file.bytes_written = file.bytes_written.max(start + outcome.written);
                    if limits.sniff {
                        let detected = outcome.sniffed.or_else(|| {
                            mime_guess::from_path(&file.original_name)
                                .first()
                                .map(|m| m.essence_str().to_string())
                        });
                        if let Some(content_type) = detected {
                            if !mime_allowed(&self.core.config.allow_mime, &content_type) {
                                truncate(&mut handle, pre_len).await;
                                return Err(UploadError::with_message(
                                    ErrorCode::UnsupportedMediaType,
                                    format!("content type `{content_type}` is not allowed"),
                                ));
                            }
                            file.content_type = content_type;
                        }
                    }
                    if let Some(checksum) = &part.checksum {
                        file.hash = Some(checksum.to_string());
                    }
                }
                Err(ChunkError::Aborted { written }) => {
                    if part.checksum.is_some() {
                        truncate(&mut handle, pre_len).await;
                    } else {
                        let _ = handle.flush().await;
                        file.bytes_written = file.bytes_written.max(start + written);
                        file.status = file.settled_status(manual_completion);
                        self.save_meta(file).await?;
                    }
                    return Err(UploadError::new(ErrorCode::RequestAborted));
                }
                Err(ChunkError::Failed { error, written }) => {
                    debug!(id = %file.id, written, code = error.code.as_str(), "rolling back chunk");
                    truncate(&mut handle, pre_len).await;
                    return Err(error);
                }
            }
        }

        file.status = file.settled_status(manual_completion);
        let file = self.save_meta(file).await?;
        if file.is_completed() && !was_completed {
            info!(id = %file.id, size = file.bytes_written, "upload completed");
            self.core.hooks().on_complete(&file);
        }
        Ok(file)
    }
}

async fn truncate(handle: &mut fs::File, len: u64) {
    if let Err(err) = handle.set_len(len).await {
        warn!(error = %err, "failed to roll back partial chunk");
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    // EXDEV
    err.kind() == ErrorKind::CrossesDevices || err.raw_os_error() == Some(18)
}

#[async_trait]
impl BaseStorage for DiskStorage {
    fn core(&self) -> &StorageCore {
        &self.core
    }

    async fn init(&self) -> UploadResult<()> {
        fs::create_dir_all(&self.directory).await?;
        let probe = self.directory.join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"probe").await.map_err(|err| {
            UploadError::internal(
                STORAGE_NAME,
                format!("storage directory {} is not writable: {err}", self.directory.display()),
            )
        })?;
        let _ = fs::remove_file(&probe).await;
        self.core.mark_ready();
        info!("DiskStorage ready at {}", self.directory.display());
        Ok(())
    }

    async fn create(&self, init: FileInit) -> UploadResult<File> {
        self.core
            .instrument("create", async {
                let mut file = File::from_init(&init);
                self.meta_store.check_id(&file.id)?;

                match self.get_meta(&file.id).await {
                    Ok(existing) if existing.status != UploadStatus::Deleted && !existing.is_expired() => {
                        debug!(id = %existing.id, status = %existing.status, "create resolved to existing upload");
                        return Ok(existing);
                    }
                    Ok(_) => self.core.cache_remove(&file.id),
                    Err(err) if err.code == ErrorCode::FileNotFound => {}
                    Err(err) => return Err(err),
                }

                file.name = self.physical_name(&file.id);
                self.validate(&file)?;
                self.ensure_data_file(&self.data_path(&file.name)).await?;

                file.bytes_written = 0;
                file.status = UploadStatus::Created;
                let file = self.save_meta(file).await?;
                debug!(id = %file.id, name = %file.name, size = ?file.size, "upload created");
                self.core.hooks().on_create(&file);
                Ok(file)
            })
            .await
    }

    async fn write(&self, part: FilePart) -> UploadResult<File> {
        self.core
            .instrument("write", async {
                let file = self.load(&part.id).await?;
                self.write_chunk(part, file).await
            })
            .await
    }

    async fn get(&self, id: &str) -> UploadResult<(File, Bytes)> {
        self.core
            .instrument("get", async {
                let mut file = self.load(id).await?;
                let data = fs::read(self.data_path(&file.name)).await?;
                file.etag = Some(format!("\"{:x}\"", md5::compute(&data)));
                Ok((file, Bytes::from(data)))
            })
            .await
    }

    async fn get_stream(&self, id: &str) -> UploadResult<FileStream> {
        self.core
            .instrument("get_stream", async {
                let mut file = self.load(id).await?;
                let handle = fs::File::open(self.data_path(&file.name)).await?;
                let stat = handle.metadata().await?;
                if file.etag.is_none() {
                    let modified = stat
                        .modified()
                        .ok()
                        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                        .unwrap_or_default();
                    file.etag = Some(format!("W/\"{:x}-{:x}\"", stat.len(), modified));
                }
                Ok(FileStream {
                    file,
                    content_length: stat.len(),
                    body: Box::pin(ReaderStream::new(handle)),
                })
            })
            .await
    }

    async fn delete(&self, id: &str) -> UploadResult<File> {
        self.core
            .instrument("delete", async {
                let file = self.get_meta(id).await?;
                if file.status == UploadStatus::Deleted {
                    return Err(UploadError::not_found(format!("upload `{id}` not found")));
                }
                self.remove_data(&file.name).await?;
                self.delete_meta(id).await?;
                self.core.hooks().on_delete(&file);
                Ok(file.tagged(UploadStatus::Deleted))
            })
            .await
    }

    async fn copy(&self, id: &str, dest: &str) -> UploadResult<File> {
        self.core
            .instrument("copy", async {
                let src = self.load(id).await?;
                let file = self.derive_copy(&src, dest)?;
                let dest_path = self.data_path(&file.name);
                if let Some(parent) = dest_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::copy(self.data_path(&src.name), &dest_path).await?;
                self.save_meta(file).await
            })
            .await
    }

    async fn move_to(&self, id: &str, dest: &str) -> UploadResult<File> {
        self.core
            .instrument("move", async {
                let src = self.load(id).await?;
                let file = self.derive_copy(&src, dest)?;
                let src_path = self.data_path(&src.name);
                let dest_path = self.data_path(&file.name);
                if let Some(parent) = dest_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let _guard = self.core.lock_guard(&src_path.to_string_lossy())?;
                match fs::rename(&src_path, &dest_path).await {
                    Ok(_) => {}
                    Err(err) if is_cross_device(&err) => {
                        debug!("rename across devices, copying {}", src_path.display());
                        fs::copy(&src_path, &dest_path).await?;
                        fs::remove_file(&src_path).await?;
                    }
                    Err(err) => return Err(err.into()),
                }
                let file = self.save_meta(file).await?;
                self.delete_meta(id).await?;
                Ok(file)
            })
            .await
    }

    async fn list(&self) -> UploadResult<Vec<FileListItem>> {
        self.core
            .instrument("list", async {
                let mut by_name: HashMap<String, File> = HashMap::new();
                for id in self.meta_store.list().await? {
                    match self.get_meta(&id).await {
                        Ok(file) => {
                            by_name.insert(file.name.clone(), file);
                        }
                        Err(err) => debug!(id, error = %err, "skipping unreadable metadata"),
                    }
                }

                let mut items: Vec<FileListItem> = self
                    .walk_data_files()
                    .await?
                    .into_iter()
                    .map(|(name, stat)| match by_name.remove(&name) {
                        Some(file) => FileListItem {
                            id: file.id,
                            created_at: file.created_at,
                            modified_at: file.modified_at,
                        },
                        None => FileListItem {
                            created_at: stat.created().or_else(|_| stat.modified()).ok().map(DateTime::<Utc>::from),
                            modified_at: stat.modified().ok().map(DateTime::<Utc>::from),
                            id: name,
                        },
                    })
                    .collect();
                items.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(items)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ExpirationConfig,
        models::{Checksum, ChecksumAlgorithm},
    };
    use crate::models::BodyStream;
    use base64::{Engine as _, engine::general_purpose};
    use futures::{StreamExt, stream};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn storage_with(config: impl FnOnce(&mut StorageConfig)) -> (DiskStorage, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut cfg = StorageConfig::new(temp.path());
        config(&mut cfg);
        let storage = DiskStorage::new(cfg);
        storage.init().await.unwrap();
        (storage, temp)
    }

    async fn storage() -> (DiskStorage, TempDir) {
        storage_with(|_| {}).await
    }

    fn init(name: &str, size: u64) -> FileInit {
        FileInit {
            original_name: name.into(),
            content_type: Some("text/plain".into()),
            size: Some(size),
            last_modified: Some(1_700_000_000_000),
            ..FileInit::default()
        }
    }

    fn chunk(id: &str, start: u64, data: &'static [u8]) -> FilePart {
        let body = Box::pin(stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(data))]));
        FilePart::new(id).at(start).with_body(body, Some(data.len() as u64))
    }

    /// Yields `first`, then cancels `token` and stalls like a silent client.
    fn interrupted(first: &'static [u8], token: CancellationToken) -> BodyStream {
        let head = stream::once(async move { Ok::<_, io::Error>(Bytes::from_static(first)) });
        let tail = stream::once(async move {
            token.cancel();
            std::future::pending::<io::Result<Bytes>>().await
        });
        Box::pin(head.chain(tail))
    }

    #[tokio::test]
    async fn operations_fail_before_init() {
        let temp = TempDir::new().unwrap();
        let storage = DiskStorage::new(StorageConfig::new(temp.path()));
        let err = storage.create(init("a.txt", 1)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::StorageNotReady);
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let (storage, temp) = storage().await;
        let first = storage.create(init("a.txt", 10)).await.unwrap();
        let second = storage.create(init("a.txt", 10)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, UploadStatus::Created);
        assert!(temp.path().join(&first.name).exists());
        assert!(temp.path().join(format!("{}.META", first.id)).exists());
    }

    #[tokio::test]
    async fn chunks_complete_the_upload() {
        let (storage, _temp) = storage().await;
        let file = storage.create(init("a.txt", 11)).await.unwrap();

        let file = storage.write(chunk(&file.id, 0, b"hello ")).await.unwrap();
        assert_eq!(file.bytes_written, 6);
        assert_eq!(file.status, UploadStatus::Part);

        let file = storage.write(chunk(&file.id, 6, b"world")).await.unwrap();
        assert_eq!(file.bytes_written, 11);
        assert_eq!(file.status, UploadStatus::Completed);

        let (_, data) = storage.get(&file.id).await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn write_past_size_conflicts() {
        let (storage, _temp) = storage().await;
        let file = storage.create(init("a.txt", 4)).await.unwrap();
        let err = storage.write(chunk(&file.id, 0, b"too long")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::FileConflict);
        assert_eq!(storage.get_meta(&file.id).await.unwrap().bytes_written, 0);
    }

    #[tokio::test]
    async fn checksum_mismatch_rolls_back() {
        let (storage, temp) = storage().await;
        let file = storage.create(init("a.txt", 10)).await.unwrap();
        storage.write(chunk(&file.id, 0, b"12345")).await.unwrap();

        let bad = Checksum::new(ChecksumAlgorithm::Md5, general_purpose::STANDARD.encode([0u8; 16]));
        let err = storage
            .write(chunk(&file.id, 5, b"67890").with_checksum(Some(bad)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ChecksumMismatch);
        assert_eq!(storage.get_meta(&file.id).await.unwrap().bytes_written, 5);
        assert_eq!(std::fs::metadata(temp.path().join(&file.name)).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn cancelled_write_keeps_received_bytes() {
        let (storage, temp) = storage().await;
        let file = storage.create(init("a.txt", 10)).await.unwrap();
        let token = CancellationToken::new();
        let part = FilePart::new(&file.id)
            .at(0)
            .with_body(interrupted(b"abc", token.clone()), Some(10))
            .with_abort(token);

        let err = storage.write(part).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestAborted);
        let saved = storage.get_meta(&file.id).await.unwrap();
        assert_eq!(saved.bytes_written, 3);
        assert_eq!(saved.status, UploadStatus::Part);
        assert_eq!(std::fs::metadata(temp.path().join(&file.name)).unwrap().len(), 3);

        // the chunk lock is gone, so the client can resume where it stopped
        let file = storage.write(chunk(&file.id, 3, b"defghij")).await.unwrap();
        assert_eq!(file.status, UploadStatus::Completed);
        assert_eq!(&storage.get(&file.id).await.unwrap().1[..], b"abcdefghij");
    }

    #[tokio::test]
    async fn cancelled_checksummed_write_rolls_back() {
        let (storage, temp) = storage().await;
        let file = storage.create(init("a.txt", 10)).await.unwrap();
        let digest = general_purpose::STANDARD.encode(md5::compute(b"0123456789").0);
        let token = CancellationToken::new();
        let part = FilePart::new(&file.id)
            .at(0)
            .with_body(interrupted(b"012", token.clone()), Some(10))
            .with_checksum(Some(Checksum::new(ChecksumAlgorithm::Md5, digest)))
            .with_abort(token);

        let err = storage.write(part).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestAborted);
        assert_eq!(storage.get_meta(&file.id).await.unwrap().bytes_written, 0);
        assert_eq!(std::fs::metadata(temp.path().join(&file.name)).unwrap().len(), 0);

        let file = storage.write(chunk(&file.id, 0, b"0123456789")).await.unwrap();
        assert_eq!(file.status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn short_body_is_an_aborted_write() {
        let (storage, _temp) = storage().await;
        let file = storage.create(init("a.txt", 10)).await.unwrap();
        let body = Box::pin(stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"abc"))]));
        let err = storage
            .write(FilePart::new(&file.id).at(0).with_body(body, Some(10)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestAborted);
        let saved = storage.get_meta(&file.id).await.unwrap();
        assert_eq!(saved.bytes_written, 3);
        assert_eq!(saved.status, UploadStatus::Part);
    }

    #[tokio::test]
    async fn unsized_write_stops_at_max_upload_size() {
        let (storage, temp) = storage_with(|cfg| cfg.max_upload_size = 5).await;
        let file = storage
            .create(FileInit {
                size: None,
                ..init("a.txt", 0)
            })
            .await
            .unwrap();
        let body = Box::pin(stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defgh")),
        ]));
        let err = storage
            .write(FilePart::new(&file.id).at(0).with_body(body, None))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestEntityTooLarge);
        assert_eq!(storage.get_meta(&file.id).await.unwrap().bytes_written, 0);
        assert_eq!(std::fs::metadata(temp.path().join(&file.name)).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn manual_completion_defers_the_complete_status() {
        let (storage, _temp) = storage().await;
        let file = storage.create(init("a.txt", 4)).await.unwrap();
        let file = storage
            .write(chunk(&file.id, 2, b"cd").with_manual_completion())
            .await
            .unwrap();
        assert_eq!(file.bytes_written, 4);
        assert_eq!(file.status, UploadStatus::Part);
    }

    #[tokio::test]
    async fn ids_that_shadow_sidecars_are_rejected() {
        let (storage, _temp) = storage().await;
        let a = storage
            .create(FileInit {
                id: Some("a".into()),
                ..init("a.txt", 1)
            })
            .await
            .unwrap();
        storage.write(chunk(&a.id, 0, b"x")).await.unwrap();

        let err = storage
            .create(FileInit {
                id: Some("a.META".into()),
                ..init("b.txt", 1)
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
        let err = storage.copy("a", "a.META").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
        assert_eq!(&storage.get("a").await.unwrap().1[..], b"x");
    }

    #[tokio::test]
    async fn sniffs_generic_content_type() {
        let (storage, _temp) = storage().await;
        let file = storage
            .create(FileInit {
                content_type: None,
                ..init("image", 8)
            })
            .await
            .unwrap();
        let png: &'static [u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        let file = storage.write(chunk(&file.id, 0, png)).await.unwrap();
        assert_eq!(file.content_type, "image/png");
    }

    #[tokio::test]
    async fn copy_and_move() {
        let (storage, temp) = storage().await;
        let file = storage.create(init("a.txt", 3)).await.unwrap();
        storage.write(chunk(&file.id, 0, b"abc")).await.unwrap();

        let copied = storage.copy(&file.id, "copy").await.unwrap();
        assert_eq!(copied.id, "copy");
        assert_eq!(&storage.get("copy").await.unwrap().1[..], b"abc");

        let moved = storage.move_to("copy", "moved").await.unwrap();
        assert_eq!(moved.bytes_written, 3);
        assert!(!temp.path().join("copy").exists());
        assert!(!storage.exists("copy").await);
        assert!(storage.exists("moved").await);
    }

    #[tokio::test]
    async fn list_skips_sidecars() {
        let (storage, _temp) = storage().await;
        let a = storage.create(init("a.txt", 1)).await.unwrap();
        let b = storage.create(init("b.txt", 1)).await.unwrap();
        let ids: Vec<String> = storage.list().await.unwrap().into_iter().map(|i| i.id).collect();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn delete_batch_reports_each_item() {
        let (storage, _temp) = storage().await;
        let a = storage.create(init("a.txt", 1)).await.unwrap();
        let b = storage.create(init("b.txt", 1)).await.unwrap();
        let result = storage
            .delete_batch(vec![a.id.clone(), "missing".into(), b.id.clone()])
            .await;
        assert_eq!(result.successful_count, 2);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.failed[0].id, "missing");
        assert_eq!(result.failed[0].error.code, ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn update_merges_metadata_and_sets_ttl() {
        let (storage, _temp) = storage().await;
        let file = storage.create(init("a.txt", 1)).await.unwrap();
        let updated = storage
            .update(&file.id, serde_json::json!({"metadata": {"tags": ["a"]}, "ttl": 60, "note": "x"}))
            .await
            .unwrap();
        assert_eq!(updated.status, UploadStatus::Updated);
        assert_eq!(updated.metadata["tags"], serde_json::json!(["a"]));
        assert_eq!(updated.metadata["note"], "x");
        assert!(updated.expired_at.is_some());
        assert_eq!(storage.get_meta(&file.id).await.unwrap().status, UploadStatus::Created);
    }

    #[tokio::test]
    async fn expired_uploads_are_gone() {
        let (storage, temp) = storage_with(|cfg| {
            cfg.expiration = Some(ExpirationConfig {
                max_age: Duration::from_millis(1),
                purge_interval: None,
                rolling: false,
            });
        })
        .await;
        let file = storage.create(init("a.txt", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = storage.get(&file.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Gone);
        let err = storage.get(&file.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Gone);
        assert!(!temp.path().join(&file.name).exists());
        assert!(!storage.exists(&file.id).await);

        // purging drops the cached tombstone
        storage.purge(None).await.unwrap();
        assert!(storage.core().cache_get(&file.id).is_none());
        let err = storage.get(&file.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn purge_uses_created_at_for_fixed_expiration() {
        let (storage, _temp) = storage().await;
        let old = storage.create(init("old.txt", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = storage.create(init("fresh.txt", 1)).await.unwrap();

        let purged = storage.purge(Some(Duration::from_millis(25))).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, old.id);
        assert!(storage.exists(&fresh.id).await);
    }

    #[tokio::test]
    async fn purge_uses_modified_at_when_rolling() {
        let (storage, _temp) = storage_with(|cfg| {
            cfg.expiration = Some(ExpirationConfig {
                max_age: Duration::from_secs(3600),
                purge_interval: None,
                rolling: true,
            });
        })
        .await;
        let touched = storage.create(init("touched.txt", 2)).await.unwrap();
        let idle = storage.create(init("idle.txt", 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        storage.write(chunk(&touched.id, 0, b"a")).await.unwrap();

        let purged = storage.purge(Some(Duration::from_millis(25))).await.unwrap();
        let ids: Vec<_> = purged.iter().map(|f| f.id.clone()).collect();
        assert_eq!(ids, vec![idle.id]);
        assert!(storage.exists(&touched.id).await);
    }
}
