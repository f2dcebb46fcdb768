//! Metadata persistence.
//!
//! Each upload's `File` record is stored as a JSON sidecar next to the data,
//! under `{directory}/{id}{suffix}`. The `metadata` map inside the sidecar is
//! written as a token list (`key base64(json)`, comma separated).

use crate::{
    errors::{ErrorCode, UploadError, UploadResult},
    models::{
        File,
        metadata::{TokenValue, decode_tokens, encode_tokens},
    },
};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

const MAX_ID_LEN: usize = 1024;

/// Backend-agnostic store for upload records keyed by id.
#[async_trait]
pub trait MetaStorage: Send + Sync {
    async fn save(&self, id: &str, file: &File) -> UploadResult<()>;
    async fn get(&self, id: &str) -> UploadResult<File>;
    async fn delete(&self, id: &str) -> UploadResult<()>;
    /// Ids of every stored record.
    async fn list(&self) -> UploadResult<Vec<String>>;

    /// Reject ids this store cannot hold.
    fn check_id(&self, id: &str) -> UploadResult<()> {
        ensure_id_safe(id)
    }
}

/// Reject ids that could escape the storage root.
pub fn ensure_id_safe(id: &str) -> UploadResult<()> {
    let bad = id.is_empty()
        || id.len() > MAX_ID_LEN
        || id.starts_with('/')
        || id.contains("..")
        || id
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
    if bad {
        return Err(UploadError::with_message(
            ErrorCode::BadRequest,
            format!("invalid upload id `{id}`"),
        ));
    }
    Ok(())
}

/// Sidecar-file implementation of [`MetaStorage`].
#[derive(Debug, Clone)]
pub struct DiskMetaStorage {
    directory: PathBuf,
    suffix: String,
}

impl DiskMetaStorage {
    pub fn new(directory: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            suffix: suffix.into(),
        }
    }

    /// True if `path` names a metadata sidecar.
    fn is_meta_path(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&self.suffix))
    }

    /// Names the store keeps for itself: sidecars and in-flight temp files.
    pub fn is_reserved_name(&self, name: &str) -> bool {
        name.ends_with(&self.suffix) || name.starts_with(".tmp-") || name.starts_with(".probe-")
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.directory.join(format!("{id}{}", self.suffix))
    }

    fn encode(file: &File) -> UploadResult<Vec<u8>> {
        let mut record = serde_json::to_value(file)?;
        record["metadata"] = Value::String(encode_tokens(&file.metadata, TokenValue::Json));
        Ok(serde_json::to_vec_pretty(&record)?)
    }

    fn decode(raw: &[u8]) -> UploadResult<File> {
        let mut record: Value = serde_json::from_slice(raw)?;
        if let Some(Value::String(tokens)) = record.get("metadata") {
            let metadata = decode_tokens(tokens, TokenValue::Json)?;
            record["metadata"] = Value::Object(metadata);
        }
        Ok(serde_json::from_value(record)?)
    }
}

#[async_trait]
impl MetaStorage for DiskMetaStorage {
    fn check_id(&self, id: &str) -> UploadResult<()> {
        ensure_id_safe(id)?;
        if id.split('/').any(|segment| self.is_reserved_name(segment)) {
            return Err(UploadError::with_message(
                ErrorCode::BadRequest,
                format!("upload id `{id}` uses a reserved name"),
            ));
        }
        Ok(())
    }

    async fn save(&self, id: &str, file: &File) -> UploadResult<()> {
        self.check_id(id)?;
        let path = self.meta_path(id);
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            UploadError::from(io::Error::other("metadata path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;

        let bytes = Self::encode(file)?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = fs::File::create(&tmp_path).await?;
        if let Err(err) = out.write_all(&bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = out.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> UploadResult<File> {
        self.check_id(id)?;
        match fs::read(self.meta_path(id)).await {
            Ok(raw) => Self::decode(&raw),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(UploadError::not_found(format!("upload `{id}` not found")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, id: &str) -> UploadResult<()> {
        self.check_id(id)?;
        match fs::remove_file(self.meta_path(id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(id, "metadata already missing");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> UploadResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut pending = vec![self.directory.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !self.is_meta_path(&path) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&self.directory) {
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    ids.push(rel.trim_end_matches(self.suffix.as_str()).to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
