//! The upload entity and the value objects used to create and write it.

use crate::models::{checksum::Checksum, metadata::Metadata};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::{fmt, io, pin::Pin};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Byte stream feeding a write or produced by a read.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Lifecycle state of an upload.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    #[default]
    Created,
    Part,
    Completed,
    Updated,
    Deleted,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Part => "part",
            Self::Completed => "completed",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A single upload and everything the engine knows about it.
///
/// The data bytes live in the storage backend under `name`; this struct is
/// what gets persisted to the metadata store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// Logical identifier, never changes after the first save.
    pub id: String,

    /// Physical storage key under the storage root.
    pub name: String,

    /// Human-facing name supplied by the client.
    #[serde(default)]
    pub original_name: String,

    pub content_type: String,

    /// Declared total size; `None` while the length is deferred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default)]
    pub bytes_written: u64,

    #[serde(default)]
    pub status: UploadStatus,

    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ETag")]
    pub etag: Option<String>,

    /// Last verified chunk digest, as `<algorithm> <digest>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl File {
    /// Build a fresh, not yet persisted file from a creation request.
    pub fn from_init(init: &FileInit) -> Self {
        let id = init.id.clone().unwrap_or_else(|| generate_id(init));
        Self {
            name: id.clone(),
            id,
            original_name: init.original_name.clone(),
            content_type: init
                .content_type
                .clone()
                .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string()),
            size: init.size,
            bytes_written: 0,
            status: UploadStatus::Created,
            metadata: init.metadata.clone(),
            user_id: init.user_id.clone(),
            created_at: None,
            modified_at: None,
            expired_at: None,
            etag: None,
            hash: None,
        }
    }

    /// Status implied by the byte counter alone.
    pub fn derived_status(&self) -> UploadStatus {
        match self.size {
            Some(size) if self.bytes_written >= size => UploadStatus::Completed,
            _ if self.bytes_written > 0 => UploadStatus::Part,
            _ => UploadStatus::Created,
        }
    }

    /// Status after a write. With manual completion the counter never
    /// completes the upload; it only marks the first bytes.
    pub fn settled_status(&self, manual_completion: bool) -> UploadStatus {
        match self.status {
            _ if !manual_completion => self.derived_status(),
            UploadStatus::Created if self.bytes_written > 0 => UploadStatus::Part,
            status => status,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == UploadStatus::Completed
    }

    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some_and(|at| at <= Utc::now())
    }

    /// Copy of this file tagged with `status`.
    pub fn tagged(&self, status: UploadStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Parameters for creating an upload.
#[derive(Clone, Debug, Default)]
pub struct FileInit {
    /// Explicit id; generated from the other fields when absent.
    pub id: Option<String>,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    /// Client-side modification time in milliseconds since the epoch.
    pub last_modified: Option<i64>,
    pub user_id: Option<String>,
    pub metadata: Metadata,
}

impl FileInit {
    /// Pull the common fields out of client metadata.
    pub fn from_metadata(metadata: Metadata) -> Self {
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| metadata.get(*k))
                .and_then(|v| match v {
                    serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
        };
        let original_name = text(&["originalName", "name", "filename", "title"]).unwrap_or_default();
        let content_type = text(&["contentType", "mimeType", "type", "filetype"]);
        let last_modified = text(&["lastModified"]).and_then(|v| v.parse().ok());
        let size = text(&["size"]).and_then(|v| v.parse().ok());
        Self {
            original_name,
            content_type,
            size,
            last_modified,
            metadata,
            ..Self::default()
        }
    }
}

/// Derive an id from the logical source of an upload.
///
/// The same (user, name, size, last-modified) always yields the same id so that
/// repeated creation requests resolve to one upload. Without a last-modified
/// stamp there is nothing stable to key on, so a random component is mixed in.
pub fn generate_id(init: &FileInit) -> String {
    let stamp = init
        .last_modified
        .map(|ms| ms.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let size = init.size.map(|s| s.to_string()).unwrap_or_default();
    let key = format!(
        "{}/{}/{}/{}",
        init.user_id.as_deref().unwrap_or_default(),
        init.original_name,
        size,
        stamp
    );
    format!("{:x}", md5::compute(key))
}

/// A chunk write request.
///
/// `body == None` is a zero-length write, used to recompute completion state.
#[derive(Default)]
pub struct FilePart {
    pub id: String,
    /// Byte offset where the chunk starts; defaults to the current end.
    pub start: Option<u64>,
    /// Declared chunk length; the write fails once more bytes arrive.
    pub content_length: Option<u64>,
    /// Total size to commit if the upload has none yet.
    pub size: Option<u64>,
    pub checksum: Option<Checksum>,
    pub body: Option<BodyStream>,
    pub abort: Option<CancellationToken>,
    /// The caller decides completion; the write only moves `Created` to `Part`.
    pub manual_completion: bool,
}

impl FilePart {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, start: u64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_body(mut self, body: BodyStream, content_length: Option<u64>) -> Self {
        self.body = Some(body);
        self.content_length = content_length;
        self
    }

    pub fn with_checksum(mut self, checksum: Option<Checksum>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn with_manual_completion(mut self) -> Self {
        self.manual_completion = true;
        self
    }
}

impl fmt::Debug for FilePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePart")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("content_length", &self.content_length)
            .field("size", &self.size)
            .field("checksum", &self.checksum)
            .field("has_body", &self.body.is_some())
            .field("manual_completion", &self.manual_completion)
            .finish()
    }
}

/// Lightweight listing entry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileListItem {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}
