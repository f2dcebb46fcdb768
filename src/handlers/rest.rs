//! Offset-addressed chunked uploads over plain HTTP headers.
//!
//! ```text
//! POST   /upload            X-Chunked-Upload: true, X-Total-Size, X-File-Metadata
//! PATCH  /upload/{id}       X-Chunk-Offset, Content-Length, X-Chunk-Checksum
//! PUT    /upload/{id}       full replacement
//! HEAD   /upload/{id}       progress
//! DELETE /upload/{id}       single delete
//! DELETE /upload?ids=a,b    batch delete (or a JSON array body)
//! ```
//!
//! Completion of a chunked upload is decided by the recorded chunk ranges,
//! not by the byte counter: chunks can arrive out of order or be retried.

use crate::{
    errors::{ErrorCode, UploadError, UploadResult},
    handlers::{RequestHandler, UploadRequest, UploadResponse, is_internal_key, serve_get},
    models::{
        Checksum, ChecksumAlgorithm, File, FileInit, FilePart, UploadStatus,
        metadata::{Metadata, merge_metadata},
    },
    services::BaseStorage,
};
use async_trait::async_trait;
use http::{Method, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

pub(crate) const META_CHUNKS: &str = "chunks";
pub(crate) const META_CHUNKED: &str = "chunked";

const MAX_BATCH_BODY: u64 = 1024 * 1024;

const METHODS: &[Method] = &[
    Method::POST,
    Method::PATCH,
    Method::PUT,
    Method::HEAD,
    Method::DELETE,
    Method::GET,
];

/// One accepted chunk, as recorded in the upload's metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkRange {
    pub offset: u64,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ChunkRange {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// End of the contiguous range covered from offset 0.
///
/// Ranges are sorted by offset and merged while they overlap or touch; the
/// walk stops at the first gap.
pub fn contiguous_end(chunks: &[ChunkRange]) -> u64 {
    let mut ranges: Vec<(u64, u64)> = chunks.iter().map(|c| (c.offset, c.end())).collect();
    ranges.sort_unstable();
    let mut end = 0;
    for (start, stop) in ranges {
        if start > end {
            break;
        }
        end = end.max(stop);
    }
    end
}

pub fn is_complete(chunks: &[ChunkRange], size: u64) -> bool {
    contiguous_end(chunks) >= size
}

/// Record a chunk, replacing only the checksum of an identical range.
fn record_chunk(chunks: &mut Vec<ChunkRange>, chunk: ChunkRange) {
    match chunks
        .iter_mut()
        .find(|c| c.offset == chunk.offset && c.length == chunk.length)
    {
        Some(existing) => {
            if existing.checksum != chunk.checksum {
                existing.checksum = chunk.checksum;
            }
        }
        None => chunks.push(chunk),
    }
}

fn chunks_of(file: &File) -> Vec<ChunkRange> {
    file.metadata
        .get(META_CHUNKS)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

fn is_chunked(file: &File) -> bool {
    file.metadata.get(META_CHUNKED) == Some(&Value::Bool(true))
}

/// User-visible view of a file: protocol bookkeeping is left out.
fn public_json(file: &File) -> Value {
    let mut value = serde_json::to_value(file).unwrap_or_default();
    if let Some(Value::Object(metadata)) = value.get_mut("metadata") {
        metadata.retain(|key, _| !is_internal_key(key));
    }
    value
}

pub struct RestHandler {
    storage: Arc<dyn BaseStorage>,
    base_path: String,
    max_chunk_size: u64,
}

impl RestHandler {
    pub fn new(storage: Arc<dyn BaseStorage>, base_path: impl Into<String>) -> Self {
        Self {
            storage,
            base_path: base_path.into(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }

    pub fn max_chunk_size(mut self, bytes: u64) -> Self {
        self.max_chunk_size = bytes;
        self
    }

    async fn load(&self, id: &str) -> UploadResult<File> {
        let file = self.storage.get_meta(id).await?;
        self.storage.check_if_expired(file).await
    }

    fn file_metadata(req: &UploadRequest) -> UploadResult<Metadata> {
        match req.header_str("x-file-metadata") {
            None => Ok(Metadata::new()),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Ok(map),
                _ => Err(UploadError::bad_request("X-File-Metadata must be a JSON object")),
            },
        }
    }

    fn checksum(req: &UploadRequest) -> UploadResult<Option<Checksum>> {
        req.header_str("x-chunk-checksum")
            .map(|raw| Checksum::parse(raw, Some(ChecksumAlgorithm::Md5)))
            .transpose()
    }

    fn init_from(req: &UploadRequest) -> UploadResult<FileInit> {
        let mut init = FileInit::from_metadata(Self::file_metadata(req)?);
        if let Some(size) = req.header_u64("x-total-size")? {
            init.size = Some(size);
        }
        Ok(init)
    }

    async fn post(&self, mut req: UploadRequest) -> UploadResult<UploadResponse> {
        let chunked = matches!(req.header_str("x-chunked-upload"), Some("true" | "1"));
        let mut init = Self::init_from(&req)?;

        if chunked {
            if init.size.is_none() {
                return Err(UploadError::with_message(
                    ErrorCode::InvalidFileSize,
                    "X-Total-Size is required for chunked uploads",
                ));
            }
            init.metadata.insert(META_CHUNKED.into(), Value::Bool(true));
            let file = self.storage.create(init).await?;
            debug!(id = %file.id, size = ?file.size, "chunked upload reserved");
            return Ok(UploadResponse::json(StatusCode::CREATED, public_json(&file))
                .header(header::LOCATION.as_str(), self.location(&file.id))
                .header("x-upload-id", &file.id));
        }

        let content_length = req.content_length()?;
        init.size = init.size.or(content_length);
        if init.size.is_none() {
            return Err(UploadError::with_message(
                ErrorCode::InvalidFileSize,
                "Content-Length or X-Total-Size is required",
            ));
        }
        if init.content_type.is_none() {
            init.content_type = req.content_type();
        }
        let mut file = self.storage.create(init).await?;
        if !file.is_completed() {
            let mut part = FilePart::new(&file.id)
                .at(0)
                .with_checksum(Self::checksum(&req)?)
                .with_abort(req.abort.clone());
            if let Some(body) = req.take_body() {
                part = part.with_body(body, content_length);
            }
            file = self.storage.write(part).await?;
        }
        Ok(UploadResponse::json(StatusCode::CREATED, public_json(&file))
            .header(header::LOCATION.as_str(), self.location(&file.id)))
    }

    async fn patch(&self, mut req: UploadRequest) -> UploadResult<UploadResponse> {
        let id = req.require_id()?;
        let offset = req
            .header_u64("x-chunk-offset")?
            .ok_or_else(|| UploadError::bad_request("X-Chunk-Offset header is required"))?;
        let length = req.content_length()?.unwrap_or(0);
        if length == 0 {
            return Err(UploadError::with_message(
                ErrorCode::InvalidRange,
                "chunk must not be empty",
            ));
        }
        if length > self.max_chunk_size {
            return Err(UploadError::with_message(
                ErrorCode::RequestEntityTooLarge,
                format!("chunk exceeds the {} byte limit", self.max_chunk_size),
            ));
        }
        let checksum = Self::checksum(&req)?;

        // chunk bookkeeping is read-modify-write, so one chunk per upload at a time
        let _guard = self.storage.core().lock_guard(&format!("rest:{id}"))?;
        let file = self.load(&id).await?;
        let size = file
            .size
            .ok_or_else(|| UploadError::conflict("upload has no declared size"))?;
        if offset.saturating_add(length) > size {
            return Err(UploadError::conflict(format!(
                "chunk {offset}+{length} exceeds total size {size}"
            )));
        }

        let was_complete = file.is_completed();
        let mut part = FilePart::new(&id)
            .at(offset)
            .with_checksum(checksum.clone())
            .with_abort(req.abort.clone())
            .with_manual_completion();
        if let Some(body) = req.take_body() {
            part = part.with_body(body, Some(length));
        }
        let mut file = self.storage.write(part).await?;

        let mut chunks = chunks_of(&file);
        record_chunk(
            &mut chunks,
            ChunkRange {
                offset,
                length,
                checksum: checksum.map(|c| c.to_string()),
            },
        );
        let covered = contiguous_end(&chunks);
        let complete = is_complete(&chunks, size);
        check_counter(&file, complete);

        file.metadata.insert(META_CHUNKS.into(), json!(chunks));
        file.metadata.insert(META_CHUNKED.into(), Value::Bool(true));
        file.status = if complete { UploadStatus::Completed } else { UploadStatus::Part };
        let file = self.storage.save_meta(file).await?;
        if complete && !was_complete {
            info!(id = %file.id, size, "chunked upload completed");
            self.storage.core().hooks().on_complete(&file);
        }

        let status = if complete { StatusCode::OK } else { StatusCode::ACCEPTED };
        Ok(progress_headers(
            UploadResponse::json(status, public_json(&file)),
            &file,
            covered,
            complete,
        ))
    }

    /// Replace an upload's content wholesale, creating it when absent.
    async fn put(&self, mut req: UploadRequest) -> UploadResult<UploadResponse> {
        let id = req.require_id()?;
        let mut init = Self::init_from(&req)?;
        let content_length = req.content_length()?;
        init.size = init.size.or(content_length);
        if init.content_type.is_none() {
            init.content_type = req.content_type();
        }

        let replaced = match self.load(&id).await {
            Ok(existing) => {
                let mut metadata = existing.metadata.clone();
                metadata.retain(|key, _| !is_internal_key(key));
                merge_metadata(&mut metadata, init.metadata);
                init.metadata = metadata;
                if init.original_name.is_empty() {
                    init.original_name = existing.original_name.clone();
                }
                true
            }
            Err(err) if matches!(err.code, ErrorCode::FileNotFound | ErrorCode::Gone) => false,
            Err(err) => return Err(err),
        };

        // the new content is staged under its own id and only replaces the
        // current upload once it is fully written
        init.id = Some(Uuid::new_v4().simple().to_string());
        let staged = self.storage.create(init).await?;
        let mut part = FilePart::new(&staged.id)
            .at(0)
            .with_checksum(Self::checksum(&req)?)
            .with_abort(req.abort.clone());
        if staged.size.is_none() {
            part.size = content_length;
        }
        if let Some(body) = req.take_body() {
            part = part.with_body(body, content_length);
        }
        if let Err(err) = self.storage.write(part).await {
            if let Err(cleanup) = self.storage.delete(&staged.id).await {
                debug!(id = %staged.id, error = %cleanup, "could not discard staged replacement");
            }
            return Err(err);
        }
        if replaced {
            self.storage.delete(&id).await?;
        }
        let file = self.storage.move_to(&staged.id, &id).await?;

        let status = if replaced { StatusCode::OK } else { StatusCode::CREATED };
        Ok(UploadResponse::json(status, public_json(&file))
            .header(header::LOCATION.as_str(), self.location(&file.id)))
    }

    async fn head(&self, req: UploadRequest) -> UploadResult<UploadResponse> {
        let id = req.require_id()?;
        let file = self.load(&id).await?;
        let (covered, complete) = if is_chunked(&file) {
            let chunks = chunks_of(&file);
            let covered = contiguous_end(&chunks);
            let complete = file.size.is_some_and(|size| is_complete(&chunks, size));
            check_counter(&file, complete);
            (covered, complete)
        } else {
            (file.bytes_written, file.is_completed())
        };
        let response = UploadResponse::new(StatusCode::OK)
            .header(header::CACHE_CONTROL.as_str(), "no-store");
        Ok(progress_headers(response, &file, covered, complete))
    }

    async fn delete(&self, mut req: UploadRequest) -> UploadResult<UploadResponse> {
        if let Some(id) = req.id() {
            let file = self.storage.delete(&id).await?;
            debug!(id = %file.id, "upload deleted");
            return Ok(UploadResponse::new(StatusCode::NO_CONTENT));
        }

        let mut ids: Vec<String> = req
            .query
            .get("ids")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if ids.is_empty() {
            let body = req.read_body(MAX_BATCH_BODY).await?;
            if !body.is_empty() {
                ids = serde_json::from_slice(&body).map_err(|_| {
                    UploadError::bad_request("batch delete body must be a JSON array of ids")
                })?;
            }
        }
        if ids.is_empty() {
            return Err(UploadError::bad_request("no upload ids given"));
        }

        let result = self.storage.delete_batch(ids).await;
        let status = if result.failed_count == 0 {
            StatusCode::OK
        } else if result.successful_count == 0 {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::MULTI_STATUS
        };
        Ok(UploadResponse::json(status, result.to_json()))
    }
}

/// The byte counter is only a cross-check on chunk-range completeness.
fn check_counter(file: &File, complete: bool) {
    let counter_complete = file.size.is_some_and(|size| file.bytes_written >= size);
    if counter_complete != complete {
        warn!(
            id = %file.id,
            bytes_written = file.bytes_written,
            size = ?file.size,
            complete,
            "byte counter disagrees with chunk coverage"
        );
    }
}

fn progress_headers(
    mut response: UploadResponse,
    file: &File,
    covered: u64,
    complete: bool,
) -> UploadResponse {
    response.set_header("x-chunk-offset", covered.to_string());
    response.set_header("x-upload-complete", complete.to_string());
    response.set_header("x-bytes-written", file.bytes_written.to_string());
    if let Some(size) = file.size {
        response.set_header("x-total-size", size.to_string());
    }
    response
}

#[async_trait]
impl RequestHandler for RestHandler {
    fn storage(&self) -> &Arc<dyn BaseStorage> {
        &self.storage
    }

    fn base_path(&self) -> &str {
        &self.base_path
    }

    fn methods(&self) -> &'static [Method] {
        METHODS
    }

    async fn dispatch(&self, req: UploadRequest) -> UploadResult<UploadResponse> {
        match req.method {
            Method::POST => self.post(req).await,
            Method::PATCH => self.patch(req).await,
            Method::PUT => self.put(req).await,
            Method::HEAD => self.head(req).await,
            Method::DELETE => self.delete(req).await,
            Method::GET => serve_get(self.storage.as_ref(), req.id()).await,
            _ => Err(UploadError::new(ErrorCode::MethodNotAllowed)),
        }
    }
}
