//! tus 1.0.0 resumable uploads.
//!
//! Extensions: creation, creation-with-upload, creation-defer-length,
//! termination, checksum, concatenation, expiration.

use crate::{
    errors::{ErrorCode, UploadError, UploadResult},
    handlers::{RequestHandler, UploadRequest, UploadResponse, is_internal_key, serve_get},
    models::{
        Checksum, ChecksumAlgorithm, File, FileInit, FilePart,
        metadata::{Metadata, TokenValue, decode_tokens, encode_tokens},
    },
    services::BaseStorage,
};
use async_trait::async_trait;
use http::{Method, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &[&str] = &[
    "creation",
    "creation-with-upload",
    "creation-defer-length",
    "termination",
    "checksum",
    "concatenation",
    "expiration",
];
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

pub(crate) const META_CONCAT: &str = "uploadConcat";
pub(crate) const META_PARTS: &str = "concatParts";
pub(crate) const META_DEFER: &str = "deferLength";

const METHODS: &[Method] = &[
    Method::OPTIONS,
    Method::HEAD,
    Method::POST,
    Method::PATCH,
    Method::DELETE,
    Method::GET,
];

/// Value of an `Upload-Concat` header.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Concat {
    Partial,
    Final(Vec<String>),
}

pub struct TusHandler {
    storage: Arc<dyn BaseStorage>,
    base_path: String,
    terminate_completed: bool,
    extensions: Vec<&'static str>,
}

impl TusHandler {
    pub fn new(storage: Arc<dyn BaseStorage>, base_path: impl Into<String>) -> Self {
        Self {
            storage,
            base_path: base_path.into(),
            terminate_completed: true,
            extensions: TUS_EXTENSIONS.to_vec(),
        }
    }

    /// Whether DELETE may remove uploads that already completed.
    pub fn terminate_completed(mut self, allow: bool) -> Self {
        self.terminate_completed = allow;
        self
    }

    /// Stop advertising and serving one extension. Requests that need it
    /// answer 501.
    pub fn disable_extension(mut self, name: &str) -> Self {
        self.extensions.retain(|ext| *ext != name);
        self
    }

    fn require(&self, extension: &str) -> UploadResult<()> {
        if self.extensions.contains(&extension) {
            return Ok(());
        }
        Err(UploadError::with_message(
            ErrorCode::ExtensionNotSupported,
            format!("tus extension `{extension}` is not enabled"),
        ))
    }

    fn set_expires(&self, response: &mut UploadResponse, file: &File) {
        if self.extensions.contains(&"expiration") {
            set_expires(response, file);
        }
    }

    fn parse_concat(&self, raw: &str) -> UploadResult<Concat> {
        if raw == "partial" {
            return Ok(Concat::Partial);
        }
        let Some(urls) = raw.strip_prefix("final;") else {
            return Err(UploadError::bad_request(format!("invalid Upload-Concat `{raw}`")));
        };
        let ids: Vec<String> = urls
            .split_whitespace()
            .map(|url| self.id_from_url(url))
            .collect();
        if ids.is_empty() {
            return Err(UploadError::bad_request("Upload-Concat final lists no uploads"));
        }
        Ok(Concat::Final(ids))
    }

    /// Accepts absolute URLs, paths under the base path, or bare ids.
    fn id_from_url(&self, url: &str) -> String {
        let prefix = format!("{}/", self.base_path.trim_end_matches('/'));
        match url.find(&prefix) {
            Some(pos) => url[pos + prefix.len()..].to_string(),
            None => url.trim_start_matches('/').to_string(),
        }
    }

    async fn load(&self, id: &str) -> UploadResult<File> {
        let file = self.storage.get_meta(id).await?;
        self.storage.check_if_expired(file).await
    }

    fn options(&self) -> UploadResponse {
        let algorithms: Vec<&str> = ChecksumAlgorithm::ALL.iter().map(|a| a.as_str()).collect();
        UploadResponse::new(StatusCode::NO_CONTENT)
            .header("tus-version", TUS_VERSION)
            .header("tus-extension", self.extensions.join(","))
            .header(
                "tus-max-size",
                self.storage.core().config.max_upload_size.to_string(),
            )
            .header("tus-checksum-algorithm", algorithms.join(","))
    }

    async fn post(&self, mut req: UploadRequest) -> UploadResult<UploadResponse> {
        self.require("creation")?;
        let concat = req
            .header_str("upload-concat")
            .map(|raw| {
                self.require("concatenation")?;
                self.parse_concat(raw)
            })
            .transpose()?;
        let length = req.header_u64("upload-length")?;
        let defer = match req.header_str("upload-defer-length") {
            None => false,
            Some("1") => {
                self.require("creation-defer-length")?;
                true
            }
            Some(other) => {
                return Err(UploadError::bad_request(format!(
                    "invalid Upload-Defer-Length `{other}`"
                )));
            }
        };
        let metadata = match req.header_str("upload-metadata") {
            Some(raw) => decode_tokens(raw, TokenValue::Raw)?,
            None => Metadata::new(),
        };

        let partial = concat == Some(Concat::Partial);
        if let Some(Concat::Final(ids)) = concat {
            if length.is_some() {
                return Err(UploadError::bad_request(
                    "Upload-Length must not be set on a final upload",
                ));
            }
            return self.concatenate(ids, metadata).await;
        }

        if length.is_some() == defer {
            return Err(UploadError::bad_request(
                "exactly one of Upload-Length or Upload-Defer-Length is required",
            ));
        }

        let mut init = FileInit::from_metadata(metadata);
        init.size = length;
        if defer {
            init.metadata.insert(META_DEFER.into(), json!(true));
        }
        if partial {
            init.metadata.insert(META_CONCAT.into(), json!("partial"));
        }

        let mut file = self.storage.create(init).await?;
        let resumed = file.bytes_written > 0;
        if req.content_type().as_deref() == Some(OFFSET_CONTENT_TYPE) && !resumed {
            if let Some(body) = req.take_body() {
                self.require("creation-with-upload")?;
                let part = FilePart::new(&file.id)
                    .at(0)
                    .with_body(body, req.content_length()?)
                    .with_checksum(self.checksum(&req)?)
                    .with_abort(req.abort.clone());
                file = self.storage.write(part).await?;
            }
        }

        let status = if resumed { StatusCode::OK } else { StatusCode::CREATED };
        let mut response = UploadResponse::new(status)
            .header(header::LOCATION.as_str(), self.location(&file.id))
            .header("upload-offset", file.bytes_written.to_string());
        self.set_expires(&mut response, &file);
        Ok(response)
    }

    /// Build a final upload out of completed partial uploads, in order.
    async fn concatenate(&self, ids: Vec<String>, metadata: Metadata) -> UploadResult<UploadResponse> {
        let mut parts = Vec::with_capacity(ids.len());
        for id in &ids {
            let file = self.load(id).await.map_err(|err| {
                UploadError::conflict(format!("partial upload `{id}` is unavailable: {}", err.message))
            })?;
            if file.metadata.get(META_CONCAT) != Some(&json!("partial")) {
                return Err(UploadError::conflict(format!("upload `{id}` is not a partial upload")));
            }
            if !file.is_completed() {
                return Err(UploadError::conflict(format!("partial upload `{id}` is not complete")));
            }
            parts.push(file);
        }
        let total: u64 = parts.iter().map(|p| p.bytes_written).sum();

        let mut init = FileInit::from_metadata(metadata);
        init.size = Some(total);
        init.metadata.insert(META_CONCAT.into(), json!("final"));
        init.metadata.insert(META_PARTS.into(), json!(ids));
        let mut file = self.storage.create(init).await?;

        let mut offset = 0;
        for part in &parts {
            let stream = self.storage.get_stream(&part.id).await?;
            let len = stream.content_length;
            file = self
                .storage
                .write(FilePart::new(&file.id).at(offset).with_body(stream.body, Some(len)))
                .await?;
            offset += len;
        }
        // an empty set of fragments still needs its completion recorded
        if total == 0 {
            file = self.storage.write(FilePart::new(&file.id).at(0)).await?;
        }
        info!(id = %file.id, parts = parts.len(), size = total, "concatenated upload");

        let mut response = UploadResponse::new(StatusCode::CREATED)
            .header(header::LOCATION.as_str(), self.location(&file.id))
            .header("upload-offset", file.bytes_written.to_string());
        self.set_expires(&mut response, &file);
        Ok(response)
    }

    async fn patch(&self, mut req: UploadRequest) -> UploadResult<UploadResponse> {
        let id = req.require_id()?;
        if req.content_type().as_deref() != Some(OFFSET_CONTENT_TYPE) {
            return Err(UploadError::with_message(
                ErrorCode::UnsupportedMediaType,
                format!("Content-Type must be {OFFSET_CONTENT_TYPE}"),
            ));
        }
        let offset = req
            .header_u64("upload-offset")?
            .ok_or_else(|| UploadError::bad_request("Upload-Offset header is required"))?;
        let length = req.header_u64("upload-length")?;
        let checksum = self.checksum(&req)?;

        let file = self.load(&id).await?;
        if file.metadata.get(META_CONCAT) == Some(&json!("final")) {
            return Err(UploadError::with_message(
                ErrorCode::Forbidden,
                "final uploads cannot be patched",
            ));
        }
        if offset != file.bytes_written {
            return Err(UploadError::conflict(format!(
                "Upload-Offset {offset} does not match current offset {}",
                file.bytes_written
            )));
        }
        if let Some(length) = length {
            if file.size.is_some() {
                return Err(UploadError::conflict("upload length is already set"));
            }
            if length < file.bytes_written {
                return Err(UploadError::conflict(format!(
                    "Upload-Length {length} is smaller than the current offset"
                )));
            }
            debug!(id, length, "committing deferred length");
        }

        let mut part = FilePart::new(&id)
            .at(offset)
            .with_checksum(checksum)
            .with_abort(req.abort.clone());
        part.size = length;
        if let Some(body) = req.take_body() {
            part = part.with_body(body, req.content_length()?);
        }
        let file = self.storage.write(part).await?;

        let mut response = UploadResponse::new(StatusCode::NO_CONTENT)
            .header("upload-offset", file.bytes_written.to_string());
        self.set_expires(&mut response, &file);
        Ok(response)
    }

    async fn head(&self, req: UploadRequest) -> UploadResult<UploadResponse> {
        let id = req.require_id()?;
        let file = self.load(&id).await?;

        let mut response = UploadResponse::new(StatusCode::OK)
            .header("upload-offset", file.bytes_written.to_string())
            .header(header::CACHE_CONTROL.as_str(), "no-store");
        match file.size {
            Some(size) => response.set_header("upload-length", size.to_string()),
            None => response.set_header("upload-defer-length", "1"),
        }

        let user_metadata: Metadata = file
            .metadata
            .iter()
            .filter(|(key, _)| !is_internal_key(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !user_metadata.is_empty() {
            response.set_header("upload-metadata", encode_tokens(&user_metadata, TokenValue::Raw));
        }

        match file.metadata.get(META_CONCAT).and_then(Value::as_str) {
            Some("partial") => response.set_header("upload-concat", "partial"),
            Some("final") => {
                let urls: Vec<String> = file
                    .metadata
                    .get(META_PARTS)
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .map(|id| self.location(id))
                            .collect()
                    })
                    .unwrap_or_default();
                response.set_header("upload-concat", format!("final;{}", urls.join(" ")));
            }
            _ => {}
        }
        self.set_expires(&mut response, &file);
        Ok(response)
    }

    async fn delete(&self, req: UploadRequest) -> UploadResult<UploadResponse> {
        self.require("termination")?;
        let id = req.require_id()?;
        let file = self.load(&id).await?;
        if file.is_completed() && !self.terminate_completed {
            return Err(UploadError::with_message(
                ErrorCode::Forbidden,
                "completed uploads cannot be terminated",
            ));
        }
        self.storage.delete(&id).await?;
        Ok(UploadResponse::new(StatusCode::NO_CONTENT))
    }

    fn checksum(&self, req: &UploadRequest) -> UploadResult<Option<Checksum>> {
        req.header_str("upload-checksum")
            .map(|raw| {
                self.require("checksum")?;
                Checksum::parse(raw, None)
            })
            .transpose()
    }
}

fn set_expires(response: &mut UploadResponse, file: &File) {
    if let Some(expires) = file.expired_at {
        response.set_header("upload-expires", expires.to_rfc2822());
    }
}

#[async_trait]
impl RequestHandler for TusHandler {
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
        if req.method == Method::OPTIONS {
            return Ok(self.options());
        }
        if req.method == Method::GET {
            return serve_get(self.storage.as_ref(), req.id()).await;
        }
        match req.header_str("tus-resumable") {
            Some(TUS_VERSION) => {}
            other => {
                return Err(UploadError::with_message(
                    ErrorCode::UnsupportedVersion,
                    format!("unsupported Tus-Resumable `{}`", other.unwrap_or_default()),
                ));
            }
        }
        match req.method {
            Method::POST => self.post(req).await,
            Method::PATCH => self.patch(req).await,
            Method::HEAD => self.head(req).await,
            Method::DELETE => self.delete(req).await,
            _ => Err(UploadError::new(ErrorCode::MethodNotAllowed)),
        }
    }

    fn finish(&self, response: &mut UploadResponse) {
        response.set_header("tus-resumable", TUS_VERSION);
        if response.status == StatusCode::PRECONDITION_FAILED {
            response.set_header("tus-version", TUS_VERSION);
        }
    }
}
