//! Single-request uploads from HTML forms.
//!
//! `multipart/form-data` bodies are parsed with multer and the file field is
//! streamed straight into storage. `application/x-www-form-urlencoded` bodies
//! are buffered; the file field's value is the content.

use crate::{
    errors::{ErrorCode, UploadError, UploadResult},
    handlers::{RequestHandler, UploadRequest, UploadResponse, parse_form, serve_get},
    models::{
        BodyStream, File, FileInit, FilePart,
        metadata::{Metadata, merge_metadata},
    },
    services::BaseStorage,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use http::{Method, StatusCode, header};
use multer::{Constraints, Multipart, SizeLimit};
use serde_json::{Value, json};
use std::{io, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_FILE_FIELD: &str = "file";

const METHODS: &[Method] = &[Method::POST, Method::DELETE, Method::GET];

pub struct MultipartHandler {
    storage: Arc<dyn BaseStorage>,
    base_path: String,
    file_field: String,
}

impl MultipartHandler {
    pub fn new(storage: Arc<dyn BaseStorage>, base_path: impl Into<String>) -> Self {
        Self {
            storage,
            base_path: base_path.into(),
            file_field: DEFAULT_FILE_FIELD.into(),
        }
    }

    /// Name of the form field that carries the file.
    pub fn file_field(mut self, name: impl Into<String>) -> Self {
        self.file_field = name.into();
        self
    }

    fn max_size(&self) -> u64 {
        self.storage.core().config.max_upload_size
    }

    fn max_fields_size(&self) -> u64 {
        self.storage.core().config.max_metadata_size as u64
    }

    async fn post(&self, mut req: UploadRequest) -> UploadResult<UploadResponse> {
        let file = match req.content_type().as_deref() {
            Some("multipart/form-data") => self.post_multipart(&mut req).await?,
            Some("application/x-www-form-urlencoded") => self.post_urlencoded(&mut req).await?,
            other => {
                return Err(UploadError::with_message(
                    ErrorCode::UnsupportedMediaType,
                    format!("unsupported form type `{}`", other.unwrap_or_default()),
                ));
            }
        };
        Ok(UploadResponse::json(StatusCode::OK, serde_json::to_value(&file)?)
            .header(header::LOCATION.as_str(), self.location(&file.id)))
    }

    async fn post_multipart(&self, req: &mut UploadRequest) -> UploadResult<File> {
        let content_type = req
            .header_str(header::CONTENT_TYPE.as_str())
            .unwrap_or_default()
            .to_string();
        let boundary = multer::parse_boundary(&content_type)
            .map_err(|err| UploadError::bad_request(format!("invalid multipart body: {err}")))?;
        let body: BodyStream = match req.take_body() {
            Some(body) => body,
            None => Box::pin(stream::empty::<io::Result<Bytes>>()),
        };
        // the file field is capped by the write itself so an oversized file
        // surfaces as 413 rather than a broken stream
        let limits = SizeLimit::new()
            .per_field(self.max_fields_size())
            .for_field(self.file_field.clone(), u64::MAX);
        let mut multipart =
            Multipart::with_constraints(body, boundary, Constraints::new().size_limit(limits));

        let mut fields = Metadata::new();
        let mut written: Option<File> = None;
        while let Some(field) = multipart.next_field().await.map_err(form_error)? {
            let name = field.name().unwrap_or_default().to_string();
            if name == self.file_field && written.is_none() {
                let mut init = FileInit::from_metadata(fields.clone());
                if init.original_name.is_empty() {
                    init.original_name = field.file_name().unwrap_or(DEFAULT_FILE_FIELD).to_string();
                }
                if init.content_type.is_none() {
                    init.content_type = field.content_type().map(|m| m.essence_str().to_string());
                }
                let content: BodyStream = Box::pin(field.map(|chunk| chunk.map_err(io::Error::other)));
                written = Some(self.store(init, content, req.abort.clone()).await?);
                continue;
            }
            let text = field.text().await.map_err(form_error)?;
            collect_field(&mut fields, name, text)?;
        }

        let file = written.ok_or_else(|| {
            UploadError::bad_request(format!("form has no `{}` field", self.file_field))
        })?;
        self.finish_upload(file, fields).await
    }

    async fn post_urlencoded(&self, req: &mut UploadRequest) -> UploadResult<File> {
        let limit = self.max_size().saturating_add(self.max_fields_size());
        let raw = req.read_body(limit).await?;
        let raw = std::str::from_utf8(&raw)
            .map_err(|_| UploadError::bad_request("form body is not valid UTF-8"))?;
        let pairs = parse_form(raw)?;

        let mut fields = Metadata::new();
        let mut content = None;
        for (name, value) in pairs {
            if name == self.file_field && content.is_none() {
                content = Some(value);
            } else {
                collect_field(&mut fields, name, value)?;
            }
        }
        let content = content.ok_or_else(|| {
            UploadError::bad_request(format!("form has no `{}` field", self.file_field))
        })?;

        let mut init = FileInit::from_metadata(fields.clone());
        if init.original_name.is_empty() {
            init.original_name = DEFAULT_FILE_FIELD.into();
        }
        init.size = Some(content.len() as u64);
        let body: BodyStream = Box::pin(stream::iter(vec![Ok::<_, io::Error>(Bytes::from(content))]));
        let file = self.store(init, body, req.abort.clone()).await?;
        self.finish_upload(file, fields).await
    }

    async fn store(
        &self,
        init: FileInit,
        body: BodyStream,
        abort: CancellationToken,
    ) -> UploadResult<File> {
        let file = self.storage.create(init).await?;
        let part = FilePart::new(&file.id)
            .at(0)
            .with_body(body, file.size)
            .with_abort(abort);
        match self.storage.write(part).await {
            Ok(file) => Ok(file),
            Err(err) => {
                if err.code != ErrorCode::RequestAborted {
                    if let Err(cleanup) = self.storage.delete(&file.id).await {
                        debug!(id = %file.id, error = %cleanup, "could not discard failed form upload");
                    }
                }
                Err(err)
            }
        }
    }

    /// Settle the final size, then merge every sidecar field.
    async fn finish_upload(&self, file: File, fields: Metadata) -> UploadResult<File> {
        let mut part = FilePart::new(&file.id).at(file.bytes_written);
        if file.size.is_none() {
            part.size = Some(file.bytes_written);
        }
        let file = self.storage.write(part).await?;
        if !fields.is_empty() {
            self.storage
                .update(&file.id, json!({ "metadata": fields }))
                .await?;
        }
        debug!(id = %file.id, size = file.bytes_written, "form upload stored");
        self.storage.get_meta(&file.id).await
    }
}

/// `metadata` holds a JSON object merged as-is; anything else is stored by name.
fn collect_field(fields: &mut Metadata, name: String, text: String) -> UploadResult<()> {
    if name == "metadata" {
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => merge_metadata(fields, map),
            _ => return Err(UploadError::bad_request("`metadata` field must be a JSON object")),
        }
    } else if !name.is_empty() {
        fields.insert(name, Value::String(text));
    }
    Ok(())
}

fn form_error(err: multer::Error) -> UploadError {
    match err {
        multer::Error::FieldSizeExceeded { .. } | multer::Error::StreamSizeExceeded { .. } => {
            UploadError::with_message(ErrorCode::RequestEntityTooLarge, err.to_string())
        }
        multer::Error::StreamReadFailed(_) => UploadError::new(ErrorCode::RequestAborted),
        other => UploadError::bad_request(format!("invalid multipart body: {other}")),
    }
}

#[async_trait]
impl RequestHandler for MultipartHandler {
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
            Method::DELETE => {
                let id = req.require_id()?;
                self.storage.delete(&id).await?;
                Ok(UploadResponse::new(StatusCode::NO_CONTENT))
            }
            Method::GET => serve_get(self.storage.as_ref(), req.id()).await,
            _ => Err(UploadError::new(ErrorCode::MethodNotAllowed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_field_is_merged() {
        let mut fields = Metadata::new();
        collect_field(&mut fields, "metadata".into(), r#"{"a":{"b":1}}"#.into()).unwrap();
        collect_field(&mut fields, "metadata".into(), r#"{"a":{"c":2}}"#.into()).unwrap();
        collect_field(&mut fields, "note".into(), "hi".into()).unwrap();
        assert_eq!(fields["a"], json!({"b": 1, "c": 2}));
        assert_eq!(fields["note"], "hi");
        assert!(collect_field(&mut fields, "metadata".into(), "[1]".into()).is_err());
    }
}
