//! Protocol handlers.
//!
//! The HTTP runtime never reaches past this module: routes convert native
//! requests into [`UploadRequest`] and render [`UploadResponse`] back. Each
//! protocol is one variant of [`UploadHandler`], chosen when the router is
//! built.

pub mod health_handlers;
pub mod multipart;
pub mod rest;
pub mod tus;

use crate::{
    errors::{ErrorCode, UploadError, UploadResult},
    models::BodyStream,
    services::BaseStorage,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::{Value, json};
use std::{collections::HashMap, fmt, io, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use multipart::MultipartHandler;
pub use rest::RestHandler;
pub use tus::TusHandler;

/// A request normalized away from any HTTP framework.
pub struct UploadRequest {
    pub method: Method,
    /// Path below the handler's base path, e.g. `/abc123` or empty.
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Option<BodyStream>,
    /// Cancelled when the client goes away.
    pub abort: CancellationToken,
}

impl UploadRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body: None,
            abort: CancellationToken::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.insert(key.to_string(), value.into());
        self
    }

    /// Attach an in-memory body and its `Content-Length`.
    pub fn body(self, data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let len = data.len();
        let mut req = self.header("content-length", len.to_string());
        req.body = Some(Box::pin(stream::iter(vec![Ok::<_, io::Error>(data)])));
        req
    }

    pub fn stream(mut self, body: BodyStream) -> Self {
        self.body = Some(body);
        self
    }

    /// Upload id addressed by the path, if any.
    pub fn id(&self) -> Option<String> {
        let id = self.path.trim_matches('/');
        (!id.is_empty()).then(|| id.to_string())
    }

    pub fn require_id(&self) -> UploadResult<String> {
        self.id()
            .ok_or_else(|| UploadError::not_found("upload id missing from path"))
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    }

    /// Parse a numeric header; malformed values are a bad request.
    pub fn header_u64(&self, name: &str) -> UploadResult<Option<u64>> {
        match self.header_str(name) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                UploadError::with_message(
                    ErrorCode::BadRequest,
                    format!("invalid {name} header `{raw}`"),
                )
            }),
        }
    }

    pub fn content_length(&self) -> UploadResult<Option<u64>> {
        self.header_u64(header::CONTENT_LENGTH.as_str())
    }

    /// Media type of the body without parameters, lowercased.
    pub fn content_type(&self) -> Option<String> {
        self.header_str(header::CONTENT_TYPE.as_str())
            .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
    }

    pub fn take_body(&mut self) -> Option<BodyStream> {
        self.body.take()
    }

    /// Buffer the whole body, failing once it exceeds `limit` bytes.
    pub async fn read_body(&mut self, limit: u64) -> UploadResult<Bytes> {
        let Some(mut body) = self.body.take() else {
            return Ok(Bytes::new());
        };
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|_| UploadError::new(ErrorCode::RequestAborted))?;
            if (buf.len() + chunk.len()) as u64 > limit {
                return Err(UploadError::new(ErrorCode::RequestEntityTooLarge));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

pub enum ResponseBody {
    Empty,
    Json(Value),
    Stream(BodyStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Status, headers and body produced by a handler.
#[derive(Debug)]
pub struct UploadResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl UploadResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn json(status: StatusCode, value: Value) -> Self {
        let response = Self {
            body: ResponseBody::Json(value),
            ..Self::new(status)
        };
        response.header(header::CONTENT_TYPE.as_str(), "application/json")
    }

    /// Set a header; values that are not valid header text are skipped.
    pub fn header(mut self, name: &str, value: impl AsRef<str>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl AsRef<str>) {
        match (
            HeaderName::try_from(name),
            HeaderValue::from_str(value.as_ref()),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => debug!(name, "skipping invalid response header"),
        }
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn from_error(err: &UploadError) -> Self {
        Self::json(err.status(), err.body())
    }
}

/// One wire protocol mapped onto a storage.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn storage(&self) -> &Arc<dyn BaseStorage>;

    /// Path prefix the handler is mounted at, e.g. `/files`.
    fn base_path(&self) -> &str;

    /// Methods this protocol answers.
    fn methods(&self) -> &'static [Method];

    async fn dispatch(&self, req: UploadRequest) -> UploadResult<UploadResponse>;

    /// Adjust every response, success or error, before it is sent.
    fn finish(&self, _response: &mut UploadResponse) {}

    fn location(&self, id: &str) -> String {
        format!("{}/{}", self.base_path().trim_end_matches('/'), id)
    }
}

/// The closed set of protocols.
pub enum UploadHandler {
    Tus(TusHandler),
    Rest(RestHandler),
    Multipart(MultipartHandler),
}

impl UploadHandler {
    fn inner(&self) -> &dyn RequestHandler {
        match self {
            Self::Tus(h) => h as &dyn RequestHandler,
            Self::Rest(h) => h as &dyn RequestHandler,
            Self::Multipart(h) => h as &dyn RequestHandler,
        }
    }

    pub fn base_path(&self) -> &str {
        self.inner().base_path()
    }

    pub fn methods(&self) -> &'static [Method] {
        self.inner().methods()
    }

    /// Run one request to completion. Errors become protocol responses and
    /// pass through the storage's `on_error` hook.
    pub async fn handle(&self, req: UploadRequest) -> UploadResponse {
        let handler = self.inner();
        let method = req.method.clone();
        let path = req.path.clone();

        let result = if handler.methods().contains(&method) {
            handler.dispatch(req).await
        } else {
            Err(UploadError::with_message(
                ErrorCode::MethodNotAllowed,
                format!("method {method} not allowed"),
            ))
        };

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                debug!(%method, path, code = err.code.as_str(), "request failed");
                let mut response = UploadResponse::from_error(&err);
                if err.code == ErrorCode::MethodNotAllowed {
                    let allow: Vec<&str> = handler.methods().iter().map(Method::as_str).collect();
                    response.set_header(header::ALLOW.as_str(), allow.join(", "));
                }
                handler.storage().core().hooks().on_error(&err, &mut response);
                response
            }
        };
        handler.finish(&mut response);
        response
    }
}

impl From<TusHandler> for UploadHandler {
    fn from(handler: TusHandler) -> Self {
        Self::Tus(handler)
    }
}

impl From<RestHandler> for UploadHandler {
    fn from(handler: RestHandler) -> Self {
        Self::Rest(handler)
    }
}

impl From<MultipartHandler> for UploadHandler {
    fn from(handler: MultipartHandler) -> Self {
        Self::Multipart(handler)
    }
}

/// `GET <base>` lists uploads; `GET <base>/<id>` streams one back.
pub(crate) async fn serve_get(
    storage: &dyn BaseStorage,
    id: Option<String>,
) -> UploadResult<UploadResponse> {
    let Some(id) = id else {
        let items = storage.list().await?;
        return Ok(UploadResponse::json(StatusCode::OK, json!({ "items": items })));
    };

    let stream = storage.get_stream(&id).await?;
    let file = &stream.file;
    let mut response = UploadResponse::new(StatusCode::OK)
        .header(header::CONTENT_TYPE.as_str(), &file.content_type)
        .header(header::CONTENT_LENGTH.as_str(), stream.content_length.to_string());
    if let Some(etag) = &file.etag {
        response.set_header(header::ETAG.as_str(), etag);
    }
    if let Some(modified) = file.modified_at {
        response.set_header(header::LAST_MODIFIED.as_str(), modified.to_rfc2822());
    }
    if !file.original_name.is_empty() {
        response.set_header(
            header::CONTENT_DISPOSITION.as_str(),
            format!("inline; filename=\"{}\"", file.original_name.replace('"', "")),
        );
    }
    response.body = ResponseBody::Stream(stream.body);
    Ok(response)
}

/// Internal metadata keys that never leave the server as user metadata.
pub(crate) fn is_internal_key(key: &str) -> bool {
    matches!(
        key,
        tus::META_CONCAT | tus::META_PARTS | tus::META_DEFER | rest::META_CHUNKS | rest::META_CHUNKED
    )
}

/// Decode an `application/x-www-form-urlencoded` string into ordered pairs.
pub fn parse_form(raw: &str) -> UploadResult<Vec<(String, String)>> {
    let decode = |s: &str| {
        urlencoding::decode(&s.replace('+', " "))
            .map(|v| v.into_owned())
            .map_err(|err| UploadError::bad_request(format!("invalid form encoding: {err}")))
    };
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode(key)?, decode(value)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_pairs_decode() {
        let pairs = parse_form("file=hello+world&name=a%2Fb.txt&flag").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("file".to_string(), "hello world".to_string()),
                ("name".to_string(), "a/b.txt".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
        assert!(parse_form("bad=%FF").is_err());
    }

    #[test]
    fn request_accessors() {
        let req = UploadRequest::new(Method::PATCH, "/abc")
            .header("Upload-Offset", "12")
            .header("content-type", "Application/Offset+Octet-Stream; charset=x");
        assert_eq!(req.id().as_deref(), Some("abc"));
        assert_eq!(req.header_u64("upload-offset").unwrap(), Some(12));
        assert_eq!(req.content_type().as_deref(), Some("application/offset+octet-stream"));

        let bad = UploadRequest::new(Method::PATCH, "").header("upload-offset", "x");
        assert_eq!(bad.header_u64("upload-offset").unwrap_err().code, ErrorCode::BadRequest);
        assert_eq!(bad.require_id().unwrap_err().code, ErrorCode::FileNotFound);
    }
}
