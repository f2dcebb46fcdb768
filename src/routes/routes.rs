//! Binds the protocol handlers to axum.
//!
//! ## Structure
//! - `/files`, `/files/{*id}`: tus resumable uploads
//! - `/upload`, `/upload/{*id}`: chunked REST uploads
//! - `/multipart`, `/multipart/{*id}`: form uploads
//! - `/healthz`, `/readyz`: probes
//!
//! Every request is converted to an [`UploadRequest`] and handled on its own
//! task. If the client disconnects, the request's cancellation token fires
//! and the write in progress winds down cleanly instead of being dropped.

use crate::{
    handlers::{
        MultipartHandler, ResponseBody, RestHandler, TusHandler, UploadHandler, UploadRequest,
        UploadResponse, parse_form,
        health_handlers::{healthz, readyz},
    },
    services::BaseStorage,
};
use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
};
use futures::StreamExt;
use std::{collections::HashMap, io, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::error;

pub const TUS_PATH: &str = "/files";
pub const REST_PATH: &str = "/upload";
pub const MULTIPART_PATH: &str = "/multipart";

/// Router with every protocol mounted at its default path.
pub fn routes(storage: Arc<dyn BaseStorage>) -> Router {
    Router::new()
        .merge(mount(TusHandler::new(storage.clone(), TUS_PATH).into()))
        .merge(mount(RestHandler::new(storage.clone(), REST_PATH).into()))
        .merge(mount(MultipartHandler::new(storage.clone(), MULTIPART_PATH).into()))
        .merge(
            Router::new()
                .route("/healthz", get(healthz))
                .route("/readyz", get(readyz))
                .with_state(storage),
        )
}

/// Serve one handler at its base path and everything below it.
pub fn mount(handler: UploadHandler) -> Router {
    let base = handler.base_path().trim_end_matches('/').to_string();
    Router::new()
        .route(&base, any(dispatch))
        .route(&format!("{base}/{{*id}}"), any(dispatch))
        .with_state(Arc::new(handler))
}

async fn dispatch(State(handler): State<Arc<UploadHandler>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path()
        .strip_prefix(handler.base_path().trim_end_matches('/'))
        .unwrap_or_default()
        .to_string();
    let query: HashMap<String, String> = parts
        .uri
        .query()
        .and_then(|q| parse_form(q).ok())
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default();

    let abort = CancellationToken::new();
    let guard = abort.clone().drop_guard();
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let req = UploadRequest {
        method: parts.method,
        path,
        query,
        headers: parts.headers,
        body: Some(Box::pin(stream)),
        abort,
    };

    let task = tokio::spawn(async move { handler.handle(req).await });
    let response = match task.await {
        Ok(response) => response,
        Err(err) => {
            error!("upload handler task failed: {}", err);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    guard.disarm();
    into_response(response)
}

fn into_response(upload: UploadResponse) -> Response {
    let body = match upload.body {
        ResponseBody::Empty => Body::empty(),
        ResponseBody::Json(value) => Body::from(value.to_string()),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };
    let mut response = Response::new(body);
    *response.status_mut() = upload.status;
    *response.headers_mut() = upload.headers;
    response
}
