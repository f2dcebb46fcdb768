//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks storage init and disk I/O

use crate::services::BaseStorage;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path, sync::Arc};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Always 200 OK; never touches the storage.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Confirms the storage finished its `init`.
/// 2. Performs a best-effort write/read/delete under the storage directory.
///
/// HTTP 200 when all checks pass, HTTP 503 otherwise.
pub async fn readyz(State(storage): State<Arc<dyn BaseStorage>>) -> impl IntoResponse {
    let storage_check = if storage.is_ready() {
        (true, None)
    } else {
        (false, Some(format!("{} is not initialized", storage.name())))
    };
    let disk_check = disk_round_trip(&storage.core().config.directory).await;

    let overall_ok = storage_check.0 && disk_check.0;
    let mut checks = HashMap::new();
    checks.insert(
        "storage",
        CheckStatus {
            ok: storage_check.0,
            error: storage_check.1,
        },
    );
    checks.insert(
        "disk",
        CheckStatus {
            ok: disk_check.0,
            error: disk_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn disk_round_trip(dir: &Path) -> (bool, Option<String>) {
    let tmp_path = dir.join(format!(".probe-readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp_path, b"readyz").await {
        return (false, Some(format!("could not write tmp file: {e}")));
    }
    let result = match fs::read(&tmp_path).await {
        Ok(bytes) if bytes == b"readyz" => (true, None),
        Ok(_) => (false, Some("file content mismatch".to_string())),
        Err(e) => (false, Some(format!("could not read tmp file: {e}"))),
    };
    if let Err(e) = fs::remove_file(&tmp_path).await {
        return (result.0, Some(format!("could not remove tmp file: {e}")));
    }
    result
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
