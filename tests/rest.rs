mod common;

use bytes::Bytes;
use common::{Fixture, id_from_location};
use futures::stream;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde_json::json;
use std::{io, sync::Arc};
use tempfile::TempDir;
use upload_store::{
    config::StorageConfig,
    handlers::{RestHandler, UploadHandler, UploadRequest, UploadResponse},
    models::{File, UploadStatus},
    services::{BaseStorage, DiskStorage, UploadHooks},
};

#[derive(Default)]
struct Completions {
    seen: Mutex<Vec<String>>,
}

impl UploadHooks for Completions {
    fn on_complete(&self, file: &File) {
        self.seen.lock().push(file.id.clone());
    }
}

async fn reserve(rest: &UploadHandler, total: u64) -> String {
    let res = rest
        .handle(
            UploadRequest::new(Method::POST, "")
                .header("x-chunked-upload", "true")
                .header("x-total-size", total.to_string())
                .header("x-file-metadata", r#"{"name":"data.bin","project":"x"}"#),
        )
        .await;
    assert_eq!(res.status, StatusCode::CREATED);
    let id = res.json_body().unwrap()["id"].as_str().unwrap().to_string();
    assert_eq!(id_from_location(res.header_str("location").unwrap()), id);
    id
}

async fn chunk(rest: &UploadHandler, id: &str, offset: u64, data: Vec<u8>) -> UploadResponse {
    rest.handle(
        UploadRequest::new(Method::PATCH, format!("/{id}"))
            .header("x-chunk-offset", offset.to_string())
            .body(data),
    )
    .await
}

#[tokio::test]
async fn chunked_upload_completes() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let id = reserve(&rest, 300).await;

    let res = chunk(&rest, &id, 0, vec![1; 150]).await;
    assert_eq!(res.status, StatusCode::ACCEPTED);
    assert_eq!(res.header_str("x-chunk-offset"), Some("150"));
    assert_eq!(res.header_str("x-upload-complete"), Some("false"));

    let res = chunk(&rest, &id, 150, vec![2; 150]).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.header_str("x-upload-complete"), Some("true"));
    assert_eq!(res.header_str("x-total-size"), Some("300"));

    let body = res.json_body().unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["metadata"]["project"], "x");
    assert!(body["metadata"].get("chunks").is_none());
}

#[tokio::test]
async fn out_of_order_chunks_complete_once_gaps_close() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let id = reserve(&rest, 250).await;

    let res = chunk(&rest, &id, 150, vec![3; 100]).await;
    assert_eq!(res.status, StatusCode::ACCEPTED);
    assert_eq!(res.header_str("x-chunk-offset"), Some("0"));

    let res = chunk(&rest, &id, 0, vec![1; 100]).await;
    assert_eq!(res.status, StatusCode::ACCEPTED);
    assert_eq!(res.header_str("x-chunk-offset"), Some("100"));

    let res = rest.handle(UploadRequest::new(Method::HEAD, format!("/{id}"))).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.header_str("x-upload-complete"), Some("false"));
    assert_eq!(res.header_str("x-chunk-offset"), Some("100"));
    assert_eq!(res.header_str("x-bytes-written"), Some("250"));

    let res = chunk(&rest, &id, 100, vec![2; 50]).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.header_str("x-chunk-offset"), Some("250"));

    let (_, data) = fx.storage.get(&id).await.unwrap();
    assert_eq!(&data[..100], &[1; 100][..]);
    assert_eq!(&data[100..150], &[2; 50][..]);
    assert_eq!(&data[150..], &[3; 100][..]);
}

#[tokio::test]
async fn completion_fires_once_after_the_last_gap() {
    let temp = TempDir::new().unwrap();
    let completions = Arc::new(Completions::default());
    let storage = DiskStorage::new(StorageConfig::new(temp.path())).with_hooks(completions.clone());
    storage.init().await.unwrap();
    let rest: UploadHandler = RestHandler::new(Arc::new(storage), "/upload").into();
    let id = reserve(&rest, 250).await;

    // the tail chunk pushes the byte counter to the full size first
    chunk(&rest, &id, 150, vec![3; 100]).await;
    chunk(&rest, &id, 0, vec![1; 100]).await;
    assert!(completions.seen.lock().is_empty());

    let res = chunk(&rest, &id, 100, vec![2; 50]).await;
    assert_eq!(res.status, StatusCode::OK);
    let res = chunk(&rest, &id, 100, vec![2; 50]).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(*completions.seen.lock(), vec![id]);
}

#[tokio::test]
async fn short_chunk_body_is_not_recorded() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let id = reserve(&rest, 100).await;

    let body = Box::pin(stream::iter(vec![Ok::<_, io::Error>(Bytes::from(vec![7; 10]))]));
    let res = rest
        .handle(
            UploadRequest::new(Method::PATCH, format!("/{id}"))
                .header("x-chunk-offset", "0")
                .header("content-length", "100")
                .stream(body),
        )
        .await;
    assert_eq!(res.status.as_u16(), 499);

    let res = rest.handle(UploadRequest::new(Method::HEAD, format!("/{id}"))).await;
    assert_eq!(res.header_str("x-upload-complete"), Some("false"));
    assert_eq!(res.header_str("x-chunk-offset"), Some("0"));
    let file = fx.storage.get_meta(&id).await.unwrap();
    assert!(file.metadata.get("chunks").is_none());
    assert_eq!(file.status, UploadStatus::Part);
}

#[tokio::test]
async fn retried_chunk_is_recorded_once() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let id = reserve(&rest, 20).await;
    chunk(&rest, &id, 0, vec![1; 10]).await;
    chunk(&rest, &id, 0, vec![1; 10]).await;

    let file = fx.storage.get_meta(&id).await.unwrap();
    assert_eq!(file.metadata["chunks"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn chunk_validation() {
    let fx = Fixture::new().await;
    let rest: UploadHandler = RestHandler::new(fx.storage.clone(), "/upload")
        .max_chunk_size(64)
        .into();
    let id = reserve(&rest, 100).await;

    let res = chunk(&rest, &id, 0, vec![0; 65]).await;
    assert_eq!(res.status, StatusCode::PAYLOAD_TOO_LARGE);

    let res = chunk(&rest, &id, 90, vec![0; 20]).await;
    assert_eq!(res.status, StatusCode::CONFLICT);

    let res = chunk(&rest, &id, 0, Vec::new()).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = rest
        .handle(UploadRequest::new(Method::PATCH, format!("/{id}")).body(vec![0; 4]))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = rest
        .handle(
            UploadRequest::new(Method::PATCH, format!("/{id}"))
                .header("x-chunk-offset", "-5")
                .body(vec![0; 4]),
        )
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chunk_checksum_is_verified() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let id = reserve(&rest, 4).await;
    let res = rest
        .handle(
            UploadRequest::new(Method::PATCH, format!("/{id}"))
                .header("x-chunk-offset", "0")
                .header("x-chunk-checksum", format!("{:x}", md5::compute(b"nope")))
                .body(&b"data"[..]),
        )
        .await;
    assert_eq!(res.status.as_u16(), 460);
    assert_eq!(fx.storage.get_meta(&id).await.unwrap().bytes_written, 0);

    let res = rest
        .handle(
            UploadRequest::new(Method::PATCH, format!("/{id}"))
                .header("x-chunk-offset", "0")
                .header("x-chunk-checksum", format!("md5 {:x}", md5::compute(b"data")))
                .body(&b"data"[..]),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
}

#[tokio::test]
async fn single_request_upload() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let res = rest
        .handle(
            UploadRequest::new(Method::POST, "")
                .header("content-type", "text/plain")
                .header("x-file-metadata", r#"{"name":"note.txt"}"#)
                .body(&b"hello"[..]),
        )
        .await;
    assert_eq!(res.status, StatusCode::CREATED);
    let body = res.json_body().unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["contentType"], "text/plain");
    assert_eq!(body["originalName"], "note.txt");
}

#[tokio::test]
async fn put_creates_then_replaces() {
    let fx = Fixture::new().await;
    let rest = fx.rest();

    let res = rest
        .handle(
            UploadRequest::new(Method::PUT, "/doc")
                .header("x-file-metadata", r#"{"name":"doc.txt","rev":1}"#)
                .body(&b"first version"[..]),
        )
        .await;
    assert_eq!(res.status, StatusCode::CREATED);

    let res = rest
        .handle(UploadRequest::new(Method::PUT, "/doc").body(&b"second"[..]))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    let body = res.json_body().unwrap();
    assert_eq!(body["size"], 6);
    assert_eq!(body["metadata"]["rev"], 1);

    let (file, data) = fx.storage.get("doc").await.unwrap();
    assert_eq!(&data[..], b"second");
    assert_eq!(file.original_name, "doc.txt");
}

#[tokio::test]
async fn failed_put_keeps_the_previous_content() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let res = rest
        .handle(UploadRequest::new(Method::PUT, "/doc").body(&b"original"[..]))
        .await;
    assert_eq!(res.status, StatusCode::CREATED);

    let res = rest
        .handle(
            UploadRequest::new(Method::PUT, "/doc")
                .header("x-chunk-checksum", format!("{:x}", md5::compute(b"other")))
                .body(&b"replacement"[..]),
        )
        .await;
    assert_eq!(res.status.as_u16(), 460);

    let (_, data) = fx.storage.get("doc").await.unwrap();
    assert_eq!(&data[..], b"original");
    let ids: Vec<String> = fx.storage.list().await.unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["doc".to_string()]);
}

#[tokio::test]
async fn ids_naming_a_sidecar_are_refused() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let res = rest
        .handle(UploadRequest::new(Method::PUT, "/a").body(&b"kept"[..]))
        .await;
    assert_eq!(res.status, StatusCode::CREATED);

    let res = rest
        .handle(UploadRequest::new(Method::PUT, "/a.META").body(&b"{}"[..]))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let (file, data) = fx.storage.get("a").await.unwrap();
    assert_eq!(file.id, "a");
    assert_eq!(&data[..], b"kept");
}

#[tokio::test]
async fn batch_delete_statuses() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let a = reserve(&rest, 1).await;
    let b = reserve(&rest, 2).await;

    let res = rest
        .handle(UploadRequest::new(Method::DELETE, "").query("ids", format!("{a},missing")))
        .await;
    assert_eq!(res.status, StatusCode::MULTI_STATUS);
    let body = res.json_body().unwrap();
    assert_eq!(body["successfulCount"], 1);
    assert_eq!(body["failedCount"], 1);
    assert_eq!(body["failed"][0]["id"], "missing");

    let res = rest
        .handle(UploadRequest::new(Method::DELETE, "").body(json!(["gone", "also-gone"]).to_string()))
        .await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.json_body().unwrap()["failedCount"], 2);

    let res = rest
        .handle(UploadRequest::new(Method::DELETE, "").body(json!([b]).to_string()))
        .await;
    assert_eq!(res.status, StatusCode::OK);

    let res = rest.handle(UploadRequest::new(Method::DELETE, "")).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn listing_and_single_delete() {
    let fx = Fixture::new().await;
    let rest = fx.rest();
    let id = reserve(&rest, 3).await;

    let res = rest.handle(UploadRequest::new(Method::GET, "")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json_body().unwrap()["items"][0]["id"], id.as_str());

    let res = rest.handle(UploadRequest::new(Method::DELETE, format!("/{id}"))).await;
    assert_eq!(res.status, StatusCode::NO_CONTENT);
    let res = rest.handle(UploadRequest::new(Method::HEAD, format!("/{id}"))).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
}
