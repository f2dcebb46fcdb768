#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;
use upload_store::{
    config::StorageConfig,
    handlers::{MultipartHandler, RestHandler, TusHandler, UploadHandler},
    services::{BaseStorage, DiskStorage},
};

pub struct Fixture {
    pub storage: Arc<dyn BaseStorage>,
    pub temp: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut StorageConfig)) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = StorageConfig::new(temp.path());
        configure(&mut config);
        let storage = DiskStorage::new(config);
        storage.init().await.unwrap();
        Self {
            storage: Arc::new(storage),
            temp,
        }
    }

    pub fn tus(&self) -> UploadHandler {
        TusHandler::new(self.storage.clone(), "/files").into()
    }

    pub fn rest(&self) -> UploadHandler {
        RestHandler::new(self.storage.clone(), "/upload").into()
    }

    pub fn multipart(&self) -> UploadHandler {
        MultipartHandler::new(self.storage.clone(), "/multipart").into()
    }
}

/// Id at the end of a `Location` header.
pub fn id_from_location(location: &str) -> String {
    location.rsplit('/').next().unwrap().to_string()
}
