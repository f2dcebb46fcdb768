//! Resumable upload storage.
//!
//! One storage engine ([`services::BaseStorage`], implemented on local disk
//! by [`services::DiskStorage`]) behind three wire protocols: tus, chunked
//! REST and multipart forms.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

pub use errors::{ErrorCode, UploadError, UploadResult};
