//! Error taxonomy shared by the storage engine and the protocol handlers.
//!
//! Every failure maps to exactly one [`ErrorCode`], which in turn fixes the
//! HTTP status and the machine-readable code sent to clients.

use http::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};
use std::io;
use thiserror::Error;

/// Machine codes for every error the engine can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    BadRequest,
    InvalidFileName,
    InvalidFileSize,
    InvalidRange,
    UnsupportedChecksumAlgorithm,
    Forbidden,
    FileNotFound,
    MethodNotAllowed,
    FileConflict,
    Gone,
    UnsupportedVersion,
    RequestEntityTooLarge,
    MetadataTooLarge,
    UnsupportedMediaType,
    FileLocked,
    ChecksumMismatch,
    RequestAborted,
    FileError,
    StorageError,
    ExtensionNotSupported,
    StorageBusy,
    StorageNotReady,
}

impl ErrorCode {
    /// HTTP status paired with this code.
    pub fn status(self) -> StatusCode {
        let code = match self {
            Self::BadRequest
            | Self::InvalidFileName
            | Self::InvalidFileSize
            | Self::InvalidRange
            | Self::UnsupportedChecksumAlgorithm => 400,
            Self::Forbidden => 403,
            Self::FileNotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::FileConflict => 409,
            Self::Gone => 410,
            Self::UnsupportedVersion => 412,
            Self::RequestEntityTooLarge | Self::MetadataTooLarge => 413,
            Self::UnsupportedMediaType => 415,
            Self::FileLocked => 423,
            Self::ChecksumMismatch => 460,
            Self::RequestAborted => 499,
            Self::FileError | Self::StorageError => 500,
            Self::ExtensionNotSupported => 501,
            Self::StorageBusy | Self::StorageNotReady => 503,
        };
        // All codes above are in the valid 100..=999 range.
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BadRequest",
            Self::InvalidFileName => "InvalidFileName",
            Self::InvalidFileSize => "InvalidFileSize",
            Self::InvalidRange => "InvalidRange",
            Self::UnsupportedChecksumAlgorithm => "UnsupportedChecksumAlgorithm",
            Self::Forbidden => "Forbidden",
            Self::FileNotFound => "FileNotFound",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::FileConflict => "FileConflict",
            Self::Gone => "Gone",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::RequestEntityTooLarge => "RequestEntityTooLarge",
            Self::MetadataTooLarge => "MetadataTooLarge",
            Self::UnsupportedMediaType => "UnsupportedMediaType",
            Self::FileLocked => "FileLocked",
            Self::ChecksumMismatch => "ChecksumMismatch",
            Self::RequestAborted => "RequestAborted",
            Self::FileError => "FileError",
            Self::StorageError => "StorageError",
            Self::ExtensionNotSupported => "ExtensionNotSupported",
            Self::StorageBusy => "StorageBusy",
            Self::StorageNotReady => "StorageNotReady",
        }
    }

    fn default_message(self) -> &'static str {
        match self {
            Self::BadRequest => "Bad request",
            Self::InvalidFileName => "Invalid file name",
            Self::InvalidFileSize => "File size cannot be retrieved",
            Self::InvalidRange => "Invalid or missing content-range header",
            Self::UnsupportedChecksumAlgorithm => "Unsupported checksum algorithm",
            Self::Forbidden => "Forbidden",
            Self::FileNotFound => "Not found",
            Self::MethodNotAllowed => "Method not allowed",
            Self::FileConflict => "File conflict",
            Self::Gone => "Gone",
            Self::UnsupportedVersion => "Unsupported protocol version",
            Self::RequestEntityTooLarge => "Request entity too large",
            Self::MetadataTooLarge => "Metadata size limit exceeded",
            Self::UnsupportedMediaType => "Unsupported media type",
            Self::FileLocked => "File locked",
            Self::ChecksumMismatch => "Checksum mismatch",
            Self::RequestAborted => "Request aborted",
            Self::FileError => "Something went wrong writing the file",
            Self::StorageError => "Something went wrong with the storage",
            Self::ExtensionNotSupported => "Extension not supported",
            Self::StorageBusy => "Storage busy",
            Self::StorageNotReady => "Storage not initialized",
        }
    }
}

/// Error raised by storage operations and protocol handlers.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct UploadError {
    pub code: ErrorCode,
    pub message: String,
    /// Name of the storage implementation that produced an internal error.
    pub storage: Option<&'static str>,
    pub detail: Option<Value>,
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    /// Build an error with the code's default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            storage: None,
            detail: None,
        }
    }

    pub fn with_message(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            ..Self::new(code)
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::FileNotFound, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::FileConflict, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::BadRequest, msg)
    }

    /// Wrap an unexpected failure, tagging it with the storage that hit it.
    pub fn internal(storage: &'static str, err: impl std::fmt::Display) -> Self {
        Self {
            storage: Some(storage),
            ..Self::with_message(ErrorCode::StorageError, err.to_string())
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Attach the storage name if none was recorded yet.
    pub fn in_storage(mut self, storage: &'static str) -> Self {
        if self.storage.is_none() {
            self.storage = Some(storage);
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    /// JSON body sent to clients.
    pub fn body(&self) -> Value {
        let mut error = json!({
            "code": self.code.as_str(),
            "message": self.message,
            "status": self.status().as_u16(),
        });
        if let Some(storage) = self.storage {
            error["storage"] = json!(storage);
        }
        if let Some(detail) = &self.detail {
            error["detail"] = detail.clone();
        }
        json!({ "error": error })
    }
}

impl From<ErrorCode> for UploadError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

impl From<io::Error> for UploadError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::with_message(ErrorCode::FileError, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_message(ErrorCode::StorageError, format!("metadata encoding: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_mismatch_uses_custom_status() {
        let err = UploadError::new(ErrorCode::ChecksumMismatch);
        assert_eq!(err.status().as_u16(), 460);
        assert_eq!(err.body()["error"]["code"], "ChecksumMismatch");
    }

    #[test]
    fn internal_errors_name_the_storage() {
        let err = UploadError::internal("DiskStorage", "boom");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body()["error"]["storage"], "DiskStorage");
    }

    #[test]
    fn io_not_found_maps_to_404() {
        let err: UploadError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code, ErrorCode::FileNotFound);
        let err: UploadError = io::Error::other("disk").into();
        assert_eq!(err.code, ErrorCode::FileError);
    }
}
