//! Core data models for the upload engine.
//!
//! `File` is the persisted upload record; `Metadata` is the open map that
//! protocols use for their own bookkeeping next to user-supplied fields.

pub mod checksum;
pub mod file;
pub mod metadata;

pub use checksum::{Checksum, ChecksumAlgorithm};
pub use file::{BodyStream, File, FileInit, FileListItem, FilePart, UploadStatus};
pub use metadata::Metadata;
