pub mod base_storage;
pub mod disk_storage;
pub mod locker;
pub mod meta_storage;
pub mod pipeline;
pub mod validation;

pub use base_storage::{
    BaseStorage, BatchFailure, BatchResult, FileStream, Metrics, NoopHooks, NoopMetrics,
    StorageCore, TracingMetrics, UploadHooks, spawn_purge_task,
};
pub use disk_storage::DiskStorage;
pub use locker::{LockGuard, Locker};
pub use meta_storage::{DiskMetaStorage, MetaStorage};
pub use validation::{ValidationRule, Validator};
