pub mod api;
pub mod batcher;
pub mod blob_store;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod exit_code;
pub mod gate;
pub mod poller;
pub mod quota;
pub mod retry;
pub mod services;
pub mod session;
pub mod source;
pub mod task;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transfer;
pub mod types;
pub mod ui;

pub use config::PipelineSettings;
pub use error::{ServiceError, UploadError};
pub use session::{
    NoopObserver, SessionObserver, SessionServices, SummaryKind, UploadSession, UploadSummary,
};
pub use source::FileDescriptor;
pub use task::{FileStatus, FileTask, ProgressSnapshot};
pub use types::{FileId, UploadMode, UploadTarget};
