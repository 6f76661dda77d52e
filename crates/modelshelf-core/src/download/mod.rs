//! Resumable downloads with bounded concurrency.

mod coordinator;
mod persistence;
mod source;
mod types;

pub use coordinator::{DownloadCoordinator, DownloadCoordinatorBuilder, DownloadPostProcessor};
pub use persistence::DownloadPersistence;
pub use source::{HttpTransferSource, TransferRequest, TransferResponse, TransferSource};
pub use types::{
    AuthMode, DownloadJob, DownloadSnapshot, DownloadSource, DownloadState, RemoteIdentity,
    ResumeToken, StartOptions,
};
