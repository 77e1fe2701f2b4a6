//! Upload local files straight to object storage through short-lived
//! signed grants.
//!
//! An [`UploadQueue`] owns every item and its state; an [`Uploader`] drains
//! it with a bounded pool of workers, each asking the grant endpoint for a
//! [`TransferDescriptor`] and then sending the bytes with a
//! [`TransferExecutor`]. Observers registered on the queue hear about the
//! list of committed uploads once per change.

pub mod config;
pub mod upload;

pub use config::Config;
pub use upload::{
    CommittedUpload, GrantClient, ItemId, LocalFile, PreviewRegistry, QueueCounts,
    TransferDescriptor, TransferExecutor, UploadError, UploadItem, UploadQueue, UploadStatus,
    Uploader,
};
