pub mod error;
pub mod file;
pub mod grant;
pub mod helpers;
pub mod pool;
pub mod preview;
pub mod queue;
pub mod reconcile;
pub mod transfer;
pub mod uploader;

pub use error::{Result, UploadError};
pub use file::{FileBody, LocalFile};
pub use grant::{GrantClient, IdentityHeader, TransferDescriptor};
pub use helpers::{detect_content_type, format_size};
pub use pool::run_pool;
pub use preview::{PreviewHandle, PreviewRegistry};
pub use queue::{ItemId, QueueCounts, UploadItem, UploadQueue, UploadStatus};
pub use reconcile::{CommittedObserver, CommittedUpload, Reconciler};
pub use transfer::{
    Dispatch, ProgressSink, TransferExecutor, TransferProgress, TransferReport, TransferStrategy,
};
pub use uploader::{RunSummary, Uploader};
