use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while authorizing or transferring one file
#[derive(Error, Debug)]
pub enum UploadError {
    /// The grant endpoint refused to issue an upload grant
    #[error("{message}")]
    Authorization { status: u16, message: String },

    /// The grant request was malformed before it left the client
    #[error("Invalid upload request: {0}")]
    Validation(String),

    /// Network failure reaching the grant endpoint or the object store
    #[error("Network error: {0}")]
    Transport(String),

    /// The object store answered the transfer with a non-success status
    #[error("Upload failed with status {status}")]
    Transfer { status: u16 },

    /// The upload grant expired before the transfer started
    #[error("Upload grant expired at {0}")]
    GrantExpired(DateTime<Utc>),

    /// IO error reading the local file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for UploadError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl UploadError {
    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::Authorization { status: 401, message } => {
                format!(
                    "{}\n\nPossible solutions:\n  \
                     1. Set UPLOAD_IDENTITY_TOKEN in .env\n  \
                     2. Check UPLOAD_IDENTITY_HEADER matches what the grant endpoint expects",
                    message
                )
            }
            Self::Transport(message) => {
                format!(
                    "Network error: {}\n\nPossible solutions:\n  \
                     1. Check your internet connection\n  \
                     2. Verify UPLOAD_GRANT_URL is reachable\n  \
                     3. Try again with --concurrency 1",
                    message
                )
            }
            Self::GrantExpired(_) => {
                format!(
                    "{}\n\nThe grant endpoint issued an already-expired grant. \
                     Check the clock on this machine.",
                    self
                )
            }
            Self::Transfer { status: 403 } => {
                format!(
                    "{}\n\nThe upload grant was rejected by the object store. \
                     It may have expired before the transfer started.",
                    self
                )
            }
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;
