use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
use reqwest::{Method, Request, Url};
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::{Result, UploadError};
use super::file::{LocalFile, STREAM_CHUNK_SIZE};
use super::grant::TransferDescriptor;

/// How the body of one transfer attempt was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// Body read incrementally, with progress
    Streamed,
    /// Whole body in memory, progress only at the end
    Buffered,
}

impl TransferStrategy {
    /// Attempt generation tagged on progress from this strategy
    pub fn attempt(self) -> u32 {
        match self {
            Self::Streamed => 1,
            Self::Buffered => 2,
        }
    }
}

/// One progress report from a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub attempt: u32,
    pub percent: u8,
}

/// Synchronous sink for progress reports; must not block
pub type ProgressSink = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Outcome of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub strategy: TransferStrategy,
    pub fell_back: bool,
    pub bytes: u64,
}

/// Sends a prepared request to the object store
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, request: Request) -> BoxFuture<'_, reqwest::Result<reqwest::Response>>;
}

impl Dispatch for reqwest::Client {
    fn dispatch(&self, request: Request) -> BoxFuture<'_, reqwest::Result<reqwest::Response>> {
        Box::pin(self.execute(request))
    }
}

/// Why the streamed attempt did not complete
enum StreamedFailure {
    /// The request never got a response; the buffered path may still work
    Unsupported(reqwest::Error),
    /// A definitive failure; falling back would not help
    Failed(UploadError),
}

/// Percentage reported while streaming: never 0, never 100
pub fn stream_percent(counted: u64, total: u64) -> u8 {
    if total == 0 {
        return 1;
    }
    let percent = (counted as f64 / total as f64 * 100.0).round();
    percent.clamp(1.0, 99.0) as u8
}

/// Wrap a byte stream so every chunk read reports progress
fn counting_stream(
    inner: BoxStream<'static, io::Result<Bytes>>,
    total: u64,
    sink: ProgressSink,
) -> impl futures::Stream<Item = io::Result<Bytes>> + Send + 'static {
    let attempt = TransferStrategy::Streamed.attempt();
    let mut counted = 0u64;
    inner.inspect_ok(move |chunk| {
        counted += chunk.len() as u64;
        sink(TransferProgress {
            attempt,
            percent: stream_percent(counted, total),
        });
    })
}

/// Performs the byte transfer described by an upload grant
#[derive(Clone)]
pub struct TransferExecutor {
    dispatch: Arc<dyn Dispatch>,
    chunk_size: usize,
}

impl std::fmt::Debug for TransferExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferExecutor")
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl TransferExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_dispatch(Arc::new(client))
    }

    pub fn with_dispatch(dispatch: Arc<dyn Dispatch>) -> Self {
        Self {
            dispatch,
            chunk_size: STREAM_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Upload `file` as described by `descriptor`
    ///
    /// Streams the body with progress when possible. If the streamed request
    /// can't be issued, falls back once to sending the whole body at once.
    /// Reports 100 only after the object store confirmed the upload.
    pub async fn transfer(
        &self,
        file: &LocalFile,
        descriptor: &TransferDescriptor,
        on_progress: ProgressSink,
    ) -> Result<TransferReport> {
        if descriptor.is_expired() {
            return Err(UploadError::GrantExpired(descriptor.expires_at));
        }

        let stream = if file.is_empty() {
            None
        } else {
            match file.open_stream(self.chunk_size).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    debug!("Cannot stream {}: {}; sending it whole", file.name(), e);
                    None
                }
            }
        };

        let mut fell_back = false;
        let strategy = match stream {
            Some(stream) => {
                match self
                    .send_streamed(file, descriptor, stream, Arc::clone(&on_progress))
                    .await
                {
                    Ok(()) => TransferStrategy::Streamed,
                    Err(StreamedFailure::Failed(e)) => return Err(e),
                    Err(StreamedFailure::Unsupported(e)) => {
                        warn!(
                            "Streamed upload of {} failed ({}); retrying buffered",
                            file.name(),
                            e
                        );
                        fell_back = true;
                        self.send_buffered(file, descriptor).await?;
                        TransferStrategy::Buffered
                    }
                }
            }
            None => {
                self.send_buffered(file, descriptor).await?;
                TransferStrategy::Buffered
            }
        };

        on_progress(TransferProgress {
            attempt: strategy.attempt(),
            percent: 100,
        });

        info!(
            "Uploaded {} -> {} ({:?})",
            file.name(),
            descriptor.object_name,
            strategy
        );

        Ok(TransferReport {
            strategy,
            fell_back,
            bytes: file.size(),
        })
    }

    async fn send_streamed(
        &self,
        file: &LocalFile,
        descriptor: &TransferDescriptor,
        stream: BoxStream<'static, io::Result<Bytes>>,
        on_progress: ProgressSink,
    ) -> std::result::Result<(), StreamedFailure> {
        let body = reqwest::Body::wrap_stream(counting_stream(stream, file.size(), on_progress));
        let request =
            build_request(file, descriptor, body, file.size()).map_err(StreamedFailure::Failed)?;

        debug!("Streaming {} ({} bytes)", file.name(), file.size());
        let response = self
            .dispatch
            .dispatch(request)
            .await
            .map_err(StreamedFailure::Unsupported)?;

        check_status(response.status()).map_err(StreamedFailure::Failed)
    }

    async fn send_buffered(&self, file: &LocalFile, descriptor: &TransferDescriptor) -> Result<()> {
        let data = file.read_all().await?;
        let len = data.len() as u64;
        let request = build_request(file, descriptor, reqwest::Body::from(data), len)?;

        debug!("Sending {} whole ({} bytes)", file.name(), len);
        let response = self.dispatch.dispatch(request).await?;
        check_status(response.status())
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(UploadError::Transfer {
            status: status.as_u16(),
        })
    }
}

/// Build the object-store request from the grant's method, URL and headers
fn build_request(
    file: &LocalFile,
    descriptor: &TransferDescriptor,
    body: reqwest::Body,
    len: u64,
) -> Result<Request> {
    let method = Method::from_bytes(descriptor.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| UploadError::Validation(format!("Invalid method: {}", descriptor.method)))?;
    let url = Url::parse(&descriptor.upload_url).map_err(|e| {
        UploadError::Validation(format!("Invalid upload URL {}: {}", descriptor.upload_url, e))
    })?;

    let mut request = Request::new(method, url);
    let headers = request.headers_mut();
    for (name, value) in &descriptor.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| UploadError::Validation(format!("Invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| UploadError::Validation(format!("Invalid value for header {}", name)))?;
        headers.insert(name, value);
    }
    if !headers.contains_key(CONTENT_TYPE) {
        let content_type = HeaderValue::from_str(file.content_type()).map_err(|_| {
            UploadError::Validation(format!("Invalid content type: {}", file.content_type()))
        })?;
        headers.insert(CONTENT_TYPE, content_type);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));

    *request.body_mut() = Some(body);
    Ok(request)
}
