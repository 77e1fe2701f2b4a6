use anyhow::{Context, Result as AnyResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::Result;
use super::file::LocalFile;
use super::grant::GrantClient;
use super::pool::run_pool;
use super::queue::{ItemId, UploadQueue, UploadStatus};
use super::transfer::{ProgressSink, TransferExecutor, TransferReport};
use crate::config::Config;

/// Totals for one run over a set of items
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Claimed items that were removed or already started elsewhere
    pub skipped: usize,
    pub bytes: u64,
    /// Suggestions for failed items whose error has a known remedy
    pub hints: Vec<(ItemId, String)>,
}

impl RunSummary {
    pub fn hint(&self, id: ItemId) -> Option<&str> {
        self.hints
            .iter()
            .find(|(hinted, _)| *hinted == id)
            .map(|(_, hint)| hint.as_str())
    }
}

/// Runs queued items through grant, transfer and report
pub struct Uploader {
    queue: Arc<UploadQueue>,
    grants: GrantClient,
    executor: TransferExecutor,
    concurrency: usize,
}

impl Uploader {
    pub fn new(
        queue: Arc<UploadQueue>,
        grants: GrantClient,
        executor: TransferExecutor,
        concurrency: usize,
    ) -> Self {
        Self {
            queue,
            grants,
            executor,
            concurrency,
        }
    }

    /// Build the HTTP client and collaborators from configuration
    pub fn from_config(config: &Config, queue: Arc<UploadQueue>) -> AnyResult<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let grants = GrantClient::new(client.clone(), config.grant_url.clone(), config.identity());
        let executor = TransferExecutor::new(client);

        Ok(Self::new(queue, grants, executor, config.concurrency))
    }

    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.queue
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Enqueue `files` and upload them
    pub async fn enqueue_and_upload(&self, files: Vec<LocalFile>) -> RunSummary {
        let ids = self.queue.enqueue(files);
        self.upload(ids).await
    }

    /// Upload every item currently waiting in the queue
    pub async fn upload_queued(&self) -> RunSummary {
        let ids = self.queue.ids_with_status(UploadStatus::Queued);
        self.upload(ids).await
    }

    /// Upload the given items with the configured number of workers
    pub async fn upload(&self, ids: Vec<ItemId>) -> RunSummary {
        if ids.is_empty() {
            return RunSummary::default();
        }

        info!(
            "Uploading {} file(s) with up to {} worker(s)",
            ids.len(),
            self.concurrency
        );

        let hints = Mutex::new(Vec::new());
        run_pool(ids.clone(), self.concurrency, |id| {
            let hints = &hints;
            async move {
                if let Some(hint) = self.process(id).await {
                    hints.lock().push((id, hint));
                }
            }
        })
        .await;

        let mut summary = RunSummary {
            hints: hints.into_inner(),
            ..RunSummary::default()
        };
        summary.hints.sort_by_key(|(id, _)| *id);
        for id in ids {
            match self.queue.get(id) {
                Some(item) if item.status == UploadStatus::Success => {
                    summary.succeeded += 1;
                    summary.bytes += item.file.size();
                }
                Some(item) if item.status == UploadStatus::Error => summary.failed += 1,
                _ => summary.skipped += 1,
            }
        }

        info!(
            "Run finished: {} succeeded, {} failed, {} skipped",
            summary.succeeded, summary.failed, summary.skipped
        );
        summary
    }

    /// One item through the whole pipeline; failures end up on the item
    ///
    /// Returns the remedy hint for a failure, when there is one.
    async fn process(&self, id: ItemId) -> Option<String> {
        let Some(item) = self.queue.begin_signing(id) else {
            debug!("{} is no longer queued, skipping", id);
            return None;
        };

        match self.run_pipeline(id, &item.file).await {
            Ok(report) => {
                if report.fell_back {
                    debug!("{} completed through the buffered fallback", id);
                }
                self.queue.mark_success(id);
                None
            }
            Err(e) => {
                warn!("Upload of {} ({}) failed: {}", item.file.name(), id, e);
                let message = e.to_string();
                self.queue.mark_failed(id, &message);
                Some(e.user_message()).filter(|hint| *hint != message)
            }
        }
    }

    async fn run_pipeline(&self, id: ItemId, file: &LocalFile) -> Result<TransferReport> {
        let descriptor = self.grants.request_grant(file).await?;
        self.queue.begin_uploading(id, &descriptor);

        let queue = Arc::clone(&self.queue);
        let sink: ProgressSink =
            Arc::new(move |p| queue.record_progress(id, p.attempt, p.percent));

        self.executor.transfer(file, &descriptor, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::grant::tests::grant_json;
    use crate::upload::preview::PreviewRegistry;
    use crate::upload::transfer::tests::NoStreaming;
    use httptest::{Expectation, Server, matchers::*, responders::*};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn uploader(server: &Server, queue: Arc<UploadQueue>, concurrency: usize) -> Uploader {
        let client = reqwest::Client::new();
        Uploader::new(
            queue,
            GrantClient::new(client.clone(), server.url("/api/uploads/sign").to_string(), None),
            TransferExecutor::new(client).with_chunk_size(256),
            concurrency,
        )
    }

    fn png(name: &str, len: usize) -> LocalFile {
        LocalFile::from_bytes(name, Some("image/png".to_string()), vec![1u8; len])
    }

    fn observed_queue() -> (Arc<UploadQueue>, Arc<Mutex<Vec<usize>>>) {
        let emissions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&emissions);
        let queue = UploadQueue::new().on_committed(move |uploads| seen.lock().push(uploads.len()));
        (Arc::new(queue), emissions)
    }

    #[tokio::test]
    async fn test_single_file_success() {
        let server = Server::run();
        let upload_url = server.url("/bucket/uploads/u1/x-a.png").to_string();
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/uploads/sign"))
                .respond_with(json_encoded(grant_json(&upload_url, "uploads/u1/x-a.png"))),
        );
        server.expect(
            Expectation::matching(request::method_path("PUT", "/bucket/uploads/u1/x-a.png"))
                .respond_with(status_code(200)),
        );

        let (queue, emissions) = observed_queue();
        let uploader = uploader(&server, Arc::clone(&queue), 3);
        let summary = uploader.enqueue_and_upload(vec![png("a.png", 2048)]).await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.bytes, 2048);

        let item = &queue.items()[0];
        assert_eq!(item.status, UploadStatus::Success);
        assert_eq!(item.progress, 100);
        assert_eq!(item.object_name.as_deref(), Some("uploads/u1/x-a.png"));
        assert!(item.public_url.is_some());
        assert!(item.error.is_none());

        assert_eq!(*emissions.lock(), vec![1]);
        let committed = queue.committed();
        assert_eq!(committed[0].file_name, "a.png");
        assert_eq!(committed[0].content_type, "image/png");
    }

    #[tokio::test]
    async fn test_unauthorized_grant_marks_item_failed() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/uploads/sign"))
                .respond_with(
                    status_code(401).body(r#"{"error":"Missing authentication context"}"#),
                ),
        );

        let (queue, emissions) = observed_queue();
        let uploader = uploader(&server, Arc::clone(&queue), 3);
        let summary = uploader.enqueue_and_upload(vec![png("a.png", 10)]).await;

        assert_eq!(summary.failed, 1);
        let item = &queue.items()[0];
        assert_eq!(item.status, UploadStatus::Error);
        assert_eq!(item.error.as_deref(), Some("Missing authentication context"));
        assert_eq!(item.progress, 5);
        assert!(emissions.lock().is_empty());

        let hint = summary.hint(item.id).unwrap();
        assert!(hint.starts_with("Missing authentication context"));
        assert!(hint.contains("UPLOAD_IDENTITY_TOKEN"));
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_siblings() {
        let server = Server::run();
        let ok_url = server.url("/bucket/ok").to_string();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/api/uploads/sign"),
                request::body(json_decoded(eq(serde_json::json!({
                    "fileName": "bad.png",
                    "contentType": "image/png"
                })))),
            ])
            .respond_with(status_code(500)),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/api/uploads/sign"),
                request::body(json_decoded(eq(serde_json::json!({
                    "fileName": "good.png",
                    "contentType": "image/png"
                })))),
            ])
            .respond_with(json_encoded(grant_json(&ok_url, "uploads/good.png"))),
        );
        server.expect(
            Expectation::matching(request::method_path("PUT", "/bucket/ok"))
                .respond_with(status_code(200)),
        );

        let (queue, _) = observed_queue();
        let uploader = uploader(&server, Arc::clone(&queue), 2);
        let summary = uploader
            .enqueue_and_upload(vec![png("bad.png", 10), png("good.png", 10)])
            .await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.hints.is_empty());
        let items = queue.items();
        assert_eq!(items[0].error.as_deref(), Some("500 Internal Server Error"));
        assert_eq!(items[1].status, UploadStatus::Success);
    }

    #[tokio::test]
    async fn test_five_files_never_exceed_three_active() {
        let server = Server::run();
        let upload_url = server.url("/bucket/obj").to_string();
        let grants = (0..5)
            .map(|n| {
                Box::new(json_encoded(grant_json(&upload_url, &format!("uploads/{}", n))))
                    as Box<dyn Responder>
            })
            .collect();
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/uploads/sign"))
                .times(5)
                .respond_with(cycle(grants)),
        );
        server.expect(
            Expectation::matching(request::method_path("PUT", "/bucket/obj"))
                .times(5)
                .respond_with(delay_and_then(
                    Duration::from_millis(20),
                    status_code(200),
                )),
        );

        let (queue, emissions) = observed_queue();
        let peak = Arc::new(AtomicUsize::new(0));
        let mut rx = queue.subscribe();
        let sampler = {
            let queue = Arc::clone(&queue);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    peak.fetch_max(queue.counts().active, Ordering::SeqCst);
                }
            })
        };

        let uploader = uploader(&server, Arc::clone(&queue), 3);
        let files = (0..5).map(|i| png(&format!("f{}.png", i), 4096)).collect();
        let summary = uploader.enqueue_and_upload(files).await;
        sampler.abort();

        assert_eq!(summary.succeeded, 5);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.counts().succeeded, 5);
        assert_eq!(emissions.lock().last().copied(), Some(5));
        assert_eq!(emissions.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_fallback_success_through_pipeline() {
        let server = Server::run();
        let upload_url = server.url("/bucket/fb").to_string();
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/uploads/sign"))
                .respond_with(json_encoded(grant_json(&upload_url, "uploads/fb.png"))),
        );
        server.expect(
            Expectation::matching(request::method_path("PUT", "/bucket/fb"))
                .times(1)
                .respond_with(status_code(200)),
        );

        let dispatch = Arc::new(NoStreaming::new());
        let queue = Arc::new(UploadQueue::new());
        let uploader = Uploader::new(
            Arc::clone(&queue),
            GrantClient::new(
                reqwest::Client::new(),
                server.url("/api/uploads/sign").to_string(),
                None,
            ),
            TransferExecutor::with_dispatch(dispatch.clone()),
            1,
        );

        let summary = uploader.enqueue_and_upload(vec![png("fb.png", 300)]).await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(dispatch.streamed.load(Ordering::SeqCst), 1);
        assert_eq!(dispatch.buffered.load(Ordering::SeqCst), 1);

        let item = &queue.items()[0];
        assert_eq!(item.progress, 100);
        assert_eq!(item.attempt, 2);
    }

    #[tokio::test]
    async fn test_removed_item_is_skipped_and_preview_released() {
        let server = Server::run();
        let registry = PreviewRegistry::new();
        let queue = Arc::new(UploadQueue::new().with_previews(registry.clone()));
        let ids = queue.enqueue(vec![png("a.png", 10)]);
        queue.remove(ids[0]);
        assert_eq!(registry.outstanding(), 0);

        let uploader = uploader(&server, Arc::clone(&queue), 2);
        let summary = uploader.upload(ids).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.succeeded + summary.failed, 0);
    }

    #[tokio::test]
    async fn test_upload_queued_ignores_finished_items() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/uploads/sign"))
                .times(1)
                .respond_with(status_code(400).body(r#"{"error":"Invalid payload"}"#)),
        );

        let queue = Arc::new(UploadQueue::new());
        let uploader = uploader(&server, Arc::clone(&queue), 2);
        queue.enqueue(vec![png("a.png", 10)]);

        assert_eq!(uploader.upload_queued().await.failed, 1);
        assert_eq!(uploader.upload_queued().await, RunSummary::default());

        // Re-adding the same file creates a fresh item
        queue.enqueue(vec![png("a.png", 10)]);
        assert_eq!(queue.len(), 2);
        assert_ne!(queue.items()[0].id, queue.items()[1].id);
    }
}
