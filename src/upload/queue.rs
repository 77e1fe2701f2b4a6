//! The upload queue: the single owner of every item's status and progress.
//!
//! Items move through `queued -> signing -> uploading -> success | error`.
//! Every per-item change goes through [`UploadQueue::update_by_id`], which
//! applies a pure transform to the latest snapshot of that item under the
//! queue lock. Whole-list changes (enqueue, remove, clear) take the same
//! lock. After each change the committed-upload list is reconciled and the
//! revision counter is bumped for anyone watching.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::file::LocalFile;
use super::grant::TransferDescriptor;
use super::preview::{PreviewHandle, PreviewRegistry};
use super::reconcile::{CommittedObserver, CommittedUpload, Reconciler};

/// Progress shown as soon as an item is claimed
pub const SIGNING_PROGRESS_FLOOR: u8 = 5;

/// Progress shown once the grant is in hand
pub const UPLOADING_PROGRESS_FLOOR: u8 = 10;

/// Message recorded when a failure carries none
pub const DEFAULT_ERROR_MESSAGE: &str = "Upload failed";

/// Stable identifier of one queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemId(u64);

impl ItemId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Signing,
    Uploading,
    Success,
    Error,
}

impl UploadStatus {
    /// Claimed by a worker and not yet finished
    pub fn is_active(self) -> bool {
        matches!(self, Self::Signing | Self::Uploading)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Signing => "signing",
            Self::Uploading => "uploading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one file's upload
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub id: ItemId,
    pub file: Arc<LocalFile>,
    pub preview_uri: Option<String>,
    /// 0-100; 100 only once the object store confirmed the upload
    pub progress: u8,
    pub status: UploadStatus,
    pub error: Option<String>,
    pub object_name: Option<String>,
    pub public_url: Option<String>,
    /// Generation of the transfer attempt that last reported progress
    pub attempt: u32,
}

impl UploadItem {
    pub fn new(id: ItemId, file: Arc<LocalFile>, preview_uri: Option<String>) -> Self {
        Self {
            id,
            file,
            preview_uri,
            progress: 0,
            status: UploadStatus::Queued,
            error: None,
            object_name: None,
            public_url: None,
            attempt: 0,
        }
    }

    /// `queued -> signing`
    pub fn signing(&self) -> Option<Self> {
        if self.status != UploadStatus::Queued {
            return None;
        }
        Some(Self {
            status: UploadStatus::Signing,
            progress: self.progress.max(SIGNING_PROGRESS_FLOOR),
            error: None,
            ..self.clone()
        })
    }

    /// `signing -> uploading`, recording where the object will live
    pub fn uploading(&self, descriptor: &TransferDescriptor) -> Option<Self> {
        if self.status != UploadStatus::Signing {
            return None;
        }
        Some(Self {
            status: UploadStatus::Uploading,
            progress: self.progress.max(UPLOADING_PROGRESS_FLOOR),
            object_name: Some(descriptor.object_name.clone()),
            public_url: Some(descriptor.public_url.clone()),
            ..self.clone()
        })
    }

    /// `uploading -> uploading`; stale attempts and regressions are ignored
    pub fn progressed(&self, attempt: u32, percent: u8) -> Option<Self> {
        if self.status != UploadStatus::Uploading || attempt < self.attempt {
            return None;
        }
        let progress = self.progress.max(percent.min(99));
        if progress == self.progress && attempt == self.attempt {
            return None;
        }
        Some(Self {
            progress,
            attempt,
            ..self.clone()
        })
    }

    /// `uploading -> success`
    pub fn succeeded(&self) -> Option<Self> {
        if self.status != UploadStatus::Uploading {
            return None;
        }
        Some(Self {
            status: UploadStatus::Success,
            progress: 100,
            error: None,
            ..self.clone()
        })
    }

    /// `signing | uploading -> error`, keeping the last progress
    pub fn failed(&self, message: &str) -> Option<Self> {
        if !self.status.is_active() {
            return None;
        }
        let message = message.trim();
        let message = if message.is_empty() {
            DEFAULT_ERROR_MESSAGE
        } else {
            message
        };
        Some(Self {
            status: UploadStatus::Error,
            error: Some(message.to_string()),
            ..self.clone()
        })
    }
}

/// Aggregate item counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub active: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Items not yet finished
    pub fn pending(&self) -> usize {
        self.queued + self.active
    }

    pub fn total(&self) -> usize {
        self.pending() + self.succeeded + self.failed
    }
}

struct Entry {
    item: UploadItem,
    preview: Option<PreviewHandle>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    entries: Vec<Entry>,
    reconciler: Reconciler,
    /// Emissions handed out so far, in reconcile order
    emitted: u64,
}

/// Authoritative collection of upload items
pub struct UploadQueue {
    state: Mutex<QueueState>,
    previews: Option<PreviewRegistry>,
    observer: Option<CommittedObserver>,
    revision: watch::Sender<u64>,
    delivered: Mutex<u64>,
    delivery: Condvar,
}

impl Default for UploadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadQueue")
            .field("counts", &self.counts())
            .field("revision", &*self.revision.borrow())
            .finish()
    }
}

impl UploadQueue {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState::default()),
            previews: None,
            observer: None,
            revision,
            delivered: Mutex::new(0),
            delivery: Condvar::new(),
        }
    }

    /// Issue previews for image files from this registry
    pub fn with_previews(mut self, registry: PreviewRegistry) -> Self {
        self.previews = Some(registry);
        self
    }

    /// Call `observer` every time the committed-upload list changes
    pub fn on_committed<F>(mut self, observer: F) -> Self
    where
        F: Fn(&[CommittedUpload]) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Append files as new `queued` items, in order
    pub fn enqueue(&self, files: impl IntoIterator<Item = LocalFile>) -> Vec<ItemId> {
        let mut state = self.state.lock();
        let mut ids = Vec::new();

        for file in files {
            state.next_id += 1;
            let id = ItemId(state.next_id);
            let file = Arc::new(file);
            let preview = self.previews.as_ref().and_then(|r| r.create(&file));
            let preview_uri = preview.as_ref().map(|p| p.uri().to_string());

            debug!("Queued {} as {}", file.name(), id);
            state.entries.push(Entry {
                item: UploadItem::new(id, file, preview_uri),
                preview,
            });
            ids.push(id);
        }

        if !ids.is_empty() {
            info!("Queued {} file(s)", ids.len());
            self.publish(state);
        }
        ids
    }

    /// Apply `transform` to the latest snapshot of one item
    ///
    /// The transform returns `None` to leave the item untouched. Returns the
    /// new snapshot when the item exists and was changed.
    pub fn update_by_id<F>(&self, id: ItemId, transform: F) -> Option<UploadItem>
    where
        F: FnOnce(&UploadItem) -> Option<UploadItem>,
    {
        let mut state = self.state.lock();
        let entry = state.entries.iter_mut().find(|e| e.item.id == id)?;
        let mut next = transform(&entry.item)?;
        next.id = id;
        entry.item = next.clone();
        self.publish(state);
        Some(next)
    }

    pub fn begin_signing(&self, id: ItemId) -> Option<UploadItem> {
        self.update_by_id(id, UploadItem::signing)
    }

    pub fn begin_uploading(
        &self,
        id: ItemId,
        descriptor: &TransferDescriptor,
    ) -> Option<UploadItem> {
        self.update_by_id(id, |item| item.uploading(descriptor))
    }

    pub fn record_progress(&self, id: ItemId, attempt: u32, percent: u8) {
        self.update_by_id(id, |item| item.progressed(attempt, percent));
    }

    pub fn mark_success(&self, id: ItemId) -> Option<UploadItem> {
        self.update_by_id(id, UploadItem::succeeded)
    }

    pub fn mark_failed(&self, id: ItemId, message: &str) -> Option<UploadItem> {
        self.update_by_id(id, |item| item.failed(message))
    }

    /// Remove one item, releasing its preview
    pub fn remove(&self, id: ItemId) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.entries.iter().position(|e| e.item.id == id) else {
            return false;
        };

        let entry = state.entries.remove(pos);
        if entry.item.status.is_active() {
            warn!(
                "Removed {} while {}; the transfer keeps running in the background",
                id, entry.item.status
            );
        }
        if let Some(preview) = entry.preview {
            preview.release();
        }

        self.publish(state);
        true
    }

    /// Remove every `success` and `error` item, releasing their previews
    pub fn clear_finished(&self) -> usize {
        let mut state = self.state.lock();
        let (finished, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.entries)
            .into_iter()
            .partition(|e| e.item.status.is_finished());
        state.entries = kept;

        let cleared = finished.len();
        for entry in finished {
            if let Some(preview) = entry.preview {
                preview.release();
            }
        }

        if cleared > 0 {
            debug!("Cleared {} finished item(s)", cleared);
            self.publish(state);
        }
        cleared
    }

    pub fn get(&self, id: ItemId) -> Option<UploadItem> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.item.id == id)
            .map(|e| e.item.clone())
    }

    /// Snapshot of every item in queue order
    pub fn items(&self) -> Vec<UploadItem> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.item.clone())
            .collect()
    }

    pub fn ids_with_status(&self, status: UploadStatus) -> Vec<ItemId> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.item.status == status)
            .map(|e| e.item.id)
            .collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let state = self.state.lock();
        let mut counts = QueueCounts::default();
        for entry in &state.entries {
            match entry.item.status {
                UploadStatus::Queued => counts.queued += 1,
                UploadStatus::Signing | UploadStatus::Uploading => counts.active += 1,
                UploadStatus::Success => counts.succeeded += 1,
                UploadStatus::Error => counts.failed += 1,
            }
        }
        counts
    }

    /// Current committed-upload list, in queue order
    pub fn committed(&self) -> Vec<CommittedUpload> {
        let state = self.state.lock();
        Reconciler::derive(state.entries.iter().map(|e| &e.item))
    }

    /// Watch the revision counter, bumped after every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reconcile under the lock, then notify watchers and the observer without it
    ///
    /// Emissions are numbered under the state lock and delivered strictly in
    /// that order, so the observer always ends on the latest list. The
    /// observer may read the queue but must not mutate it.
    fn publish(&self, mut guard: parking_lot::MutexGuard<'_, QueueState>) {
        let state = &mut *guard;
        let emission = state
            .reconciler
            .reconcile(state.entries.iter().map(|e| &e.item))
            .map(|uploads| {
                state.emitted += 1;
                (state.emitted, uploads)
            });
        drop(guard);

        self.revision.send_modify(|r| *r += 1);

        let Some((seq, uploads)) = emission else {
            return;
        };

        let mut delivered = self.delivered.lock();
        while *delivered + 1 != seq {
            self.delivery.wait(&mut delivered);
        }

        info!("Committed uploads changed: {} file(s)", uploads.len());
        if let Some(observer) = &self.observer {
            observer(&uploads);
        }

        *delivered = seq;
        drop(delivered);
        self.delivery.notify_all();
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut released = 0;
        for entry in state.entries.iter_mut() {
            if let Some(preview) = entry.preview.take() {
                preview.release();
                released += 1;
            }
        }
        if released > 0 {
            debug!("Released {} outstanding preview(s) on teardown", released);
        }
    }
}
