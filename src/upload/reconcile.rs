use serde::Serialize;
use std::sync::Arc;

use super::queue::{UploadItem, UploadStatus};

/// One successfully committed upload, as reported to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedUpload {
    pub object_name: String,
    pub public_url: String,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}

/// Callback told about every distinct committed-upload list
pub type CommittedObserver = Arc<dyn Fn(&[CommittedUpload]) + Send + Sync>;

/// Tracks the last committed list emitted so unchanged lists are not re-sent
#[derive(Debug, Default)]
pub struct Reconciler {
    last_signature: String,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed uploads in queue order
    pub fn derive<'a>(items: impl IntoIterator<Item = &'a UploadItem>) -> Vec<CommittedUpload> {
        items
            .into_iter()
            .filter(|item| item.status == UploadStatus::Success)
            .filter_map(|item| {
                let object_name = item.object_name.as_ref().filter(|n| !n.is_empty())?;
                let public_url = item.public_url.as_ref().filter(|u| !u.is_empty())?;
                Some(CommittedUpload {
                    object_name: object_name.clone(),
                    public_url: public_url.clone(),
                    file_name: item.file.name().to_string(),
                    content_type: item.file.content_type().to_string(),
                    size: item.file.size(),
                })
            })
            .collect()
    }

    pub fn signature(uploads: &[CommittedUpload]) -> String {
        uploads
            .iter()
            .map(|u| u.object_name.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Recompute the committed list, returning it only when it changed
    pub fn reconcile<'a>(
        &mut self,
        items: impl IntoIterator<Item = &'a UploadItem>,
    ) -> Option<Vec<CommittedUpload>> {
        let uploads = Self::derive(items);
        let signature = Self::signature(&uploads);
        if signature == self.last_signature {
            return None;
        }
        self.last_signature = signature;
        Some(uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::file::LocalFile;
    use crate::upload::queue::ItemId;

    fn item(id: u64, status: UploadStatus, object_name: Option<&str>) -> UploadItem {
        let mut item = UploadItem::new(
            ItemId::from_raw(id),
            Arc::new(LocalFile::from_bytes(
                format!("f{}.png", id),
                Some("image/png".to_string()),
                vec![0u8; 4],
            )),
            None,
        );
        item.status = status;
        item.object_name = object_name.map(str::to_string);
        item.public_url = object_name.map(|n| format!("https://cdn/{}", n));
        item
    }

    #[test]
    fn test_empty_list_never_emits() {
        let mut reconciler = Reconciler::new();
        assert!(reconciler.reconcile(&Vec::<UploadItem>::new()).is_none());
        let queued = [item(1, UploadStatus::Queued, None)];
        assert!(reconciler.reconcile(&queued).is_none());
    }

    #[test]
    fn test_emits_once_per_distinct_list() {
        let mut reconciler = Reconciler::new();
        let mut items = vec![
            item(1, UploadStatus::Success, Some("uploads/a")),
            item(2, UploadStatus::Uploading, Some("uploads/b")),
        ];

        let first = reconciler.reconcile(&items).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].object_name, "uploads/a");
        assert_eq!(first[0].file_name, "f1.png");
        assert_eq!(first[0].size, 4);

        items[1].progress = 41;
        assert!(reconciler.reconcile(&items).is_none());

        items[1].status = UploadStatus::Success;
        assert_eq!(reconciler.reconcile(&items).unwrap().len(), 2);
        assert!(reconciler.reconcile(&items).is_none());

        items.remove(0);
        assert_eq!(reconciler.reconcile(&items).unwrap().len(), 1);
    }

    #[test]
    fn test_success_without_names_is_skipped() {
        let items = [item(1, UploadStatus::Success, None)];
        assert!(Reconciler::derive(&items).is_empty());
    }
}
