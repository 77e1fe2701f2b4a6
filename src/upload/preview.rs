//! Revocable preview resources for image uploads.
//!
//! A preview is a short URI (`preview://N`) that a presentation layer can
//! resolve back to the file it was issued for. Handles are owned by exactly
//! one queue item and revoke their URI when released or dropped, so a
//! preview can never be revoked twice or used after revocation.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::file::LocalFile;
use super::helpers::is_image;

#[derive(Debug, Default)]
struct RegistryState {
    next: u64,
    live: HashMap<String, Arc<LocalFile>>,
    revoked: u64,
}

/// Issues and revokes preview URIs
#[derive(Debug, Clone, Default)]
pub struct PreviewRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a preview for image files; other content types get none
    pub fn create(&self, file: &Arc<LocalFile>) -> Option<PreviewHandle> {
        if !is_image(file.content_type()) {
            return None;
        }

        let mut state = self.state.lock();
        state.next += 1;
        let uri = format!("preview://{}", state.next);
        state.live.insert(uri.clone(), Arc::clone(file));
        debug!("Created preview {} for {}", uri, file.name());

        Some(PreviewHandle {
            uri,
            registry: self.clone(),
        })
    }

    /// Look up the file behind a live preview URI
    pub fn resolve(&self, uri: &str) -> Option<Arc<LocalFile>> {
        self.state.lock().live.get(uri).cloned()
    }

    /// Number of previews issued and not yet revoked
    pub fn outstanding(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of previews revoked so far
    pub fn revoked(&self) -> u64 {
        self.state.lock().revoked
    }

    fn revoke(&self, uri: &str) {
        let mut state = self.state.lock();
        if state.live.remove(uri).is_some() {
            state.revoked += 1;
            debug!("Revoked preview {}", uri);
        }
    }
}

/// Exclusive ownership of one preview URI
#[derive(Debug)]
pub struct PreviewHandle {
    uri: String,
    registry: PreviewRegistry,
}

impl PreviewHandle {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Revoke the preview now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.registry.revoke(&self.uri);
    }
}
