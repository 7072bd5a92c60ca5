use crate::request::UploadRequest;
use parking_lot::Mutex;
use std::sync::Arc;

/// Photos committed during this process lifetime, in commit order
#[derive(Debug, Default)]
pub struct Session {
    entries: Mutex<Vec<Arc<UploadRequest>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: Arc<UploadRequest>) {
        self.entries.lock().push(request);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Current entries, oldest first
    pub fn snapshot(&self) -> Vec<Arc<UploadRequest>> {
        self.entries.lock().clone()
    }

    /// Drop the given entries, keeping anything committed since the snapshot
    pub fn remove_exported(&self, exported: &[Arc<UploadRequest>]) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| !exported.iter().any(|done| Arc::ptr_eq(done, entry)));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
