//! Upload requests and their lifecycle.
//!
//! An [`UploadRequest`] wraps one source file from submission to a terminal
//! state. Listeners are registered while the caller still owns the request;
//! submitting it hands ownership to the coordinator, which drives it through
//! the [`UploadState`] machine and fires [`UploadEvent`]s on worker tasks.
//! Callers keep an [`UploadHandle`] to observe progress.

use crate::metadata::PhotoMetadata;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::error;

/// Position of a request in the commit/rollback protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    New,
    MetadataExtracted,
    Rejected,
    KeyAssigned,
    Uploading,
    UploadFailed,
    Uploaded,
    CommittingRecord,
    RecordCommitted,
    RecordRejected,
    Compensating,
    Compensated,
    CompensationFailed,
    /// A derived artifact (route track) reached the output area
    Exported,
}

impl UploadState {
    /// Whether the request can no longer change state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadState::Rejected
                | UploadState::UploadFailed
                | UploadState::RecordCommitted
                | UploadState::Compensated
                | UploadState::CompensationFailed
                | UploadState::Exported
        )
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (New, MetadataExtracted)
                | (New, Rejected)
                | (New, KeyAssigned)
                | (MetadataExtracted, Rejected)
                | (MetadataExtracted, KeyAssigned)
                | (KeyAssigned, Rejected)
                | (KeyAssigned, Uploading)
                | (Uploading, UploadFailed)
                | (Uploading, Uploaded)
                | (Uploaded, CommittingRecord)
                | (Uploaded, Exported)
                | (CommittingRecord, RecordCommitted)
                | (CommittingRecord, RecordRejected)
                | (RecordRejected, Compensating)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
        )
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Rejected state machine edge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid upload state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: UploadState,
    pub to: UploadState,
}

/// Notification delivered to request listeners
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// Bytes transferred so far
    Progress(u64),
    UploadFailed(String),
    Uploaded,
    RecordFailed(String),
    RecordCommitted,
    Removed,
    RemoveFailed(String),
}

/// Where a request's bytes live
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectAddress {
    pub container: String,
    pub key: String,
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

type Listener = Box<dyn Fn(&UploadRequest, &UploadEvent) + Send + Sync>;

/// Single-use handle for one file travelling through the pipeline
pub struct UploadRequest {
    file: PathBuf,
    metadata: OnceLock<PhotoMetadata>,
    address: OnceLock<ObjectAddress>,
    listeners: Vec<Listener>,
    state: watch::Sender<UploadState>,
    // Serializes transitions so a check-then-set can't race
    transition_lock: Mutex<()>,
}

impl UploadRequest {
    /// Wrap a source file
    pub fn new(file: impl Into<PathBuf>) -> Self {
        let (state, _) = watch::channel(UploadState::New);
        Self {
            file: file.into(),
            metadata: OnceLock::new(),
            address: OnceLock::new(),
            listeners: Vec::new(),
            state,
            transition_lock: Mutex::new(()),
        }
    }

    /// Source file path
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Source file name (no directories)
    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Metadata, once extracted
    pub fn metadata(&self) -> Option<&PhotoMetadata> {
        self.metadata.get()
    }

    /// Identity, once assigned
    pub fn identity(&self) -> Option<&str> {
        self.metadata().and_then(|m| m.identity.as_deref())
    }

    /// Container/key, once assigned
    pub fn address(&self) -> Option<&ObjectAddress> {
        self.address.get()
    }

    /// Current state
    pub fn state(&self) -> UploadState {
        *self.state.borrow()
    }

    /// Observe every event, in registration order with the other listeners
    pub fn on_event<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&UploadRequest, &UploadEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
        self
    }

    pub fn on_progress<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_event(move |_, event| {
            if let UploadEvent::Progress(bytes) = event {
                listener(*bytes);
            }
        })
    }

    pub fn on_upload_success<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&UploadRequest) + Send + Sync + 'static,
    {
        self.on_event(move |request, event| {
            if matches!(event, UploadEvent::Uploaded) {
                listener(request);
            }
        })
    }

    pub fn on_upload_failure<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_event(move |_, event| {
            if let UploadEvent::UploadFailed(reason) = event {
                listener(reason);
            }
        })
    }

    pub fn on_db_success<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&UploadRequest) + Send + Sync + 'static,
    {
        self.on_event(move |request, event| {
            if matches!(event, UploadEvent::RecordCommitted) {
                listener(request);
            }
        })
    }

    pub fn on_db_failure<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_event(move |_, event| {
            if let UploadEvent::RecordFailed(reason) = event {
                listener(reason);
            }
        })
    }

    pub fn on_remove_success<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&UploadRequest) + Send + Sync + 'static,
    {
        self.on_event(move |request, event| {
            if matches!(event, UploadEvent::Removed) {
                listener(request);
            }
        })
    }

    pub fn on_remove_failure<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_event(move |_, event| {
            if let UploadEvent::RemoveFailed(reason) = event {
                listener(reason);
            }
        })
    }

    /// Fire `event` at every listener in registration order.
    ///
    /// A panicking listener is logged and skipped; the remaining listeners
    /// still run and the request keeps moving.
    pub(crate) fn emit(&self, event: UploadEvent) {
        for (position, listener) in self.listeners.iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(self, &event)));
            if let Err(payload) = outcome {
                error!(
                    file = %self.file.display(),
                    listener = position,
                    event = ?event,
                    panic = panic_message(payload.as_ref()),
                    "Upload listener panicked"
                );
            }
        }
    }

    pub(crate) fn attach_metadata(&self, metadata: PhotoMetadata) {
        // Identity is immutable once attached
        let _ = self.metadata.set(metadata);
    }

    pub(crate) fn assign_address(&self, address: ObjectAddress) {
        let _ = self.address.set(address);
    }

    /// Move to `next`, failing if the edge does not exist
    pub(crate) fn advance(&self, next: UploadState) -> Result<(), InvalidTransition> {
        let _guard = self.transition_lock.lock();
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.state.send_replace(next);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.state.subscribe()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("file", &self.file)
            .field("address", &self.address.get())
            .field("state", &self.state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Caller-side view of a submitted request
#[derive(Debug, Clone)]
pub struct UploadHandle {
    request: Arc<UploadRequest>,
}

impl UploadHandle {
    pub(crate) fn new(request: Arc<UploadRequest>) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &UploadRequest {
        &self.request
    }

    pub fn state(&self) -> UploadState {
        self.request.state()
    }

    /// Wait until the request reaches a terminal state
    pub async fn wait(&self) -> UploadState {
        let mut rx = self.request.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // The sender lives inside the request we hold, so this is unreachable
            Err(_) => self.request.state(),
        };
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let request = UploadRequest::new("/photos/IMG_001.jpg");
        for next in [
            UploadState::MetadataExtracted,
            UploadState::KeyAssigned,
            UploadState::Uploading,
            UploadState::Uploaded,
            UploadState::CommittingRecord,
            UploadState::RecordCommitted,
        ] {
            request.advance(next).unwrap();
        }
        assert!(request.state().is_terminal());
    }

    #[test]
    fn test_no_state_is_reentered() {
        let request = UploadRequest::new("/photos/IMG_001.jpg");
        request.advance(UploadState::MetadataExtracted).unwrap();
        request.advance(UploadState::KeyAssigned).unwrap();
        request.advance(UploadState::Uploading).unwrap();
        request.advance(UploadState::Uploaded).unwrap();
        request.advance(UploadState::CommittingRecord).unwrap();
        request.advance(UploadState::RecordRejected).unwrap();
        request.advance(UploadState::Compensating).unwrap();

        let err = request.advance(UploadState::Compensating).unwrap_err();
        assert_eq!(err.from, UploadState::Compensating);
        assert_eq!(err.to, UploadState::Compensating);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let terminals = [
            UploadState::Rejected,
            UploadState::UploadFailed,
            UploadState::RecordCommitted,
            UploadState::Compensated,
            UploadState::CompensationFailed,
            UploadState::Exported,
        ];
        for terminal in terminals {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(UploadState::Uploading));
            assert!(!terminal.can_transition_to(UploadState::Compensating));
        }
    }

    #[test]
    fn test_listeners_compose_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut request = UploadRequest::new("/photos/IMG_001.jpg");

        let first = seen.clone();
        request.on_upload_success(move |_| first.lock().push("first"));
        let second = seen.clone();
        request.on_upload_success(move |_| second.lock().push("second"));
        let failures = seen.clone();
        request.on_upload_failure(move |_| failures.lock().push("failure"));

        request.emit(UploadEvent::Uploaded);

        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_the_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut request = UploadRequest::new("/photos/IMG_001.jpg");

        request.on_upload_success(|_| panic!("listener bug"));
        let after = seen.clone();
        request.on_upload_success(move |_| after.lock().push("after"));

        request.emit(UploadEvent::Uploaded);
        request.emit(UploadEvent::Uploaded);

        assert_eq!(*seen.lock(), vec!["after", "after"]);
    }

    #[test]
    fn test_file_name() {
        let request = UploadRequest::new("/photos/2018/IMG_002.jpg");
        assert_eq!(request.file_name(), "IMG_002.jpg");
    }

    #[tokio::test]
    async fn test_handle_wait_returns_terminal_state() {
        let request = Arc::new(UploadRequest::new("/photos/IMG_001_E.jpg"));
        let handle = UploadHandle::new(request.clone());

        let waiter = tokio::spawn(async move { handle.wait().await });
        request.advance(UploadState::Rejected).unwrap();

        assert_eq!(waiter.await.unwrap(), UploadState::Rejected);
    }
}
