//! Open-document tracking and `didOpen`/`didChange`/`didClose` sync.
//!
//! Each URI owns an async slot that is held across the notification send,
//! so changes to one document go out in order with strictly increasing
//! versions. Tracking state is committed only once the sink has confirmed
//! the notification was written; a failed send leaves the slot untouched.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::LspError;
use crate::protocol::{self, SyncMode, WirePosition, WireRange};

const DID_OPEN: &str = "textDocument/didOpen";
const DID_CHANGE: &str = "textDocument/didChange";
const DID_CLOSE: &str = "textDocument/didClose";

/// Where document notifications are sent.
///
/// `send_notification` resolves only after the frame has been written (or
/// failed to be).
pub trait NotificationSink: Send + Sync {
    fn send_notification(
        &self,
        method: &'static str,
        params: Value,
    ) -> impl Future<Output = Result<(), LspError>> + Send;
}

/// A document the server currently has open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDocument {
    pub uri: String,
    pub language_id: String,
    pub version: i32,
    /// How the last change was delivered.
    pub sync: SyncMode,
    /// The content as last sent to the server.
    pub text: String,
}

type Slot = Arc<AsyncMutex<Option<OpenDocument>>>;

#[derive(Debug, Default)]
pub struct DocumentStore {
    // Slots are never removed: a closed document keeps an empty slot so a
    // concurrent reopen serializes on the same lock.
    slots: Mutex<HashMap<String, Slot>>,
    sync_mode: Mutex<SyncMode>,
}

impl DocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how changes are delivered, as negotiated during `initialize`.
    pub fn set_sync_mode(&self, mode: SyncMode) {
        *self.sync_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        *self.sync_mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, uri: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(uri.to_string()).or_default())
    }

    fn existing_slots(&self) -> Vec<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Open `uri` with `text` unless it is already open.
    ///
    /// Returns `true` if a `didOpen` was sent.
    pub async fn ensure_open<S: NotificationSink>(
        &self,
        sink: &S,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> Result<bool, LspError> {
        let slot = self.slot(uri);
        let mut doc = slot.lock().await;
        if doc.is_some() {
            return Ok(false);
        }
        *doc = Some(open(sink, uri, language_id, text).await?);
        Ok(true)
    }

    /// Report new content for `uri`.
    ///
    /// Opens the document if it is not tracked. Returns the version the
    /// server now holds, or `None` when the content was unchanged and
    /// nothing was sent.
    pub async fn notify_change<S: NotificationSink>(
        &self,
        sink: &S,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> Result<Option<i32>, LspError> {
        let slot = self.slot(uri);
        let mut guard = slot.lock().await;
        let Some(doc) = guard.as_mut() else {
            let opened = open(sink, uri, language_id, text).await?;
            let version = opened.version;
            *guard = Some(opened);
            return Ok(Some(version));
        };
        if doc.text == text {
            return Ok(None);
        }

        let version = doc.version + 1;
        let mode = self.sync_mode();
        let params = match mode {
            SyncMode::Full => protocol::did_change_full_params(uri, version, text),
            SyncMode::Incremental => {
                let (range, replacement) = incremental_change(&doc.text, text);
                protocol::did_change_range_params(uri, version, range, replacement)
            }
        };
        sink.send_notification(DID_CHANGE, params)
            .await
            .map_err(|e| LspError::sync(uri, e))?;

        doc.version = version;
        doc.sync = mode;
        text.clone_into(&mut doc.text);
        tracing::trace!(uri = %uri, version, ?mode, "Document changed");
        Ok(Some(version))
    }

    /// Close `uri`. Returns `false` if it was not open.
    pub async fn close<S: NotificationSink>(&self, sink: &S, uri: &str) -> Result<bool, LspError> {
        let slot = self.slot(uri);
        let mut doc = slot.lock().await;
        if doc.is_none() {
            return Ok(false);
        }
        sink.send_notification(DID_CLOSE, protocol::did_close_params(uri))
            .await
            .map_err(|e| LspError::sync(uri, e))?;
        *doc = None;
        tracing::trace!(uri = %uri, "Document closed");
        Ok(true)
    }

    pub async fn is_open(&self, uri: &str) -> bool {
        self.slot(uri).lock().await.is_some()
    }

    pub async fn version(&self, uri: &str) -> Option<i32> {
        self.slot(uri).lock().await.as_ref().map(|d| d.version)
    }

    /// URIs of every open document, sorted.
    pub async fn open_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .open_documents()
            .await
            .into_iter()
            .map(|d| d.uri)
            .collect();
        uris.sort();
        uris
    }

    /// Copies of every open document.
    pub async fn open_documents(&self) -> Vec<OpenDocument> {
        let mut docs = Vec::new();
        for slot in self.existing_slots() {
            if let Some(doc) = slot.lock().await.as_ref() {
                docs.push(doc.clone());
            }
        }
        docs
    }
}

async fn open<S: NotificationSink>(
    sink: &S,
    uri: &str,
    language_id: &str,
    text: &str,
) -> Result<OpenDocument, LspError> {
    sink.send_notification(
        DID_OPEN,
        protocol::did_open_params(uri, language_id, 1, text),
    )
    .await
    .map_err(|e| LspError::sync(uri, e))?;
    tracing::debug!(uri = %uri, language_id, "Document opened");
    Ok(OpenDocument {
        uri: uri.to_string(),
        language_id: language_id.to_string(),
        version: 1,
        sync: SyncMode::Full,
        text: text.to_string(),
    })
}

/// The single range replacement turning `old` into `new`.
///
/// The range covers everything between the common prefix and the common
/// suffix, in protocol (UTF-16) coordinates of `old`. Neither end is placed
/// between a `\r` and its `\n`.
fn incremental_change<'a>(old: &str, new: &'a str) -> (WireRange, &'a str) {
    let mut prefix = 0;
    for (a, b) in old.chars().zip(new.chars()) {
        if a != b {
            break;
        }
        prefix += a.len_utf8();
    }
    while prefix > 0 && old.as_bytes()[prefix - 1] == b'\r' {
        prefix -= 1;
    }

    let max_suffix = old.len().min(new.len()) - prefix;
    let mut suffix = 0;
    for (a, b) in old[prefix..].chars().rev().zip(new[prefix..].chars().rev()) {
        if a != b || suffix + a.len_utf8() > max_suffix {
            break;
        }
        suffix += a.len_utf8();
    }
    let old_end = old.len() - suffix;
    if suffix > 0
        && old_end > prefix
        && old.as_bytes()[old_end - 1] == b'\r'
        && old.as_bytes()[old_end] == b'\n'
    {
        suffix -= 1;
    }

    let range = WireRange {
        start: wire_position(old, prefix),
        end: wire_position(old, old.len() - suffix),
    };
    (range, &new[prefix..new.len() - suffix])
}

/// Protocol position of byte `offset` in `text`.
fn wire_position(text: &str, offset: usize) -> WirePosition {
    let before = &text[..offset];
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let line = before.bytes().filter(|&b| b == b'\n').count();
    let character = before[line_start..].encode_utf16().count();
    WirePosition {
        line: u32::try_from(line).unwrap_or(u32::MAX),
        character: u32::try_from(character).unwrap_or(u32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(&'static str, Value)>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn methods(&self) -> Vec<&'static str> {
            self.sent.lock().unwrap().iter().map(|(m, _)| *m).collect()
        }

        fn last(&self) -> Value {
            self.sent.lock().unwrap().last().unwrap().1.clone()
        }
    }

    impl NotificationSink for RecordingSink {
        async fn send_notification(&self, method: &'static str, params: Value) -> Result<(), LspError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LspError::Transport("pipe closed".into()));
            }
            self.sent.lock().unwrap().push((method, params));
            Ok(())
        }
    }

    const URI: &str = "file:///w/main.rs";

    #[tokio::test]
    async fn ensure_open_sends_once() {
        let store = DocumentStore::new();
        let sink = RecordingSink::default();
        assert!(store.ensure_open(&sink, URI, "rust", "fn main() {}").await.unwrap());
        assert!(!store.ensure_open(&sink, URI, "rust", "fn main() {}").await.unwrap());
        assert_eq!(sink.methods(), vec![DID_OPEN]);
        assert_eq!(sink.last()["textDocument"]["version"], 1);
        assert_eq!(store.version(URI).await, Some(1));
    }

    #[tokio::test]
    async fn concurrent_opens_send_one_did_open() {
        let store = Arc::new(DocumentStore::new());
        let sink = Arc::new(RecordingSink::default());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let sink = Arc::clone(&sink);
                tokio::spawn(async move { store.ensure_open(&*sink, URI, "rust", "x").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(sink.methods(), vec![DID_OPEN]);
    }

    #[tokio::test]
    async fn versions_increase_and_unchanged_is_noop() {
        let store = DocumentStore::new();
        let sink = RecordingSink::default();
        store.ensure_open(&sink, URI, "rust", "a").await.unwrap();
        assert_eq!(store.notify_change(&sink, URI, "rust", "b").await.unwrap(), Some(2));
        assert_eq!(store.notify_change(&sink, URI, "rust", "b").await.unwrap(), None);
        assert_eq!(store.notify_change(&sink, URI, "rust", "c").await.unwrap(), Some(3));
        assert_eq!(sink.methods(), vec![DID_OPEN, DID_CHANGE, DID_CHANGE]);
        let last = sink.last();
        assert_eq!(last["textDocument"]["version"], 3);
        assert_eq!(last["contentChanges"][0]["text"], "c");
    }

    #[tokio::test]
    async fn change_on_untracked_uri_opens_it() {
        let store = DocumentStore::new();
        let sink = RecordingSink::default();
        assert_eq!(store.notify_change(&sink, URI, "rust", "a").await.unwrap(), Some(1));
        assert_eq!(sink.methods(), vec![DID_OPEN]);
    }

    #[tokio::test]
    async fn failed_send_leaves_state_untouched() {
        let store = DocumentStore::new();
        let sink = RecordingSink::default();
        sink.fail.store(true, Ordering::SeqCst);
        let err = store.ensure_open(&sink, URI, "rust", "a").await.unwrap_err();
        assert!(matches!(err, LspError::Sync { .. }));
        assert!(!store.is_open(URI).await);

        sink.fail.store(false, Ordering::SeqCst);
        store.ensure_open(&sink, URI, "rust", "a").await.unwrap();
        sink.fail.store(true, Ordering::SeqCst);
        assert!(store.notify_change(&sink, URI, "rust", "b").await.is_err());
        assert_eq!(store.version(URI).await, Some(1));

        // A retry after the failure sends the same version again.
        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(store.notify_change(&sink, URI, "rust", "b").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn close_then_reopen_restarts_versions() {
        let store = DocumentStore::new();
        let sink = RecordingSink::default();
        store.ensure_open(&sink, URI, "rust", "a").await.unwrap();
        store.notify_change(&sink, URI, "rust", "b").await.unwrap();
        assert!(store.close(&sink, URI).await.unwrap());
        assert!(!store.close(&sink, URI).await.unwrap());
        assert!(store.open_uris().await.is_empty());

        store.ensure_open(&sink, URI, "rust", "b").await.unwrap();
        assert_eq!(store.version(URI).await, Some(1));
        assert_eq!(sink.methods(), vec![DID_OPEN, DID_CHANGE, DID_CLOSE, DID_OPEN]);
    }

    #[tokio::test]
    async fn incremental_mode_sends_a_range() {
        let store = DocumentStore::new();
        store.set_sync_mode(SyncMode::Incremental);
        let sink = RecordingSink::default();
        store.ensure_open(&sink, URI, "rust", "fn main() {}\n").await.unwrap();
        store
            .notify_change(&sink, URI, "rust", "fn main() { 42 }\n")
            .await
            .unwrap();
        let change = &sink.last()["contentChanges"][0];
        assert_eq!(change["text"], " 42 ");
        assert_eq!(change["range"]["start"]["character"], 11);
        assert_eq!(change["range"]["end"]["character"], 11);
        let docs = store.open_documents().await;
        assert_eq!(docs[0].sync, SyncMode::Incremental);
        assert_eq!(docs[0].text, "fn main() { 42 }\n");
    }

    #[test]
    fn incremental_change_counts_utf16() {
        let (range, text) = incremental_change("é = 1\n", "é = 2\n");
        assert_eq!(text, "2");
        assert_eq!((range.start.line, range.start.character), (0, 4));
        assert_eq!((range.end.line, range.end.character), (0, 5));

        let (range, text) = incremental_change("a\n😀b\n", "a\n😀c\n");
        assert_eq!(text, "c");
        assert_eq!((range.start.line, range.start.character), (1, 2));
    }

    #[test]
    fn incremental_change_multiline_and_deletion() {
        let (range, text) = incremental_change("one\ntwo\nthree\n", "one\nthree\n");
        assert_eq!(text, "");
        assert_eq!((range.start.line, range.start.character), (1, 1));
        assert_eq!((range.end.line, range.end.character), (2, 1));

        let (range, text) = incremental_change("ab", "ab\ncd");
        assert_eq!(text, "\ncd");
        assert_eq!(range.start, range.end);
    }

    #[test]
    fn incremental_change_never_splits_crlf() {
        let (range, text) = incremental_change("a\r\nb", "a\r\r\nb");
        assert_eq!((range.start.line, range.start.character), (0, 1));
        assert!(text.starts_with('\r'));
    }
}
