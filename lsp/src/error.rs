//! Error taxonomy for the client runtime.
//!
//! Every public operation returns [`LspError`]. The variants separate faults
//! that end the session (`Transport`, `SessionClosed`) from faults scoped to a
//! single call (`Protocol`, `Timeout`, `NotReady`, `Sync`, ...). An empty
//! answer from the server is never an error.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// The byte stream to the server is closed or a frame could not be written.
    #[error("transport fault: {0}")]
    Transport(String),

    /// The server answered with a JSON-RPC error response.
    #[error("server error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("{method} timed out after {}ms", after.as_millis())]
    Timeout {
        method: &'static str,
        after: Duration,
    },

    /// The handshake has not completed yet; no I/O was attempted.
    #[error("session not ready (state: {0})")]
    NotReady(SessionState),

    /// A document open/change/close notification could not be sent.
    /// Tracking state was left untouched.
    #[error("failed to synchronize {uri}: {source}")]
    Sync {
        uri: String,
        #[source]
        source: Box<LspError>,
    },

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// Line and column are one-indexed at the API boundary.
    #[error("invalid position {line}:{column} (line and column are 1-indexed)")]
    InvalidPosition { line: u32, column: u32 },

    #[error("invalid {method} response: {reason}")]
    InvalidResponse {
        method: &'static str,
        reason: String,
    },

    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("cannot convert path to file URI: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LspError {
    /// Whether this error means the session can no longer serve requests.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::SessionClosed(_))
    }

    /// Wrap a send failure for a document sync notification.
    pub(crate) fn sync(uri: &str, source: LspError) -> Self {
        Self::Sync {
            uri: uri.to_string(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn fatal_kinds() {
        assert!(LspError::Transport("broken pipe".into()).is_fatal());
        assert!(LspError::SessionClosed("exited".into()).is_fatal());
        assert!(
            !LspError::Protocol {
                code: -32601,
                message: "nope".into()
            }
            .is_fatal()
        );
        assert!(
            !LspError::Timeout {
                method: "textDocument/hover",
                after: Duration::from_millis(5)
            }
            .is_fatal()
        );
    }

    #[test]
    fn sync_error_keeps_source() {
        let err = LspError::sync("file:///a.rs", LspError::Transport("closed".into()));
        let source = err.source().expect("has source");
        assert_eq!(source.to_string(), "transport fault: closed");
        assert!(err.to_string().contains("file:///a.rs"));
    }

    #[test]
    fn not_ready_mentions_state() {
        let err = LspError::NotReady(SessionState::Starting);
        assert_eq!(err.to_string(), "session not ready (state: starting)");
    }
}
