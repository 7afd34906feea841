//! LSP client runtime.
//!
//! Drives one language server per [`Client`]: Content-Length framing,
//! request/response correlation with per-call timeouts, document
//! synchronization, a push-diagnostics cache, and subprocess supervision.
//! Operations take 1-indexed line/column positions and return normalized
//! results ([`Location`], [`Hover`], [`RenameEdits`], [`Symbol`]).

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

mod client;
mod diagnostics;
mod dispatcher;
mod documents;
mod protocol;
mod registry;
mod session;
mod supervisor;
mod transport;

pub use client::{Client, ClientOptions};
pub use config::{LspConfig, ServerConfig};
pub use dispatcher::{DispatchStats, NotificationHandler};
pub use error::LspError;
pub use protocol::SyncMode;
pub use session::SessionState;
pub use supervisor::{ProcessState, STDERR_TAIL_LINES, ServerProcess};
pub use types::{
    Diagnostic, DiagnosticSeverity, DiagnosticSet, DiagnosticStamp, FileEdits, Hover, Location,
    Position, Range, RenameEdits, Symbol, SymbolKind, TextEdit,
};
