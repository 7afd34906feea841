//! Consumer of server-pushed messages.
//!
//! Runs as its own task so a slow handler never stalls the receive loop.
//! Notifications are handled strictly in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::diagnostics::DiagnosticsCache;
use crate::protocol::{LspDiagnostic, METHOD_NOT_FOUND, Message, PublishDiagnosticsParams};
use crate::transport::{Inbound, Outbox};
use crate::types::DiagnosticStamp;

/// Callback for a server notification, given its `params` (or `null`).
pub type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Caller-registered notification handlers, keyed by method.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<NotificationHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&self, method: impl Into<String>, handler: NotificationHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.into())
            .or_default()
            .push(handler);
    }

    fn for_method(&self, method: &str) -> Vec<NotificationHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
            .unwrap_or_default()
    }
}

/// Counters kept by the dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub notifications: AtomicU64,
    pub server_requests: AtomicU64,
    pub decode_errors: AtomicU64,
}

pub(crate) struct Dispatcher {
    pub server: String,
    pub root_uri: Option<String>,
    pub cache: Arc<DiagnosticsCache>,
    pub outbox: Outbox,
    pub handlers: Arc<HandlerRegistry>,
    pub stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Drain `inbound_rx` until the transport drops its sender.
    pub fn spawn(self, mut inbound_rx: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sequence = 0u64;
            while let Some(message) = inbound_rx.recv().await {
                match message {
                    Inbound::Notification { method, params } => {
                        self.stats.notifications.fetch_add(1, Ordering::Relaxed);
                        let params = params.unwrap_or(Value::Null);
                        self.handle_notification(&method, &params, &mut sequence);
                        for handler in self.handlers.for_method(&method) {
                            handler(&params);
                        }
                    }
                    Inbound::ServerRequest { id, method, params } => {
                        self.stats.server_requests.fetch_add(1, Ordering::Relaxed);
                        let reply = self.answer(id, &method, params.as_ref());
                        let outbox = self.outbox.clone();
                        tokio::spawn(async move {
                            if let Err(e) = outbox.send(&reply).await {
                                tracing::debug!("Failed to answer server request: {e}");
                            }
                        });
                    }
                    Inbound::DecodeError(reason) => {
                        self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(server = %self.server, %reason, "Decode error recorded");
                    }
                }
            }
            tracing::trace!(server = %self.server, "Dispatcher stopped");
        })
    }

    fn handle_notification(&self, method: &str, params: &Value, sequence: &mut u64) {
        match method {
            "textDocument/publishDiagnostics" => {
                match serde_json::from_value::<PublishDiagnosticsParams>(params.clone()) {
                    Ok(diag_params) => {
                        *sequence += 1;
                        let items = diag_params
                            .diagnostics
                            .iter()
                            .map(LspDiagnostic::to_diagnostic)
                            .collect();
                        let stamp = DiagnosticStamp {
                            version: diag_params.version,
                            sequence: *sequence,
                        };
                        self.cache.update(&diag_params.uri, items, stamp);
                    }
                    Err(e) => {
                        self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            server = %self.server,
                            "Failed to parse publishDiagnostics: {e}"
                        );
                    }
                }
            }
            "window/logMessage" => log_server_message(&self.server, params, false),
            "window/showMessage" => log_server_message(&self.server, params, true),
            _ => {
                tracing::trace!(server = %self.server, method, "Ignoring notification");
            }
        }
    }

    /// Build the reply to a server-initiated request.
    ///
    /// Servers commonly block until these are answered, so every request
    /// gets a reply; anything unrecognized gets `MethodNotFound`.
    fn answer(&self, id: Value, method: &str, params: Option<&Value>) -> Message {
        tracing::debug!(server = %self.server, method, "Server request");
        match method {
            "workspace/configuration" => {
                let count = params
                    .and_then(|p| p["items"].as_array())
                    .map_or(0, Vec::len);
                Message::reply(id, Value::Array(vec![Value::Null; count]))
            }
            "workspace/workspaceFolders" => {
                let folders = self.root_uri.as_ref().map_or(Value::Null, |uri| {
                    json!([{ "uri": uri, "name": "workspace" }])
                });
                Message::reply(id, folders)
            }
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create"
            | "window/showMessageRequest" => Message::reply(id, Value::Null),
            "workspace/applyEdit" => Message::reply(
                id,
                json!({
                    "applied": false,
                    "failureReason": "edits are returned to the caller, not applied"
                }),
            ),
            _ => Message::reply_error(id, METHOD_NOT_FOUND, format!("Method not found: {method}")),
        }
    }
}

/// Map `window/logMessage` / `window/showMessage` onto tracing levels.
fn log_server_message(server: &str, params: &Value, shown: bool) {
    let message = params["message"].as_str().unwrap_or_default();
    match params["type"].as_u64() {
        Some(1) => tracing::error!(server, shown, "{message}"),
        Some(2) => tracing::warn!(server, shown, "{message}"),
        Some(3) if shown => tracing::info!(server, shown, "{message}"),
        Some(3) => tracing::debug!(server, shown, "{message}"),
        _ => tracing::trace!(server, shown, "{message}"),
    }
}
