//! Framed duplex transport: one writer task, one receive loop.
//!
//! The writer task is the only thing that touches the server's input stream;
//! every send carries an acknowledgement so callers learn whether their bytes
//! were written. The receive loop hands responses straight to the registry
//! and forwards everything else to the dispatcher without waiting on it.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameError, FrameReader, FrameWriter};
use crate::documents::NotificationSink;
use crate::error::LspError;
use crate::protocol::Message;
use crate::registry::{Fulfillment, RequestRegistry};
use crate::session::{SessionCell, SessionState};

const WRITER_CHANNEL_CAPACITY: usize = 64;

enum WriterCommand {
    Send {
        frame: Value,
        ack: oneshot::Sender<io::Result<()>>,
    },
    Close,
}

/// A server-to-client message that is not a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Notification {
        method: String,
        params: Option<Value>,
    },
    ServerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// A frame that could not be decoded; the loop carried on.
    DecodeError(String),
}

/// Everything needed to end a session from inside a transport task.
#[derive(Clone)]
struct Closer {
    registry: Arc<RequestRegistry>,
    session: SessionCell,
}

impl Closer {
    fn close(&self, reason: &str) {
        let expected = self.session.get() == SessionState::ShuttingDown;
        self.registry.close_all(reason);
        if self.session.terminate() {
            if expected {
                tracing::debug!(reason, "Language server stream closed");
            } else {
                tracing::warn!(reason, "Language server session ended");
            }
        }
    }
}

/// Cloneable handle on the writer task.
#[derive(Clone)]
pub(crate) struct Outbox {
    writer_tx: mpsc::Sender<WriterCommand>,
}

impl Outbox {
    /// Write one message; resolves once the frame is flushed.
    pub async fn send(&self, message: &Message) -> Result<(), LspError> {
        let (ack, written) = oneshot::channel();
        self.writer_tx
            .send(WriterCommand::Send {
                frame: message.to_value(),
                ack,
            })
            .await
            .map_err(|_| LspError::Transport("writer closed".to_string()))?;
        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LspError::Transport(format!("write failed: {e}"))),
            Err(_) => Err(LspError::Transport("writer closed".to_string())),
        }
    }
}

pub struct Transport {
    outbox: Outbox,
    registry: Arc<RequestRegistry>,
    next_id: AtomicU64,
    reader_handle: JoinHandle<()>,
}

impl Transport {
    /// Attach to a byte-stream pair and start the writer and receive tasks.
    ///
    /// Non-response messages are forwarded on `inbound_tx`. A fatal stream
    /// fault fails every pending call and terminates `session`.
    pub(crate) fn spawn<R, W>(
        reader: R,
        writer: W,
        registry: Arc<RequestRegistry>,
        session: SessionCell,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let closer = Closer {
            registry: Arc::clone(&registry),
            session,
        };

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_closer = closer.clone();
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send { frame, ack } => {
                        tracing::trace!(frame = %frame, "-> server");
                        match writer.write_frame(&frame).await {
                            Ok(()) => {
                                let _ = ack.send(Ok(()));
                            }
                            Err(e) => {
                                let reason = format!("write to server failed: {e}");
                                let _ = ack.send(Err(e));
                                writer_closer.close(&reason);
                                break;
                            }
                        }
                    }
                    WriterCommand::Close => {
                        if let Err(e) = writer.close().await {
                            tracing::debug!("Closing server input failed: {e}");
                        }
                        break;
                    }
                }
            }
        });

        let reader_registry = Arc::clone(&registry);
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => route(frame, &reader_registry, &inbound_tx),
                    Ok(None) => {
                        closer.close("server closed its output stream");
                        break;
                    }
                    Err(FrameError::Malformed(reason)) => {
                        tracing::warn!(%reason, "Skipping malformed frame");
                        let _ = inbound_tx.send(Inbound::DecodeError(reason));
                    }
                    Err(FrameError::Io(e)) => {
                        closer.close(&format!("read from server failed: {e}"));
                        break;
                    }
                }
            }
        });

        Self {
            outbox: Outbox { writer_tx },
            registry,
            next_id: AtomicU64::new(1),
            reader_handle,
        }
    }

    pub(crate) fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub async fn send(&self, message: &Message) -> Result<(), LspError> {
        self.outbox.send(message).await
    }

    /// Issue a request and await its response.
    ///
    /// The id is registered before the frame is written so a fast response
    /// cannot race past its own registration. Server error responses come
    /// back as [`LspError::Protocol`].
    pub async fn call(
        &self,
        method: &'static str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = self.registry.register(id, method, timeout)?;
        self.send(&Message::request(id, method, params)).await?;
        tracing::trace!(id, method, "Request sent");
        handle.wait().await
    }

    pub async fn notify(&self, method: &'static str, params: Option<Value>) -> Result<(), LspError> {
        self.send(&Message::notification(method, params)).await
    }

    /// Close the server's input stream after any queued frames are written.
    pub async fn close(&self) {
        let _ = self.outbox.writer_tx.send(WriterCommand::Close).await;
    }
}

impl NotificationSink for Transport {
    async fn send_notification(&self, method: &'static str, params: Value) -> Result<(), LspError> {
        self.notify(method, Some(params)).await
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn route(frame: Value, registry: &RequestRegistry, inbound_tx: &mpsc::UnboundedSender<Inbound>) {
    tracing::trace!(frame = %frame, "<- server");
    let forwarded = match Message::from_value(frame) {
        Ok(Message::Response { id, outcome }) => {
            let Some(id) = id.as_u64() else {
                tracing::debug!(id = %id, "Dropping response with non-numeric id");
                return;
            };
            let result = outcome.map_err(|e| LspError::Protocol {
                code: e.code,
                message: e.message,
            });
            match registry.fulfill(id, result) {
                Fulfillment::Delivered => {}
                Fulfillment::Late => tracing::debug!(id, "Dropping late response"),
                Fulfillment::Unknown => tracing::debug!(id, "Dropping response for unknown id"),
            }
            return;
        }
        Ok(Message::Request { id, method, params }) => {
            Inbound::ServerRequest { id, method, params }
        }
        Ok(Message::Notification { method, params }) => Inbound::Notification { method, params },
        Err(reason) => {
            tracing::warn!(%reason, "Undecodable message from server");
            Inbound::DecodeError(reason)
        }
    };
    // The dispatcher going away only happens during teardown.
    let _ = inbound_tx.send(forwarded);
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, duplex, split};

    use super::*;

    struct Harness {
        transport: Transport,
        registry: Arc<RequestRegistry>,
        session: SessionCell,
        inbound_rx: mpsc::UnboundedReceiver<Inbound>,
        server_reader: FrameReader<ReadHalf<DuplexStream>>,
        server_writer: WriteHalf<DuplexStream>,
    }

    fn harness() -> Harness {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_read, client_write) = split(client_io);
        let (server_read, server_write) = split(server_io);
        let registry = RequestRegistry::new();
        let session = SessionCell::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Transport::spawn(
            client_read,
            client_write,
            Arc::clone(&registry),
            session.clone(),
            inbound_tx,
        );
        Harness {
            transport,
            registry,
            session,
            inbound_rx,
            server_reader: FrameReader::new(server_read),
            server_writer: server_write,
        }
    }

    async fn server_send(writer: &mut WriteHalf<DuplexStream>, body: &Value) {
        let body = body.to_string();
        let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());
        writer.write_all(frame.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let Harness {
            transport,
            registry,
            mut server_reader,
            mut server_writer,
            ..
        } = harness();
        let call = tokio::spawn(async move {
            let result = transport.call("textDocument/hover", None, None).await;
            (transport, result)
        });

        let request = server_reader.read_frame().await.unwrap().unwrap();
        assert_eq!(request["method"], "textDocument/hover");
        assert_eq!(request["id"], 1);
        server_send(
            &mut server_writer,
            &json!({"jsonrpc": "2.0", "id": 1, "result": {"contents": "x"}}),
        )
        .await;

        let (_transport, result) = call.await.unwrap();
        assert_eq!(result.unwrap()["contents"], "x");
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_response_becomes_protocol_error() {
        let Harness {
            transport,
            mut server_reader,
            mut server_writer,
            ..
        } = harness();
        let call = tokio::spawn(async move { transport.call("m", None, None).await });
        let _ = server_reader.read_frame().await.unwrap().unwrap();
        server_send(
            &mut server_writer,
            &json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "nope"}}),
        )
        .await;
        assert!(matches!(
            call.await.unwrap(),
            Err(LspError::Protocol { code: -32601, .. })
        ));
    }

    #[tokio::test]
    async fn test_notifications_and_requests_are_forwarded() {
        let mut h = harness();
        server_send(
            &mut h.server_writer,
            &json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"type": 3, "message": "hi"}}),
        )
        .await;
        server_send(
            &mut h.server_writer,
            &json!({"jsonrpc": "2.0", "id": "abc", "method": "workspace/configuration", "params": {"items": []}}),
        )
        .await;
        server_send(&mut h.server_writer, &json!({"jsonrpc": "2.0", "id": 42, "result": null})).await;

        assert!(matches!(
            h.inbound_rx.recv().await.unwrap(),
            Inbound::Notification { ref method, .. } if method == "window/logMessage"
        ));
        assert!(matches!(
            h.inbound_rx.recv().await.unwrap(),
            Inbound::ServerRequest { ref id, .. } if id == "abc"
        ));
        // The unknown-id response is dropped, not forwarded.
        assert!(h.inbound_rx.try_recv().is_err());
        assert_eq!(h.session.get(), SessionState::NotStarted);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_reported_and_loop_continues() {
        let mut h = harness();
        h.server_writer
            .write_all(b"Content-Length: 5\r\n\r\nnope!")
            .await
            .unwrap();
        server_send(&mut h.server_writer, &json!({"jsonrpc": "2.0", "method": "ping"})).await;
        assert!(matches!(
            h.inbound_rx.recv().await.unwrap(),
            Inbound::DecodeError(_)
        ));
        assert!(matches!(
            h.inbound_rx.recv().await.unwrap(),
            Inbound::Notification { .. }
        ));
        assert!(!h.session.get().is_terminal());
    }

    #[tokio::test]
    async fn test_eof_fails_pending_calls() {
        let h = harness();
        let transport = Arc::new(h.transport);
        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.call("m", None, None).await })
        };
        let mut server_reader = h.server_reader;
        let _ = server_reader.read_frame().await.unwrap().unwrap();
        drop(h.server_writer);
        drop(server_reader);

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("pending call settled promptly")
            .unwrap();
        assert!(matches!(result, Err(LspError::SessionClosed(_))));
        h.session.terminated().await;
        assert!(h.registry.is_closed());
        assert!(matches!(
            transport.call("m", None, None).await,
            Err(LspError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let h = harness();
        h.transport.close().await;
        let err = h.transport.notify("exit", None).await.unwrap_err();
        assert!(matches!(err, LspError::Transport(_)));
    }
}
