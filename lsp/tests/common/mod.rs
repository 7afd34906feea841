//! Scripted in-process language server for client tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tether_lsp::codec::{FrameReader, FrameWriter};
use tether_lsp::{Client, ClientOptions};
use tokio::io::{DuplexStream, WriteHalf, duplex, split};
use tokio::sync::mpsc;

/// How the fake server answers one request.
pub enum Reply {
    Ok(Value),
    Err(i64, String),
    /// Answer after a delay, letting later requests overtake this one.
    After(Duration, Value),
    /// Never answer.
    Ignore,
}

pub type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

enum Outgoing {
    Frame(Value),
    HangUp,
}

pub struct FakeServer {
    received: Arc<Mutex<Vec<Value>>>,
    out_tx: mpsc::UnboundedSender<Outgoing>,
}

impl FakeServer {
    /// Every frame the client sent, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn notifications(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|m| m.get("id").is_none() && m["method"] == method)
            .collect()
    }

    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|m| m.get("id").is_some() && m["method"] == method)
            .collect()
    }

    pub fn notify(&self, method: &str, params: Value) {
        let _ = self.out_tx.send(Outgoing::Frame(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })));
    }

    /// Close the server's output stream; the client sees EOF.
    pub fn hang_up(&self) {
        let _ = self.out_tx.send(Outgoing::HangUp);
    }

    /// Poll `received` until `check` holds.
    pub async fn wait_until<F: Fn(&[Value]) -> bool>(&self, check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check(&self.received()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("server saw expected traffic");
    }
}

/// Default answers for the lifecycle requests.
pub fn lifecycle(method: &str) -> Option<Reply> {
    match method {
        "initialize" => Some(Reply::Ok(json!({
            "capabilities": { "textDocumentSync": { "openClose": true, "change": 2 } }
        }))),
        "shutdown" => Some(Reply::Ok(Value::Null)),
        _ => None,
    }
}

/// A workspace directory with source files on disk.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn uri(&self, name: &str) -> String {
        url::Url::from_file_path(self.dir.path().join(name))
            .unwrap()
            .to_string()
    }
}

/// Connect a client to a fake server. Lifecycle requests get default
/// answers; everything else goes to `handler`.
pub fn connect<F>(workspace: &Workspace, handler: F) -> (Client, FakeServer)
where
    F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
{
    let (client_io, server_io) = duplex(1024 * 1024);
    let (client_read, client_write) = split(client_io);
    let (server_read, server_write) = split(server_io);

    let handler: Handler = Arc::new(handler);
    let received = Arc::new(Mutex::new(Vec::new()));
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(server_write, out_rx));

    let reader_received = Arc::clone(&received);
    let reader_out = out_tx.clone();
    tokio::spawn(async move {
        let mut reader = FrameReader::new(server_read);
        while let Ok(Some(frame)) = reader.read_frame().await {
            reader_received.lock().unwrap().push(frame.clone());
            let (Some(id), Some(method)) = (frame.get("id"), frame["method"].as_str()) else {
                continue;
            };
            let params = frame.get("params").cloned().unwrap_or(Value::Null);
            let reply = lifecycle(method).unwrap_or_else(|| handler(method, &params));
            let id = id.clone();
            match reply {
                Reply::Ok(result) => {
                    let _ = reader_out.send(Outgoing::Frame(response(id, result)));
                }
                Reply::Err(code, message) => {
                    let _ = reader_out.send(Outgoing::Frame(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": code, "message": message },
                    })));
                }
                Reply::After(delay, result) => {
                    let out = reader_out.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = out.send(Outgoing::Frame(response(id, result)));
                    });
                }
                Reply::Ignore => {}
            }
        }
    });

    let options = ClientOptions::new("fake", "rust", workspace.root())
        .with_request_timeout(Duration::from_secs(5));
    let client = Client::connect(client_read, client_write, options);
    (client, FakeServer { received, out_tx })
}

/// Connect and complete the handshake.
pub async fn connect_initialized<F>(workspace: &Workspace, handler: F) -> (Client, FakeServer)
where
    F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
{
    let (client, server) = connect(workspace, handler);
    client.initialize().await.unwrap();
    (client, server)
}

fn response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

async fn write_loop(
    writer: WriteHalf<DuplexStream>,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    let mut writer = FrameWriter::new(writer);
    while let Some(outgoing) = out_rx.recv().await {
        match outgoing {
            Outgoing::Frame(frame) => {
                if writer.write_frame(&frame).await.is_err() {
                    return;
                }
            }
            Outgoing::HangUp => {
                let _ = writer.close().await;
                return;
            }
        }
    }
}
