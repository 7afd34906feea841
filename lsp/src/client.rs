//! The session object: lifecycle plus one typed method per operation.
//!
//! A `Client` is one server session. It is `Send + Sync`; share it behind an
//! `Arc` to issue operations from many tasks at once. Nothing here is global:
//! dropping the client tears the session down and kills its process.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::diagnostics::DiagnosticsCache;
use crate::dispatcher::{DispatchStats, Dispatcher, HandlerRegistry, NotificationHandler};
use crate::documents::DocumentStore;
use crate::error::LspError;
use crate::protocol::{self, DocumentDiagnosticReport, WirePosition};
use crate::registry::RequestRegistry;
use crate::session::{SessionCell, SessionState};
use crate::supervisor::{ServerProcess, Spawned};
use crate::transport::Transport;
use crate::types::{
    Diagnostic, DiagnosticSet, DiagnosticStamp, Hover, Location, RenameEdits, Symbol,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(60);

const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Session parameters that do not depend on how the byte streams were obtained.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server name used in logs (e.g. "rust").
    pub name: String,
    pub language_id: String,
    /// Absolute workspace root; relative paths given to operations resolve
    /// against it.
    pub root: PathBuf,
    pub initialization_options: Option<Value>,
    pub request_timeout: Duration,
    pub init_timeout: Duration,
}

impl ClientOptions {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        language_id: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            language_id: language_id.into(),
            root: root.into(),
            initialization_options: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Options for `config`. The root defaults to the current directory.
    pub fn from_config(name: &str, config: &ServerConfig) -> Result<Self, LspError> {
        let root = match &config.workspace_root {
            Some(root) => std::path::absolute(root)?,
            None => std::env::current_dir()?,
        };
        Ok(Self {
            name: name.to_string(),
            language_id: config.language_id.clone(),
            root,
            initialization_options: config.initialization_options.clone(),
            request_timeout: config.request_timeout(),
            init_timeout: config.init_timeout(),
        })
    }
}

pub struct Client {
    options: ClientOptions,
    /// Present when the session was spawned from a command; used by `restart`.
    config: Option<ServerConfig>,
    session: SessionCell,
    registry: Arc<RequestRegistry>,
    transport: Transport,
    documents: DocumentStore,
    diagnostics: Arc<DiagnosticsCache>,
    handlers: Arc<HandlerRegistry>,
    stats: Arc<DispatchStats>,
    process: Option<ServerProcess>,
    capabilities: OnceLock<Value>,
}

impl Client {
    /// Attach to an already-connected byte stream pair.
    ///
    /// The session starts in `Starting`; call [`initialize`](Self::initialize)
    /// before issuing operations. Must be called inside a Tokio runtime.
    pub fn connect<R, W>(reader: R, writer: W, options: ClientOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let registry = RequestRegistry::new();
        let session = SessionCell::new();
        Self::from_parts(reader, writer, options, None, None, registry, session)
    }

    /// Spawn the server described by `config` and attach to it.
    pub fn spawn(name: &str, config: &ServerConfig) -> Result<Self, LspError> {
        let options = ClientOptions::from_config(name, config)?;
        let registry = RequestRegistry::new();
        let session = SessionCell::new();
        let mut config = config.clone();
        config.workspace_root = Some(options.root.clone());
        let Spawned {
            process,
            stdin,
            stdout,
        } = ServerProcess::spawn(name, &config, Arc::clone(&registry), session.clone())?;
        Ok(Self::from_parts(
            stdout,
            stdin,
            options,
            Some(config),
            Some(process),
            registry,
            session,
        ))
    }

    /// Spawn and initialize.
    pub async fn start(name: &str, config: &ServerConfig) -> Result<Self, LspError> {
        let client = Self::spawn(name, config)?;
        client.initialize().await?;
        Ok(client)
    }

    fn from_parts<R, W>(
        reader: R,
        writer: W,
        options: ClientOptions,
        config: Option<ServerConfig>,
        process: Option<ServerProcess>,
        registry: Arc<RequestRegistry>,
        session: SessionCell,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Transport::spawn(
            reader,
            writer,
            Arc::clone(&registry),
            session.clone(),
            inbound_tx,
        );

        let diagnostics = Arc::new(DiagnosticsCache::new());
        let handlers = Arc::new(HandlerRegistry::default());
        let stats = Arc::new(DispatchStats::default());
        let root_uri = protocol::path_to_file_uri(&options.root)
            .ok()
            .map(|u| u.to_string());
        Dispatcher {
            server: options.name.clone(),
            root_uri,
            cache: Arc::clone(&diagnostics),
            outbox: transport.outbox(),
            handlers: Arc::clone(&handlers),
            stats: Arc::clone(&stats),
        }
        .spawn(inbound_rx);

        session.transition(SessionState::NotStarted, SessionState::Starting);

        Self {
            options,
            config,
            session,
            registry,
            transport,
            documents: DocumentStore::new(),
            diagnostics,
            handlers,
            stats,
            process,
            capabilities: OnceLock::new(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Perform the `initialize` / `initialized` handshake.
    ///
    /// A failed handshake ends the session.
    pub async fn initialize(&self) -> Result<(), LspError> {
        match self.session.get() {
            SessionState::Starting => {}
            SessionState::Initialized => return Ok(()),
            SessionState::Terminated => {
                return Err(LspError::SessionClosed("session terminated".to_string()));
            }
            state => return Err(LspError::NotReady(state)),
        }

        let root_uri = protocol::path_to_file_uri(&self.options.root)?;
        let params = protocol::initialize_params(
            root_uri.as_str(),
            self.options.initialization_options.as_ref(),
        );
        let result = match self
            .transport
            .call("initialize", Some(params), Some(self.options.init_timeout))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.abort(&format!("initialize failed: {e}")).await;
                return Err(e);
            }
        };

        let mode = protocol::sync_mode_from_initialize(&result);
        self.documents.set_sync_mode(mode);
        let _ = self
            .capabilities
            .set(result.get("capabilities").cloned().unwrap_or(Value::Null));

        if let Err(e) = self.transport.notify("initialized", Some(json!({}))).await {
            self.abort(&format!("initialized notification failed: {e}"))
                .await;
            return Err(e);
        }
        if !self
            .session
            .transition(SessionState::Starting, SessionState::Initialized)
        {
            return Err(LspError::SessionClosed(
                "session ended during initialize".to_string(),
            ));
        }
        tracing::info!(server = %self.options.name, sync = ?mode, "Language server initialized");
        Ok(())
    }

    /// Shut the session down. Idempotent and tolerant of a dead server.
    pub async fn shutdown(&self) {
        let state = match self.session.get() {
            state if state.is_terminal() => return,
            SessionState::ShuttingDown => {
                self.session.terminated().await;
                return;
            }
            state => state,
        };
        if !self.session.transition(state, SessionState::ShuttingDown) {
            // Someone else is already tearing the session down.
            self.session.terminated().await;
            return;
        }

        if matches!(state, SessionState::Starting | SessionState::Initialized) {
            if let Err(e) = self
                .transport
                .call("shutdown", None, Some(SHUTDOWN_REQUEST_TIMEOUT))
                .await
            {
                tracing::debug!(server = %self.options.name, "shutdown request failed: {e}");
            }
            let _ = self.transport.notify("exit", None).await;
        }
        self.transport.close().await;

        if let Some(process) = &self.process {
            process.terminate(PROCESS_EXIT_GRACE).await;
        }
        self.registry.close_all("session shut down");
        self.session.terminate();
        tracing::info!(server = %self.options.name, "Language server shut down");
    }

    /// End the session after a handshake failure.
    async fn abort(&self, reason: &str) {
        tracing::warn!(server = %self.options.name, reason, "Aborting session");
        self.transport.close().await;
        if let Some(process) = &self.process {
            process.kill();
        }
        self.registry.close_all(reason);
        self.session.terminate();
    }

    /// Shut this session down and start a fresh one from the same command,
    /// re-opening `reopen` in the new session.
    pub async fn restart(&self, reopen: &[PathBuf]) -> Result<Client, LspError> {
        let Some(config) = &self.config else {
            return Err(LspError::Spawn {
                command: self.options.name.clone(),
                reason: "session was not started from a server command".to_string(),
            });
        };
        self.shutdown().await;
        let client = Client::start(&self.options.name, config).await?;
        for path in reopen {
            client.open_file(path).await?;
        }
        tracing::info!(server = %self.options.name, reopened = reopen.len(), "Language server restarted");
        Ok(client)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.get()
    }

    /// Whether the session can still serve requests.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.session.get().is_terminal()
            && !self.registry.is_closed()
            && self.process.as_ref().is_none_or(ServerProcess::is_running)
    }

    /// Resolve once the session has terminated, for whatever reason.
    pub async fn closed(&self) {
        self.session.terminated().await;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.options.name
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.options.root
    }

    /// Server capabilities from the `initialize` result.
    #[must_use]
    pub fn server_capabilities(&self) -> Option<&Value> {
        self.capabilities.get()
    }

    /// Recent stderr output of the server process.
    #[must_use]
    pub fn stderr_tail(&self) -> Vec<String> {
        self.process
            .as_ref()
            .map(ServerProcess::stderr_tail)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn process(&self) -> Option<&ServerProcess> {
        self.process.as_ref()
    }

    /// Run `handler` for every notification with `method`, after the
    /// built-in handling.
    pub fn on_notification(&self, method: impl Into<String>, handler: NotificationHandler) {
        self.handlers.register(method, handler);
    }

    /// Calls still waiting for a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.registry.pending_count()
    }

    #[must_use]
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Pin `path` open with its current disk content.
    pub async fn open_file(&self, path: &Path) -> Result<(), LspError> {
        self.ensure_ready()?;
        self.sync_open(path).await.map(drop)
    }

    /// Close `path`. Returns `false` if it was not open.
    pub async fn close_file(&self, path: &Path) -> Result<bool, LspError> {
        self.ensure_ready()?;
        let uri = self.uri_for(path)?;
        let closed = self.documents.close(&self.transport, &uri).await?;
        if closed {
            self.diagnostics.forget_version(&uri);
        }
        Ok(closed)
    }

    /// Re-read `path` from disk and send the change. Returns the new
    /// version, or `None` if the content is unchanged.
    pub async fn file_changed(&self, path: &Path) -> Result<Option<i32>, LspError> {
        self.ensure_ready()?;
        let path = self.resolve(path);
        let uri = self.uri_for(&path)?;
        let text = tokio::fs::read_to_string(&path).await?;
        self.documents
            .notify_change(&self.transport, &uri, &self.options.language_id, &text)
            .await
    }

    /// URIs of every open document.
    pub async fn open_documents(&self) -> Vec<String> {
        self.documents.open_uris().await
    }

    /// Version the server holds for `path`, if it is open.
    pub async fn document_version(&self, path: &Path) -> Result<Option<i32>, LspError> {
        let uri = self.uri_for(path)?;
        Ok(self.documents.version(&uri).await)
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    /// The latest pushed diagnostics for `path`. No I/O.
    pub fn diagnostics(&self, path: &Path) -> Result<DiagnosticSet, LspError> {
        Ok(self.diagnostics.snapshot(&self.uri_for(path)?))
    }

    /// Every file with pushed diagnostics, files with errors first.
    #[must_use]
    pub fn all_diagnostics(&self) -> Vec<DiagnosticSet> {
        self.diagnostics.all()
    }

    /// Error-level diagnostics for `paths`, skipping clean files.
    pub fn errors_for(&self, paths: &[PathBuf]) -> Result<Vec<(PathBuf, Vec<Diagnostic>)>, LspError> {
        let uris = paths
            .iter()
            .map(|p| self.uri_for(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self
            .diagnostics
            .errors_for(&uris)
            .into_iter()
            .map(|(uri, errors)| {
                let path = protocol::file_uri_to_path(&uri).unwrap_or_else(|| PathBuf::from(&uri));
                (path, errors)
            })
            .collect())
    }

    /// Open `path` if needed and wait up to `timeout` for the server to
    /// publish diagnostics for it.
    ///
    /// Returns whatever is cached when the wait ends; servers may stay
    /// silent about clean files, so an empty set is not an error.
    pub async fn wait_for_diagnostics(
        &self,
        path: &Path,
        timeout: Duration,
    ) -> Result<DiagnosticSet, LspError> {
        self.ensure_ready()?;
        let uri = self.uri_for(path)?;
        let before = self.diagnostics.sequence_for(&uri);
        let (_, opened) = self.sync_open(path).await?;
        // An already-open file may have been published for long ago.
        let after = if opened { before } else { 0 };
        Ok(self
            .diagnostics
            .wait_for(&uri, after, timeout)
            .await
            .unwrap_or_else(|| self.diagnostics.snapshot(&uri)))
    }

    // ── Typed operations ─────────────────────────────────────────────────

    pub async fn definition(
        &self,
        path: &Path,
        line: u32,
        column: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<Location>, LspError> {
        self.locations("textDocument/definition", path, line, column, timeout)
            .await
    }

    pub async fn type_definition(
        &self,
        path: &Path,
        line: u32,
        column: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<Location>, LspError> {
        self.locations("textDocument/typeDefinition", path, line, column, timeout)
            .await
    }

    pub async fn implementation(
        &self,
        path: &Path,
        line: u32,
        column: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<Location>, LspError> {
        self.locations("textDocument/implementation", path, line, column, timeout)
            .await
    }

    /// All references to the symbol at `line:column`. No references is
    /// `Ok(vec![])`.
    pub async fn references(
        &self,
        path: &Path,
        line: u32,
        column: u32,
        include_declaration: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<Location>, LspError> {
        const METHOD: &str = "textDocument/references";
        let result = self
            .position_request(METHOD, path, line, column, timeout, |uri, pos| {
                protocol::reference_params(uri, pos, include_declaration)
            })
            .await?;
        protocol::normalize_locations(result).map_err(|reason| invalid(METHOD, reason))
    }

    pub async fn hover(
        &self,
        path: &Path,
        line: u32,
        column: u32,
        timeout: Option<Duration>,
    ) -> Result<Option<Hover>, LspError> {
        const METHOD: &str = "textDocument/hover";
        let result = self
            .position_request(
                METHOD,
                path,
                line,
                column,
                timeout,
                protocol::text_document_position_params,
            )
            .await?;
        protocol::normalize_hover(result).map_err(|reason| invalid(METHOD, reason))
    }

    /// Compute the edits for renaming the symbol at `line:column`.
    ///
    /// The edits are returned, not applied.
    pub async fn rename(
        &self,
        path: &Path,
        line: u32,
        column: u32,
        new_name: &str,
        timeout: Option<Duration>,
    ) -> Result<RenameEdits, LspError> {
        const METHOD: &str = "textDocument/rename";
        let result = self
            .position_request(METHOD, path, line, column, timeout, |uri, pos| {
                protocol::rename_params(uri, pos, new_name)
            })
            .await?;
        protocol::normalize_workspace_edit(result).map_err(|reason| invalid(METHOD, reason))
    }

    pub async fn document_symbols(
        &self,
        path: &Path,
        timeout: Option<Duration>,
    ) -> Result<Vec<Symbol>, LspError> {
        const METHOD: &str = "textDocument/documentSymbol";
        self.ensure_ready()?;
        let (uri, _) = self.sync_open(path).await?;
        let result = self
            .request(METHOD, protocol::text_document_params(&uri), timeout)
            .await?;
        protocol::normalize_symbols(result).map_err(|reason| invalid(METHOD, reason))
    }

    /// Symbols matching `query` across the workspace.
    pub async fn workspace_symbols(
        &self,
        query: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Symbol>, LspError> {
        const METHOD: &str = "workspace/symbol";
        self.ensure_ready()?;
        let result = self
            .request(METHOD, protocol::workspace_symbol_params(query), timeout)
            .await?;
        protocol::normalize_symbols(result).map_err(|reason| invalid(METHOD, reason))
    }

    /// Ask the server for diagnostics (`textDocument/diagnostic`).
    ///
    /// An `unchanged` report yields the cached set.
    pub async fn pull_diagnostics(
        &self,
        path: &Path,
        timeout: Option<Duration>,
    ) -> Result<DiagnosticSet, LspError> {
        const METHOD: &str = "textDocument/diagnostic";
        self.ensure_ready()?;
        let (uri, _) = self.sync_open(path).await?;
        let result = self
            .request(METHOD, protocol::text_document_params(&uri), timeout)
            .await?;
        let report: DocumentDiagnosticReport =
            serde_json::from_value(result).map_err(|e| invalid(METHOD, e.to_string()))?;
        match report {
            DocumentDiagnosticReport::Full { items } => {
                let stamp = DiagnosticStamp {
                    version: self.documents.version(&uri).await,
                    sequence: self.diagnostics.sequence_for(&uri),
                };
                let diagnostics = items.iter().map(protocol::LspDiagnostic::to_diagnostic).collect();
                Ok(DiagnosticSet::new(uri, diagnostics, stamp))
            }
            DocumentDiagnosticReport::Unchanged {} => Ok(self.diagnostics.snapshot(&uri)),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn locations(
        &self,
        method: &'static str,
        path: &Path,
        line: u32,
        column: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<Location>, LspError> {
        let result = self
            .position_request(
                method,
                path,
                line,
                column,
                timeout,
                protocol::text_document_position_params,
            )
            .await?;
        protocol::normalize_locations(result).map_err(|reason| invalid(method, reason))
    }

    /// Validate, check readiness, sync the document, then send a
    /// position-based request built by `build`.
    async fn position_request<F>(
        &self,
        method: &'static str,
        path: &Path,
        line: u32,
        column: u32,
        timeout: Option<Duration>,
        build: F,
    ) -> Result<Value, LspError>
    where
        F: FnOnce(&str, WirePosition) -> Value,
    {
        let position = WirePosition::from_one_indexed(line, column)?;
        self.ensure_ready()?;
        let (uri, _) = self.sync_open(path).await?;
        self.request(method, build(&uri, position), timeout).await
    }

    async fn request(
        &self,
        method: &'static str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, LspError> {
        let timeout = timeout.unwrap_or(self.options.request_timeout);
        self.transport.call(method, Some(params), Some(timeout)).await
    }

    fn ensure_ready(&self) -> Result<(), LspError> {
        match self.session.get() {
            SessionState::Initialized => Ok(()),
            state @ (SessionState::ShuttingDown | SessionState::Terminated) => Err(
                LspError::SessionClosed(format!("session is {state}")),
            ),
            state => Err(LspError::NotReady(state)),
        }
    }

    /// Make sure `path` is open. Returns its URI and whether this call
    /// opened it.
    async fn sync_open(&self, path: &Path) -> Result<(String, bool), LspError> {
        let path = self.resolve(path);
        let uri = self.uri_for(&path)?;
        if self.documents.is_open(&uri).await {
            return Ok((uri, false));
        }
        let text = tokio::fs::read_to_string(&path).await?;
        let opened = self
            .documents
            .ensure_open(&self.transport, &uri, &self.options.language_id, &text)
            .await?;
        Ok((uri, opened))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.options.root.join(path)
        }
    }

    fn uri_for(&self, path: &Path) -> Result<String, LspError> {
        Ok(protocol::path_to_file_uri(&self.resolve(path))?.to_string())
    }
}

fn invalid(method: &'static str, reason: String) -> LspError {
    LspError::InvalidResponse { method, reason }
}
