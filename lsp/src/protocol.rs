//! JSON-RPC message model and the hand-written slice of LSP wire types.
//!
//! Results that come in "one of several shapes" are decoded into tagged
//! unions here and normalized into the one-indexed types of [`crate::types`]
//! immediately, so no unresolved union leaves this module.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::LspError;
use crate::types::{
    Diagnostic, DiagnosticSeverity, FileEdits, Hover, Location, Position, Range, RenameEdits,
    Symbol, SymbolKind, TextEdit,
};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC `MethodNotFound`.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

impl From<PathToUriError> for LspError {
    fn from(err: PathToUriError) -> Self {
        LspError::InvalidPath(err.path)
    }
}

/// Error payload of a response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// One unit of protocol communication.
///
/// Ids stay raw JSON: requests we issue carry numbers, but a server may use
/// strings for its own requests and expects them echoed back verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Value,
        outcome: Result<Value, ResponseError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Message {
    #[must_use]
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Self::Request {
            id: Value::from(id),
            method: method.to_string(),
            params,
        }
    }

    #[must_use]
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.to_string(),
            params,
        }
    }

    /// Success reply to a server-initiated request.
    #[must_use]
    pub fn reply(id: Value, result: Value) -> Self {
        Self::Response {
            id,
            outcome: Ok(result),
        }
    }

    /// Error reply to a server-initiated request.
    #[must_use]
    pub fn reply_error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            outcome: Err(ResponseError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Serialize to a JSON-RPC 2.0 object. `params` is omitted, not null,
    /// when absent.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                obj.insert("id".into(), id.clone());
                obj.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                obj.insert("id".into(), id.clone());
                match outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(err) => {
                        let mut error = json!({ "code": err.code, "message": err.message });
                        if let Some(data) = &err.data {
                            error["data"] = data.clone();
                        }
                        obj.insert("error".into(), error);
                    }
                }
            }
        }
        Value::Object(obj)
    }

    /// Classify a decoded frame.
    ///
    /// Requests and notifications need a string `method`; requests and
    /// responses need an `id`; a response needs `result` or `error`.
    pub fn from_value(mut frame: Value) -> Result<Self, String> {
        let Some(obj) = frame.as_object_mut() else {
            return Err("frame is not a JSON object".to_string());
        };
        let id = obj.remove("id");
        let method = match obj.remove("method") {
            Some(Value::String(m)) => Some(m),
            Some(other) => return Err(format!("method is not a string: {other}")),
            None => None,
        };
        let params = obj.remove("params");
        let result = obj.remove("result");
        let error = obj.remove("error");

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => {
                let outcome = match (result, error) {
                    (_, Some(error)) => Err(serde_json::from_value::<ResponseError>(error)
                        .map_err(|e| format!("invalid error object: {e}"))?),
                    (Some(result), None) => Ok(result),
                    (None, None) => return Err("response without result or error".to_string()),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, None) => Err("frame has neither id nor method".to_string()),
        }
    }
}

// ── Coordinates ──────────────────────────────────────────────────────────

/// A zero-indexed protocol position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct WirePosition {
    pub line: u32,
    pub character: u32,
}

impl WirePosition {
    /// Convert a one-indexed caller position; zero is rejected.
    pub fn from_one_indexed(line: u32, column: u32) -> Result<Self, LspError> {
        match (line.checked_sub(1), column.checked_sub(1)) {
            (Some(line), Some(character)) => Ok(Self { line, character }),
            _ => Err(LspError::InvalidPosition { line, column }),
        }
    }

    #[must_use]
    pub fn to_position(self) -> Position {
        Position::new(
            self.line.saturating_add(1),
            self.character.saturating_add(1),
        )
    }

    #[must_use]
    pub fn to_value(self) -> Value {
        json!({ "line": self.line, "character": self.character })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WireRange {
    pub start: WirePosition,
    pub end: WirePosition,
}

impl WireRange {
    #[must_use]
    pub fn to_range(self) -> Range {
        Range::new(self.start.to_position(), self.end.to_position())
    }

    #[must_use]
    pub fn to_value(self) -> Value {
        json!({ "start": self.start.to_value(), "end": self.end.to_value() })
    }
}

// ── Request parameters ───────────────────────────────────────────────────

pub(crate) fn initialize_params(
    root_uri: &str,
    initialization_options: Option<&Value>,
) -> Value {
    let mut params = json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": "tether",
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "capabilities": {
            "general": {
                "positionEncodings": ["utf-16"]
            },
            "workspace": {
                "configuration": true,
                "workspaceFolders": true,
                "applyEdit": false,
                "symbol": { "dynamicRegistration": false }
            },
            "window": {
                "workDoneProgress": true,
                "showMessage": {}
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "definition": { "dynamicRegistration": false, "linkSupport": true },
                "typeDefinition": { "dynamicRegistration": false, "linkSupport": true },
                "implementation": { "dynamicRegistration": false, "linkSupport": true },
                "references": { "dynamicRegistration": false },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["markdown", "plaintext"]
                },
                "rename": { "dynamicRegistration": false, "prepareSupport": false },
                "documentSymbol": {
                    "dynamicRegistration": false,
                    "hierarchicalDocumentSymbolSupport": true
                },
                "diagnostic": { "dynamicRegistration": false, "relatedDocumentSupport": false },
                "publishDiagnostics": {
                    "relatedInformation": false,
                    "versionSupport": true
                }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_full_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_change_range_params(
    uri: &str,
    version: i32,
    range: WireRange,
    text: &str,
) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "range": range.to_value(),
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn text_document_position_params(uri: &str, position: WirePosition) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": position.to_value()
    })
}

pub(crate) fn reference_params(
    uri: &str,
    position: WirePosition,
    include_declaration: bool,
) -> Value {
    let mut params = text_document_position_params(uri, position);
    params["context"] = json!({ "includeDeclaration": include_declaration });
    params
}

pub(crate) fn rename_params(uri: &str, position: WirePosition, new_name: &str) -> Value {
    let mut params = text_document_position_params(uri, position);
    params["newName"] = Value::from(new_name);
    params
}

pub(crate) fn text_document_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn workspace_symbol_params(query: &str) -> Value {
    json!({ "query": query })
}

// ── Capabilities ─────────────────────────────────────────────────────────

/// How the server wants document changes delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Full,
    Incremental,
}

/// Read `capabilities.textDocumentSync` from an `initialize` result.
///
/// The capability is either a bare `TextDocumentSyncKind` number or an
/// options object with a `change` field. Anything other than `2`
/// (incremental) is treated as full sync.
pub(crate) fn sync_mode_from_initialize(result: &Value) -> SyncMode {
    let sync = &result["capabilities"]["textDocumentSync"];
    let kind = sync.as_u64().or_else(|| sync["change"].as_u64());
    match kind {
        Some(2) => SyncMode::Incremental,
        _ => SyncMode::Full,
    }
}

// ── Locations ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireLocation {
    uri: String,
    range: WireRange,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLocationLink {
    target_uri: String,
    target_range: WireRange,
    #[serde(default)]
    target_selection_range: Option<WireRange>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GotoResponse {
    Scalar(WireLocation),
    Array(Vec<WireLocation>),
    Links(Vec<WireLocationLink>),
}

/// Normalize `Location | Location[] | LocationLink[] | null` into one
/// sorted, de-duplicated location sequence.
pub(crate) fn normalize_locations(value: Value) -> Result<Vec<Location>, String> {
    let response: Option<GotoResponse> =
        serde_json::from_value(value).map_err(|e| e.to_string())?;

    let mut locations: Vec<Location> = match response {
        None => Vec::new(),
        Some(GotoResponse::Scalar(loc)) => vec![loc.into_location()],
        Some(GotoResponse::Array(locs)) => {
            locs.into_iter().map(WireLocation::into_location).collect()
        }
        Some(GotoResponse::Links(links)) => links
            .into_iter()
            .map(|link| Location {
                uri: link.target_uri,
                range: link
                    .target_selection_range
                    .unwrap_or(link.target_range)
                    .to_range(),
            })
            .collect(),
    };
    locations.sort();
    locations.dedup();
    Ok(locations)
}

impl WireLocation {
    fn into_location(self) -> Location {
        Location {
            uri: self.uri,
            range: self.range.to_range(),
        }
    }
}

// ── Hover ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireHover {
    contents: HoverContents,
    #[serde(default)]
    range: Option<WireRange>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HoverContents {
    Markup { kind: String, value: String },
    Single(MarkedString),
    Many(Vec<MarkedString>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MarkedString {
    Plain(String),
    Code { language: String, value: String },
}

impl MarkedString {
    fn render(self) -> String {
        match self {
            Self::Plain(text) => text,
            Self::Code { language, value } => format!("```{language}\n{value}\n```"),
        }
    }
}

/// Normalize a hover result. `null` and blank contents both mean "nothing".
pub(crate) fn normalize_hover(value: Value) -> Result<Option<Hover>, String> {
    let hover: Option<WireHover> = serde_json::from_value(value).map_err(|e| e.to_string())?;
    let Some(hover) = hover else {
        return Ok(None);
    };

    let contents = match hover.contents {
        HoverContents::Markup { kind, value } => {
            tracing::trace!(kind = %kind, "hover markup");
            value
        }
        HoverContents::Single(marked) => marked.render(),
        HoverContents::Many(parts) => parts
            .into_iter()
            .map(MarkedString::render)
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(Hover {
        contents,
        range: hover.range.map(WireRange::to_range),
    }))
}

// ── Rename / workspace edits ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTextEdit {
    range: WireRange,
    new_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTextDocumentEdit {
    text_document: WireDocumentId,
    edits: Vec<WireTextEdit>,
}

#[derive(Debug, Deserialize)]
struct WireDocumentId {
    uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DocumentChange {
    Edit(WireTextDocumentEdit),
    /// `CreateFile`, `RenameFile` or `DeleteFile`.
    Resource(Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireWorkspaceEdit {
    #[serde(default)]
    changes: Option<BTreeMap<String, Vec<WireTextEdit>>>,
    #[serde(default)]
    document_changes: Option<Vec<DocumentChange>>,
}

/// Normalize a `WorkspaceEdit` into per-file ordered edit lists.
///
/// `documentChanges` wins over `changes` when both are present. Edits are
/// sorted into source order per file; overlapping edits are rejected.
pub(crate) fn normalize_workspace_edit(value: Value) -> Result<RenameEdits, String> {
    let edit: Option<WireWorkspaceEdit> =
        serde_json::from_value(value).map_err(|e| e.to_string())?;
    let Some(edit) = edit else {
        return Ok(RenameEdits::default());
    };

    let mut by_uri: BTreeMap<String, Vec<WireTextEdit>> = BTreeMap::new();
    if let Some(document_changes) = edit.document_changes {
        for change in document_changes {
            match change {
                DocumentChange::Edit(doc_edit) => by_uri
                    .entry(doc_edit.text_document.uri)
                    .or_default()
                    .extend(doc_edit.edits),
                DocumentChange::Resource(op) => {
                    tracing::warn!(
                        kind = %op["kind"].as_str().unwrap_or("unknown"),
                        "Skipping resource operation in workspace edit"
                    );
                }
            }
        }
    } else if let Some(changes) = edit.changes {
        for (uri, edits) in changes {
            by_uri.entry(uri).or_default().extend(edits);
        }
    }

    let mut files = Vec::with_capacity(by_uri.len());
    for (uri, mut edits) in by_uri {
        if edits.is_empty() {
            continue;
        }
        // Stable: insertions at the same point keep the server's order.
        edits.sort_by_key(|e| (e.range.start, e.range.end));
        let edits: Vec<TextEdit> = edits
            .into_iter()
            .map(|e| TextEdit {
                range: e.range.to_range(),
                new_text: e.new_text,
            })
            .collect();
        if let Some(pair) = edits
            .windows(2)
            .find(|pair| pair[0].range.overlaps(&pair[1].range))
        {
            return Err(format!(
                "overlapping edits in {uri} at {}:{} and {}:{}",
                pair[0].range.start.line,
                pair[0].range.start.column,
                pair[1].range.start.line,
                pair[1].range.start.column,
            ));
        }
        files.push(FileEdits { uri, edits });
    }
    Ok(RenameEdits { files })
}

// ── Symbols ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDocumentSymbol {
    name: String,
    #[serde(default)]
    detail: Option<String>,
    kind: u64,
    range: WireRange,
    selection_range: WireRange,
    #[serde(default)]
    children: Vec<WireDocumentSymbol>,
}

#[derive(Debug, Deserialize)]
struct WireSymbolLocation {
    uri: String,
    /// Absent for `WorkspaceSymbol` results that defer range resolution.
    #[serde(default)]
    range: Option<WireRange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSymbolInformation {
    name: String,
    kind: u64,
    location: WireSymbolLocation,
    #[serde(default)]
    container_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SymbolResponse {
    Nested(Vec<WireDocumentSymbol>),
    Flat(Vec<WireSymbolInformation>),
}

impl WireDocumentSymbol {
    fn into_symbol(self) -> Symbol {
        Symbol {
            name: self.name,
            kind: SymbolKind::from_lsp(self.kind),
            detail: self.detail,
            uri: None,
            range: self.range.to_range(),
            selection_range: self.selection_range.to_range(),
            container: None,
            children: self
                .children
                .into_iter()
                .map(WireDocumentSymbol::into_symbol)
                .collect(),
        }
    }
}

impl WireSymbolInformation {
    fn into_symbol(self) -> Symbol {
        let range = self.location.range.map_or(
            Range::new(Position::new(1, 1), Position::new(1, 1)),
            WireRange::to_range,
        );
        Symbol {
            name: self.name,
            kind: SymbolKind::from_lsp(self.kind),
            detail: None,
            uri: Some(self.location.uri),
            range,
            selection_range: range,
            container: self.container_name,
            children: Vec::new(),
        }
    }
}

/// Normalize `DocumentSymbol[] | SymbolInformation[] | WorkspaceSymbol[] | null`.
pub(crate) fn normalize_symbols(value: Value) -> Result<Vec<Symbol>, String> {
    let response: Option<SymbolResponse> =
        serde_json::from_value(value).map_err(|e| e.to_string())?;
    Ok(match response {
        None => Vec::new(),
        Some(SymbolResponse::Nested(symbols)) => symbols
            .into_iter()
            .map(WireDocumentSymbol::into_symbol)
            .collect(),
        Some(SymbolResponse::Flat(symbols)) => symbols
            .into_iter()
            .map(WireSymbolInformation::into_symbol)
            .collect(),
    })
}

// ── Diagnostics ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub version: Option<i32>,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: WireRange,
    #[serde(default)]
    pub severity: Option<u64>,
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    pub message: String,
}

impl LspDiagnostic {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match &self.code {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.range.to_range(),
            self.message.clone(),
            code,
            self.source
                .clone()
                .unwrap_or_else(|| String::from("unknown")),
        )
    }
}

/// Result of a `textDocument/diagnostic` pull.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum DocumentDiagnosticReport {
    Full { items: Vec<LspDiagnostic> },
    Unchanged {},
}

// ── Paths ────────────────────────────────────────────────────────────────

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
