//! Public types returned to callers.
//!
//! These types define the interface between `tether-lsp` and the tool layer.
//! Every coordinate in here is **one-indexed**; conversion to and from the
//! protocol's zero-indexed coordinates happens at the decode boundary in
//! `protocol.rs`, so callers never see a raw protocol shape.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::protocol;

/// A one-indexed line/column pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A one-indexed, end-exclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Whether two ranges share at least one character. Touching ranges
    /// (`a.end == b.start`) and zero-width insertions do not overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A location in a file, normalized from every result shape the server may use.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

impl Location {
    /// Filesystem path for `file://` URIs.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        protocol::file_uri_to_path(&self.uri)
    }
}

/// A single text replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

/// Ordered, non-overlapping edits for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEdits {
    pub uri: String,
    pub edits: Vec<TextEdit>,
}

impl FileEdits {
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        protocol::file_uri_to_path(&self.uri)
    }
}

/// The edit set produced by a rename, one entry per file, sorted by URI.
///
/// Applying the edits is the caller's job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenameEdits {
    pub files: Vec<FileEdits>,
}

impl RenameEdits {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn edit_count(&self) -> usize {
        self.files.iter().map(|f| f.edits.len()).sum()
    }
}

/// Hover text, flattened to a single markdown/plaintext string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hover {
    pub contents: String,
    pub range: Option<Range>,
}

/// Symbol kinds (LSP `SymbolKind`, 1..=26).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    File,
    Module,
    Namespace,
    Package,
    Class,
    Method,
    Property,
    Field,
    Constructor,
    Enum,
    Interface,
    Function,
    Variable,
    Constant,
    String,
    Number,
    Boolean,
    Array,
    Object,
    Key,
    Null,
    EnumMember,
    Struct,
    Event,
    Operator,
    TypeParameter,
    Unknown,
}

impl SymbolKind {
    const TABLE: [SymbolKind; 26] = [
        Self::File,
        Self::Module,
        Self::Namespace,
        Self::Package,
        Self::Class,
        Self::Method,
        Self::Property,
        Self::Field,
        Self::Constructor,
        Self::Enum,
        Self::Interface,
        Self::Function,
        Self::Variable,
        Self::Constant,
        Self::String,
        Self::Number,
        Self::Boolean,
        Self::Array,
        Self::Object,
        Self::Key,
        Self::Null,
        Self::EnumMember,
        Self::Struct,
        Self::Event,
        Self::Operator,
        Self::TypeParameter,
    ];

    /// Convert from the LSP numeric kind; out-of-range values map to `Unknown`.
    #[must_use]
    pub fn from_lsp(value: u64) -> Self {
        usize::try_from(value)
            .ok()
            .and_then(|v| v.checked_sub(1))
            .and_then(|idx| Self::TABLE.get(idx).copied())
            .unwrap_or(Self::Unknown)
    }
}

/// A document or workspace symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Set for flat (`SymbolInformation`) results, which carry their own URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub range: Range,
    pub selection_range: Range,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Symbol>,
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic from a language server.
///
/// Fields are private; construction goes through [`Diagnostic::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    range: Range,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    /// Resolved to a concrete string at the boundary ("unknown" if absent).
    source: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        range: Range,
        message: String,
        code: Option<String>,
        source: String,
    ) -> Self {
        Self {
            severity,
            range,
            message,
            code,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `path:line:col: severity: [source] message`.
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.range.start.line,
            self.range.start.column,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Ordering stamp for a diagnostic push.
///
/// `version` is the document version the server computed the diagnostics
/// for (when it says so); `sequence` is the arrival order assigned by the
/// dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticStamp {
    pub version: Option<i32>,
    pub sequence: u64,
}

impl DiagnosticStamp {
    /// Whether `self` describes an older state than `other`.
    ///
    /// Document versions decide when both sides carry one and they differ;
    /// otherwise arrival order decides.
    #[must_use]
    pub fn is_older_than(&self, other: &DiagnosticStamp) -> bool {
        match (self.version, other.version) {
            (Some(a), Some(b)) if a != b => a < b,
            _ => self.sequence < other.sequence,
        }
    }
}

/// The latest diagnostics for one URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticSet {
    uri: String,
    diagnostics: Vec<Diagnostic>,
    stamp: DiagnosticStamp,
}

impl DiagnosticSet {
    #[must_use]
    pub fn new(uri: String, diagnostics: Vec<Diagnostic>, stamp: DiagnosticStamp) -> Self {
        Self {
            uri,
            diagnostics,
            stamp,
        }
    }

    /// An empty set for a URI nothing has been reported for.
    #[must_use]
    pub fn empty(uri: String) -> Self {
        Self {
            uri,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    #[must_use]
    pub fn stamp(&self) -> DiagnosticStamp {
        self.stamp
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    /// Only the error-level entries.
    #[must_use]
    pub fn errors(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity().is_error())
            .cloned()
            .collect()
    }

    /// Format a compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
