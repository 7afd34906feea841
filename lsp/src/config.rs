//! Server configuration.
//!
//! The core treats the command description opaquely: it is deserialized from
//! the user's config file by `tether-config` and handed to
//! [`Client::start`](crate::Client::start).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_INIT_TIMEOUT_SECS: u64 = 60;

/// Configuration for the LSP client subsystem.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LspConfig {
    /// Per-language server configurations, keyed by name (e.g. "rust").
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Configuration for a single language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer"), resolved through `PATH`.
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child process. Defaults to the workspace root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// LSP language identifier (e.g. "rust", "python").
    pub language_id: String,
    /// File extensions this server handles (e.g. `["rs"]`).
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Files that indicate a workspace root (e.g. `["Cargo.toml"]`).
    #[serde(default)]
    pub root_markers: Vec<String>,
    /// Workspace root sent in `initialize`. Defaults to the current directory.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Passed verbatim as `initializationOptions`.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

const fn default_init_timeout_secs() -> u64 {
    DEFAULT_INIT_TIMEOUT_SECS
}

impl ServerConfig {
    /// Minimal config for `command` serving `language_id`.
    #[must_use]
    pub fn new(command: impl Into<String>, language_id: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            language_id: language_id.into(),
            file_extensions: Vec::new(),
            root_markers: Vec::new(),
            workspace_root: None,
            initialization_options: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            init_timeout_secs: DEFAULT_INIT_TIMEOUT_SECS,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    /// Whether this server handles `path`, judged by its extension.
    #[must_use]
    pub fn handles(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.file_extensions.iter().any(|e| e == ext))
    }

    /// Walk up from `start` to the nearest directory containing a root marker.
    #[must_use]
    pub fn find_root(&self, start: &Path) -> Option<PathBuf> {
        let mut dir = if start.is_dir() {
            Some(start)
        } else {
            start.parent()
        };
        while let Some(candidate) = dir {
            if self
                .root_markers
                .iter()
                .any(|marker| candidate.join(marker).exists())
            {
                return Some(candidate.to_path_buf());
            }
            dir = candidate.parent();
        }
        None
    }
}

impl LspConfig {
    /// Build extension → server name map.
    ///
    /// On overlap the alphabetically first server name wins, so the choice
    /// does not depend on `HashMap` iteration order.
    #[must_use]
    pub fn extension_map(&self) -> HashMap<String, String> {
        let mut extension_map = HashMap::new();
        let mut server_names: Vec<&String> = self.servers.keys().collect();
        server_names.sort();
        for name in server_names {
            for ext in &self.servers[name].file_extensions {
                if let Some(existing) = extension_map.get(ext) {
                    tracing::warn!(
                        "Multiple LSP servers configured for extension '{ext}': '{existing}' and '{name}'. Using '{existing}'."
                    );
                    continue;
                }
                extension_map.insert(ext.clone(), name.clone());
            }
        }
        extension_map
    }

    /// Pick the server for `path` by extension.
    #[must_use]
    pub fn server_for_path(&self, path: &Path) -> Option<(&str, &ServerConfig)> {
        let ext = path.extension()?.to_str()?;
        let name = self.extension_map().remove(ext)?;
        self.servers
            .get_key_value(&name)
            .map(|(name, config)| (name.as_str(), config))
    }
}
