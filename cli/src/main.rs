//! tether CLI - run one language server query and print the result as JSON.
//!
//! ```text
//! tether [--config PATH] [--server NAME] [--root DIR] <COMMAND>
//! ```
//!
//! Each invocation starts the server, performs the handshake, runs a single
//! operation, prints the result to stdout and shuts the server down. Logs go
//! to stderr (`RUST_LOG`, default `warn`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_config::TetherConfig;
use tether_lsp::{Client, ServerConfig};

#[derive(Parser)]
#[command(name = "tether", version, about = "Query a language server from the command line")]
struct Cli {
    /// Config file (default: ~/.tether/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server name from the config; chosen by file extension when omitted
    #[arg(long, global = true)]
    server: Option<String>,

    /// Workspace root; found from the server's root markers when omitted
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long = "timeout-ms", global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

/// A one-indexed position in a file.
#[derive(Args)]
struct At {
    file: PathBuf,
    line: u32,
    column: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Where the symbol at a position is defined
    Definition(At),
    /// Every reference to the symbol at a position
    References {
        #[command(flatten)]
        at: At,
        /// Leave the declaration itself out of the results
        #[arg(long = "exclude-declaration")]
        exclude_declaration: bool,
    },
    /// Implementations of the trait or interface at a position
    Implementation(At),
    /// Where the type of the symbol at a position is defined
    TypeDefinition(At),
    /// Hover documentation at a position
    Hover(At),
    /// Edits that would rename the symbol at a position (not applied)
    Rename {
        #[command(flatten)]
        at: At,
        new_name: String,
    },
    /// Symbols declared in a file
    Symbols { file: PathBuf },
    /// Diagnostics for a file
    Diagnostics {
        file: PathBuf,
        /// How long to wait for the server to publish
        #[arg(long = "wait-ms", default_value_t = 3000)]
        wait_ms: u64,
        /// Ask with `textDocument/diagnostic` instead of waiting for a push
        #[arg(long)]
        pull: bool,
    },
    /// Symbols matching a query across the workspace
    WorkspaceSymbols { query: String },
}

impl Command {
    /// The file the command is about, used to pick the server and root.
    fn file(&self) -> Option<&Path> {
        match self {
            Command::Definition(at)
            | Command::Implementation(at)
            | Command::TypeDefinition(at)
            | Command::Hover(at)
            | Command::References { at, .. }
            | Command::Rename { at, .. } => Some(&at.file),
            Command::Symbols { file } | Command::Diagnostics { file, .. } => Some(file),
            Command::WorkspaceSymbols { .. } => None,
        }
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<TetherConfig> {
    let config = match path {
        Some(path) => TetherConfig::load_from(path)?,
        None => TetherConfig::load()?,
    };
    Ok(config)
}

/// Pick the server: `--server` if given, else by the file's extension, else
/// the only configured server.
fn select_server(
    config: &TetherConfig,
    requested: Option<&str>,
    file: Option<&Path>,
) -> Result<(String, ServerConfig)> {
    let servers = &config.lsp.servers;
    if let Some(name) = requested {
        let server = servers
            .get(name)
            .ok_or_else(|| anyhow!("no server named '{name}' in config"))?;
        return Ok((name.to_string(), server.clone()));
    }
    if let Some(file) = file {
        return config
            .lsp
            .server_for_path(file)
            .map(|(name, server)| (name.to_string(), server.clone()))
            .ok_or_else(|| anyhow!("no server configured for {}", file.display()));
    }
    match servers.iter().next() {
        Some((name, server)) if servers.len() == 1 => Ok((name.clone(), server.clone())),
        Some(_) => bail!("several servers configured; choose one with --server"),
        None => bail!("no language servers configured"),
    }
}

async fn run(client: &Client, command: Command, timeout: Option<Duration>) -> Result<Value> {
    let value = match command {
        Command::Definition(At { file, line, column }) => {
            serde_json::to_value(client.definition(&file, line, column, timeout).await?)?
        }
        Command::References {
            at: At { file, line, column },
            exclude_declaration,
        } => serde_json::to_value(
            client
                .references(&file, line, column, !exclude_declaration, timeout)
                .await?,
        )?,
        Command::Implementation(At { file, line, column }) => {
            serde_json::to_value(client.implementation(&file, line, column, timeout).await?)?
        }
        Command::TypeDefinition(At { file, line, column }) => serde_json::to_value(
            client
                .type_definition(&file, line, column, timeout)
                .await?,
        )?,
        Command::Hover(At { file, line, column }) => {
            serde_json::to_value(client.hover(&file, line, column, timeout).await?)?
        }
        Command::Rename {
            at: At { file, line, column },
            new_name,
        } => serde_json::to_value(
            client
                .rename(&file, line, column, &new_name, timeout)
                .await?,
        )?,
        Command::Symbols { file } => {
            serde_json::to_value(client.document_symbols(&file, timeout).await?)?
        }
        Command::Diagnostics {
            file,
            wait_ms,
            pull,
        } => {
            let set = if pull {
                client.pull_diagnostics(&file, timeout).await?
            } else {
                client
                    .wait_for_diagnostics(&file, Duration::from_millis(wait_ms))
                    .await?
            };
            serde_json::to_value(set)?
        }
        Command::WorkspaceSymbols { query } => {
            serde_json::to_value(client.workspace_symbols(&query, timeout).await?)?
        }
    };
    Ok(value)
}

fn absolutize(command: &mut Command) -> Result<()> {
    let file = match command {
        Command::Definition(at)
        | Command::Implementation(at)
        | Command::TypeDefinition(at)
        | Command::Hover(at)
        | Command::References { at, .. }
        | Command::Rename { at, .. } => &mut at.file,
        Command::Symbols { file } | Command::Diagnostics { file, .. } => file,
        Command::WorkspaceSymbols { .. } => return Ok(()),
    };
    *file = std::path::absolute(&*file)
        .with_context(|| format!("resolving {}", file.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut cli = Cli::parse();
    absolutize(&mut cli.command)?;

    let config = load_config(cli.config.as_deref())?;
    let file = cli.command.file();
    let (name, mut server) = select_server(&config, cli.server.as_deref(), file)?;

    let root = match cli.root.as_deref() {
        Some(root) => Some(root.to_path_buf()),
        None => file.and_then(|f| server.find_root(f)),
    };
    if let Some(root) = root {
        server.workspace_root = Some(root);
    }

    let client = Client::start(&name, &server)
        .await
        .with_context(|| format!("starting language server '{name}' ({})", server.command))?;

    let timeout = cli.timeout_ms.map(Duration::from_millis);
    let result = run(&client, cli.command, timeout).await;
    if result.is_err() {
        for line in client.stderr_tail() {
            tracing::debug!(target: "tether::stderr", "{line}");
        }
    }
    client.shutdown().await;

    let value = result.with_context(|| format!("language server '{name}'"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
