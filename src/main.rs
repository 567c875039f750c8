use clap::{Parser, Subcommand};
use lsp_session::config::{SERVER_PATH_ENV, file_uri, resolve_command};
use lsp_session::logging::{LogConfig, init_logging};
use lsp_session::{LspClient, LspError, ServerConfig};
use lsp_types::Uri;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Run one LSP request against a language server and print the result as JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Language server executable (overrides LSP_SERVER_PATH env var)
    #[arg(long, value_name = "PATH")]
    server: Option<String>,

    /// Argument passed to the server, repeatable (e.g. --server-arg=--stdio)
    #[arg(long = "server-arg", value_name = "ARG", allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Workspace root and server working directory (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Language identifier of FILE (derived from its extension by default)
    #[arg(long, value_name = "ID")]
    language_id: Option<String>,

    /// Per-request timeout in milliseconds (no timeout by default)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides LSP_SESSION_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Document to open
    file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// textDocument/completion at a zero-based position
    Completion { line: u32, character: u32 },
    /// textDocument/hover at a zero-based position
    Hover { line: u32, character: u32 },
    /// textDocument/definition at a zero-based position
    Definition { line: u32, character: u32 },
    /// textDocument/diagnostic for the whole document
    Diagnostics,
}

/// Best-effort language identifier from a file extension
fn language_id_for(path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "yml" | "yaml" => "yaml",
        "json" => "json",
        "toml" => "toml",
        "rs" => "rust",
        "py" => "python",
        "ts" => "typescript",
        "js" => "javascript",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "md" => "markdown",
        _ => "plaintext",
    }
    .to_string()
}

async fn run(
    client: &LspClient,
    uri: Uri,
    language_id: String,
    text: String,
    command: Command,
) -> Result<Value, LspError> {
    client.ensure_ready().await?;
    client.open_document(uri.clone(), language_id, text)?;

    let value = match command {
        Command::Completion { line, character } => {
            serde_json::to_value(client.get_completions(&uri, line, character).await?)?
        }
        Command::Hover { line, character } => {
            serde_json::to_value(client.get_hover(&uri, line, character).await?)?
        }
        Command::Definition { line, character } => {
            serde_json::to_value(client.get_definition(&uri, line, character).await?)?
        }
        Command::Diagnostics => serde_json::to_value(client.get_diagnostics(&uri).await?)?,
    };

    client.close_document(&uri)?;
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let Some(server) = resolve_command(args.server.clone(), std::env::var(SERVER_PATH_ENV).ok())
    else {
        eprintln!("No language server given: pass --server or set {SERVER_PATH_ENV}");
        std::process::exit(2);
    };

    let mut builder = ServerConfig::builder()
        .command(server)
        .args(args.server_args.clone());
    if let Some(root) = &args.root {
        builder = builder.working_directory(root).workspace_root(root);
    }
    if let Some(ms) = args.timeout_ms {
        builder = builder.request_timeout(Duration::from_millis(ms));
    }
    let config = builder.build()?;

    let path = args.file.canonicalize()?;
    let text = tokio::fs::read_to_string(&path).await?;
    let uri = file_uri(&path)?;
    let language_id = args
        .language_id
        .clone()
        .unwrap_or_else(|| language_id_for(&path));

    info!("Using language server: {}", config.command);
    let client = LspClient::new(config);
    let outcome = run(&client, uri, language_id, text, args.command).await;

    if let Err(e) = client.shutdown().await {
        warn!("Shutdown failed: {}", e);
    }

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_id_from_extension() {
        assert_eq!(language_id_for(Path::new("/w/a.yml")), "yaml");
        assert_eq!(language_id_for(Path::new("/w/A.YAML")), "yaml");
        assert_eq!(language_id_for(Path::new("/w/main.cpp")), "cpp");
        assert_eq!(language_id_for(Path::new("/w/README")), "plaintext");
    }

    #[test]
    fn test_cli_parses_position_commands() {
        let args = Args::try_parse_from([
            "lsp-session",
            "--server",
            "yaml-language-server",
            "--server-arg=--stdio",
            "a.yml",
            "hover",
            "3",
            "7",
        ])
        .unwrap();

        assert_eq!(args.server.as_deref(), Some("yaml-language-server"));
        assert_eq!(args.server_args, vec!["--stdio"]);
        assert!(matches!(
            args.command,
            Command::Hover {
                line: 3,
                character: 7
            }
        ));
    }

    #[test]
    fn test_cli_diagnostics_needs_no_position() {
        let args = Args::try_parse_from(["lsp-session", "a.yml", "diagnostics"]).unwrap();
        assert!(args.server.is_none());
        assert!(matches!(args.command, Command::Diagnostics));
    }
}
