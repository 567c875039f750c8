//! Configuration for a language server session
//!
//! Provides [`ServerConfig`] with a validating builder. Everything here is a
//! resolved input: deciding which server to run for a project is left to the
//! caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lsp_types::Uri;
use url::Url;

/// Environment variable consulted when no server command is given explicitly
pub const SERVER_PATH_ENV: &str = "LSP_SERVER_PATH";

/// Client name reported in `initialize`
pub const DEFAULT_CLIENT_NAME: &str = env!("CARGO_PKG_NAME");

/// Client version reported in `initialize`
pub const DEFAULT_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Server command must not be empty")]
    EmptyCommand,

    #[error("Invalid workspace root {path}: {source}")]
    WorkspaceRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid working directory {path}: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Request timeout must be greater than zero")]
    ZeroTimeout,

    #[error("Cannot express {path} as a file URI")]
    InvalidUri { path: PathBuf },
}

impl ConfigError {
    pub fn missing_field(field: &str) -> Self {
        Self::MissingField {
            field: field.to_string(),
        }
    }
}

// ============================================================================
// Server Configuration
// ============================================================================

/// Resolved inputs for spawning and talking to one language server
#[derive(Clone)]
pub struct ServerConfig {
    /// Server executable
    pub command: String,

    pub args: Vec<String>,

    /// Working directory of the server process
    pub working_directory: PathBuf,

    /// Directory announced to the server as the workspace root
    pub workspace_root: PathBuf,

    /// Per-request timeout; `None` waits until the server answers or exits
    pub request_timeout: Option<Duration>,

    pub client_name: String,
    pub client_version: String,

    /// Receives each line the server writes to stderr
    pub stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_directory", &self.working_directory)
            .field("workspace_root", &self.workspace_root)
            .field("request_timeout", &self.request_timeout)
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .finish()
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// `file://` URI of the workspace root
    pub fn root_uri(&self) -> Result<Uri, ConfigError> {
        directory_uri(&self.workspace_root)
    }

    /// Workspace name announced alongside the root URI
    pub fn workspace_name(&self) -> String {
        self.workspace_root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.workspace_root.display().to_string())
    }
}

/// Convert an absolute file path into a `file://` URI
pub fn file_uri(path: &Path) -> Result<Uri, ConfigError> {
    let url = Url::from_file_path(path).map_err(|_| ConfigError::InvalidUri {
        path: path.to_path_buf(),
    })?;
    parse_uri(path, &url)
}

fn directory_uri(path: &Path) -> Result<Uri, ConfigError> {
    let url = Url::from_directory_path(path).map_err(|_| ConfigError::InvalidUri {
        path: path.to_path_buf(),
    })?;
    parse_uri(path, &url)
}

fn parse_uri(path: &Path, url: &Url) -> Result<Uri, ConfigError> {
    url.as_str()
        .parse::<Uri>()
        .map_err(|_| ConfigError::InvalidUri {
            path: path.to_path_buf(),
        })
}

/// Explicit command first, then the environment value
pub fn resolve_command(explicit: Option<String>, from_env: Option<String>) -> Option<String> {
    explicit.or(from_env).filter(|command| !command.trim().is_empty())
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for [`ServerConfig`] with validation and defaults
#[derive(Default)]
pub struct ServerConfigBuilder {
    command: Option<String>,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    workspace_root: Option<PathBuf>,
    request_timeout: Option<Duration>,
    client_name: Option<String>,
    client_version: Option<String>,
    stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server executable
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the server's working directory (defaults to the current directory)
    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    /// Set the workspace root (defaults to the working directory)
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(path.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = Some(version.into());
        self
    }

    pub fn stderr_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let command = self
            .command
            .ok_or_else(|| ConfigError::missing_field("command"))?;
        if command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        if self.request_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::ZeroTimeout);
        }

        let working_directory = match self.working_directory {
            Some(path) => Self::validate_directory(path, |path, source| {
                ConfigError::WorkingDirectory { path, source }
            })?,
            None => std::env::current_dir().map_err(|source| ConfigError::WorkingDirectory {
                path: PathBuf::from("."),
                source,
            })?,
        };

        let workspace_root = match self.workspace_root {
            Some(path) => Self::validate_directory(path, |path, source| {
                ConfigError::WorkspaceRoot { path, source }
            })?,
            None => working_directory.clone(),
        };

        Ok(ServerConfig {
            command,
            args: self.args,
            working_directory,
            workspace_root,
            request_timeout: self.request_timeout,
            client_name: self
                .client_name
                .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()),
            client_version: self
                .client_version
                .unwrap_or_else(|| DEFAULT_CLIENT_VERSION.to_string()),
            stderr_handler: self.stderr_handler,
        })
    }

    /// Resolve to an absolute, existing directory
    fn validate_directory(
        path: PathBuf,
        error: impl Fn(PathBuf, std::io::Error) -> ConfigError,
    ) -> Result<PathBuf, ConfigError> {
        let resolved = path.canonicalize().map_err(|e| error(path.clone(), e))?;
        if !resolved.is_dir() {
            return Err(error(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }
        Ok(resolved)
    }
}
