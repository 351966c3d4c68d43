//! Server configuration.
//!
//! A [`Config`] is validated once, when it is built, and is immutable from
//! then on: every component reads it through a shared reference and nothing
//! can change it while the server runs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ServerError;

/// Read buffer used when streaming static files.
pub const DEFAULT_FILE_READER_BUFFER_SIZE: usize = 4096;
/// Upper bound for the static file read buffer (1 GiB).
pub const MAX_FILE_READER_BUFFER_SIZE: usize = 1024 * 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Transport used by a listening address.
///
/// `Secure` connections are handed to the application's
/// [`SecureAcceptor`](crate::server::SecureAcceptor) before any HTTP is read;
/// the server itself never negotiates TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[serde(alias = "http")]
    Plain,
    #[serde(alias = "https")]
    Secure,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Plain => f.write_str("plain"),
            Protocol::Secure => f.write_str("secure"),
        }
    }
}

/// One `(host, port, protocol)` entry to listen on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenAddress {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl ListenAddress {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Plain,
        }
    }

    pub fn secure(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Secure,
        }
    }

    /// Parses `host:port` or `[v6-host]:port` into a plain address.
    pub fn parse(s: &str) -> Result<Self, ServerError> {
        let invalid = || ServerError::InvalidConfiguration(format!("invalid listen address `{s}`"));

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::plain(host, port))
    }

    /// The `host:port` string handed to the socket layer.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.authority(), self.protocol)
    }
}

/// Immutable description of how the server is assembled.
#[derive(Debug, Clone)]
pub struct Config {
    addresses: Vec<ListenAddress>,
    worker_threads: usize,
    public_dir: Option<PathBuf>,
    request_timeout: Option<Duration>,
    file_reader_buffer_size: usize,
    shutdown_timeout: Duration,
    max_header_bytes: usize,
    max_body_bytes: usize,
    max_frame_bytes: usize,
}

impl Config {
    pub fn builder(addresses: impl IntoIterator<Item = ListenAddress>) -> ConfigBuilder {
        ConfigBuilder {
            addresses: addresses.into_iter().collect(),
            worker_threads: default_worker_threads(),
            public_dir: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            file_reader_buffer_size: DEFAULT_FILE_READER_BUFFER_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Builds a configuration from YAML text.
    ///
    /// ```yaml
    /// addresses:
    ///   - { host: 0.0.0.0, port: 8080, protocol: plain }
    /// worker_threads: 4
    /// public_dir: ./public
    /// request_timeout_ms: 30000
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ServerError> {
        let raw: RawConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ServerError::InvalidConfiguration(e.to_string()))?;
        raw.into_builder().build()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServerError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Loads the configuration from the environment.
    ///
    /// `EMBER_CONFIG` names a YAML file; without it a single plain address is
    /// taken from `LISTEN` (default `127.0.0.1:8080`) and the static directory
    /// from `PUBLIC_DIR`.
    pub fn load() -> Result<Self, ServerError> {
        if let Ok(path) = std::env::var("EMBER_CONFIG") {
            return Self::from_file(path);
        }

        let listen = std::env::var("LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
        let mut builder = Self::builder([ListenAddress::parse(&listen)?]);
        if let Ok(dir) = std::env::var("PUBLIC_DIR") {
            builder = builder.public_dir(dir);
        }
        builder.build()
    }

    pub fn addresses(&self) -> &[ListenAddress] {
        &self.addresses
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Canonical static directory, when static serving is enabled.
    pub fn public_dir(&self) -> Option<&Path> {
        self.public_dir.as_deref()
    }

    /// `None` when the timeout is disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn file_reader_buffer_size(&self) -> usize {
        self.file_reader_buffer_size
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

/// Collects settings and validates them in [`ConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    addresses: Vec<ListenAddress>,
    worker_threads: usize,
    public_dir: Option<PathBuf>,
    request_timeout: Option<Duration>,
    file_reader_buffer_size: usize,
    shutdown_timeout: Duration,
    max_header_bytes: usize,
    max_body_bytes: usize,
    max_frame_bytes: usize,
}

impl ConfigBuilder {
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn public_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.public_dir = Some(dir.into());
        self
    }

    /// A zero duration disables the timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn no_request_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    pub fn file_reader_buffer_size(mut self, size: usize) -> Self {
        self.file_reader_buffer_size = size;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn max_header_bytes(mut self, n: usize) -> Self {
        self.max_header_bytes = n;
        self
    }

    pub fn max_body_bytes(mut self, n: usize) -> Self {
        self.max_body_bytes = n;
        self
    }

    pub fn max_frame_bytes(mut self, n: usize) -> Self {
        self.max_frame_bytes = n;
        self
    }

    pub fn build(self) -> Result<Config, ServerError> {
        let invalid = |msg: String| Err(ServerError::InvalidConfiguration(msg));

        if self.addresses.is_empty() {
            return invalid("at least one address must be provided".into());
        }
        if let Some(addr) = self.addresses.iter().find(|a| a.host.trim().is_empty()) {
            return invalid(format!("address with port {} has an empty host", addr.port));
        }
        if self.worker_threads == 0 {
            return invalid("worker_threads must be greater than zero".into());
        }
        if self.file_reader_buffer_size == 0
            || self.file_reader_buffer_size > MAX_FILE_READER_BUFFER_SIZE
        {
            return invalid(format!(
                "file_reader_buffer_size ({}) must be > 0 and at most 1 GiB",
                self.file_reader_buffer_size
            ));
        }
        if self.max_header_bytes == 0 {
            return invalid("max_header_bytes must be greater than zero".into());
        }

        let public_dir = match self.public_dir {
            Some(dir) => Some(canonical_dir(&dir)?),
            None => None,
        };

        Ok(Config {
            addresses: self.addresses,
            worker_threads: self.worker_threads,
            public_dir,
            request_timeout: self.request_timeout,
            file_reader_buffer_size: self.file_reader_buffer_size,
            shutdown_timeout: self.shutdown_timeout,
            max_header_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
            max_frame_bytes: self.max_frame_bytes,
        })
    }
}

fn canonical_dir(dir: &Path) -> Result<PathBuf, ServerError> {
    let full = std::fs::canonicalize(dir).map_err(|e| {
        ServerError::InvalidConfiguration(format!(
            "could not use public directory {}: {e}",
            dir.display()
        ))
    })?;
    if !full.is_dir() {
        return Err(ServerError::InvalidConfiguration(format!(
            "public directory {} is not a directory",
            dir.display()
        )));
    }
    Ok(full)
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    addresses: Vec<ListenAddress>,
    #[serde(default = "default_worker_threads")]
    worker_threads: usize,
    #[serde(default)]
    public_dir: Option<PathBuf>,
    #[serde(default = "default_request_timeout_ms")]
    request_timeout_ms: u64,
    #[serde(default = "default_file_reader_buffer_size")]
    file_reader_buffer_size: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    shutdown_timeout_ms: u64,
    #[serde(default = "default_max_header_bytes")]
    max_header_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    max_body_bytes: usize,
    #[serde(default = "default_max_frame_bytes")]
    max_frame_bytes: usize,
}

impl RawConfig {
    fn into_builder(self) -> ConfigBuilder {
        let mut builder = Config::builder(self.addresses)
            .worker_threads(self.worker_threads)
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
            .file_reader_buffer_size(self.file_reader_buffer_size)
            .shutdown_timeout(Duration::from_millis(self.shutdown_timeout_ms))
            .max_header_bytes(self.max_header_bytes)
            .max_body_bytes(self.max_body_bytes)
            .max_frame_bytes(self.max_frame_bytes);
        if let Some(dir) = self.public_dir {
            builder = builder.public_dir(dir);
        }
        builder
    }
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

fn default_file_reader_buffer_size() -> usize {
    DEFAULT_FILE_READER_BUFFER_SIZE
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64
}

fn default_max_header_bytes() -> usize {
    DEFAULT_MAX_HEADER_BYTES
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
