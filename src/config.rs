use std::{fmt, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_EXPOSED_PORT: u16 = 8080;
pub const DEFAULT_LISTEN_PORT: u16 = 5000;
pub const DEFAULT_MAX_STREAMS: usize = 256;
pub const DEFAULT_TCP_RETRIES: u32 = 5;
pub const DEFAULT_TCP_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Which end of the bridge this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes a local service into the bridge.
    Exposer,

    /// Forwards connections from its own loopback into the bridge.
    Accessor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exposer => "exposer",
            Self::Accessor => "accessor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exposer" => Ok(Self::Exposer),
            "accessor" => Ok(Self::Accessor),
            _ => Err(()),
        }
    }
}

/// The set of protocols a bridge endpoint is willing to carry. `Both` is only
/// meaningful on exposers; each peer link still negotiates down to a single
/// concrete protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Both => "both",
        }
    }

    pub fn includes_tcp(self) -> bool {
        matches!(self, Self::Tcp | Self::Both)
    }

    pub fn accepts(self, other: StreamProtocol) -> bool {
        match self {
            Self::Both => true,
            Self::Tcp => other == StreamProtocol::Tcp,
            Self::Udp => other == StreamProtocol::Udp,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "both" => Ok(Self::Both),
            _ => Err(()),
        }
    }
}

/// A single concrete protocol, as negotiated per peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    Tcp,
    Udp,
}

impl StreamProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamProtocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(()),
        }
    }
}

/// Immutable runtime configuration, assembled from the CLI and optionally a
/// JSON config file before any network activity starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub role: Role,
    pub bridge_id: String,
    pub protocol: Protocol,
    pub exposed_port: u16,
    pub listen_port: u16,

    /// Shared authentication secret. `None` disables the challenge/response
    /// phase of the handshake.
    pub secret: Option<String>,

    /// Loopback port for the read-only status endpoint. 0 disables it.
    pub status_port: u16,

    /// Total concurrent substreams allowed process-wide.
    pub max_streams: usize,

    /// Per-substream throttle in the exposer→accessor direction. 0 disables.
    pub kbps: u64,

    pub tcp_connect_retries: u32,
    pub tcp_retry_delay: Duration,
    pub handshake_timeout: Duration,

    pub verbose: bool,
    pub json_logs: bool,

    /// When false, the fixed list of benign disconnect diagnostics is
    /// suppressed from warning-level output.
    pub show_warnings: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Couldn't read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Couldn't parse config file: {0}")]
    FileParse(#[from] serde_json::Error),

    #[error("Invalid mode {0:?}, expected \"exposer\" or \"accessor\"")]
    InvalidMode(String),

    #[error("Invalid protocol {0:?}, expected \"tcp\", \"udp\" or \"both\"")]
    InvalidProtocol(String),

    #[error("A bridge id must be specified and non-empty")]
    MissingBridgeId,

    #[error("An accessor must pick a single protocol, \"both\" is only valid on exposers")]
    AccessorBothProtocols,

    #[error("max-streams must be at least 1")]
    ZeroMaxStreams,
}

/// The JSON config file surface. All keys but `mode` and `bridgeId` are
/// optional; validation rules match the CLI.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    mode: String,
    bridge_id: String,
    exposed_port: Option<u16>,
    listen_port: Option<u16>,
    protocol: Option<String>,
    verbose: Option<bool>,
    secret: Option<String>,
    status: Option<u16>,
    max_streams: Option<usize>,
    kbps: Option<u64>,
    tcp_retries: Option<u32>,
    tcp_retry_delay_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
}

/// CLI flags that override file values or defaults. `None` means the flag was
/// not given.
#[derive(Debug, Default, PartialEq)]
pub struct Overrides {
    pub exposed_port: Option<u16>,
    pub listen_port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub secret: Option<String>,
    pub status_port: Option<u16>,
    pub max_streams: Option<usize>,
    pub kbps: Option<u64>,
    pub tcp_retries: Option<u32>,
    pub tcp_retry_delay_ms: Option<u64>,
    pub verbose: bool,
    pub json_logs: bool,
    pub show_warnings: bool,
}

/// How the process was asked to start: a role plus bridge id on the command
/// line, or a config file to load.
#[derive(Debug, PartialEq)]
pub enum LaunchMode {
    Direct { role: Role, bridge_id: String },
    ConfigFile(String),
}

pub fn resolve(mode: LaunchMode, overrides: Overrides) -> Result<Config, ConfigError> {
    let mut config = match mode {
        LaunchMode::Direct { role, bridge_id } => Config {
            role,
            bridge_id,
            protocol: Protocol::Tcp,
            exposed_port: DEFAULT_EXPOSED_PORT,
            listen_port: DEFAULT_LISTEN_PORT,
            secret: None,
            status_port: 0,
            max_streams: DEFAULT_MAX_STREAMS,
            kbps: 0,
            tcp_connect_retries: DEFAULT_TCP_RETRIES,
            tcp_retry_delay: Duration::from_millis(DEFAULT_TCP_RETRY_DELAY_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            verbose: false,
            json_logs: false,
            show_warnings: false,
        },
        LaunchMode::ConfigFile(path) => load_file(Path::new(&path))?,
    };

    if let Some(port) = overrides.exposed_port {
        config.exposed_port = port;
    }
    if let Some(port) = overrides.listen_port {
        config.listen_port = port;
    }
    if let Some(protocol) = overrides.protocol {
        config.protocol = protocol;
    }
    if let Some(secret) = overrides.secret {
        config.secret = non_empty(secret);
    }
    if let Some(port) = overrides.status_port {
        config.status_port = port;
    }
    if let Some(max_streams) = overrides.max_streams {
        config.max_streams = max_streams;
    }
    if let Some(kbps) = overrides.kbps {
        config.kbps = kbps;
    }
    if let Some(retries) = overrides.tcp_retries {
        config.tcp_connect_retries = retries;
    }
    if let Some(delay) = overrides.tcp_retry_delay_ms {
        config.tcp_retry_delay = Duration::from_millis(delay);
    }
    config.verbose |= overrides.verbose;
    config.json_logs |= overrides.json_logs;
    config.show_warnings |= overrides.show_warnings;

    validate(&config)?;
    Ok(config)
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let contents = std::fs::read_to_string(path)?;
    let file: ConfigFile = serde_json::from_str(&contents)?;

    let role = file
        .mode
        .parse::<Role>()
        .map_err(|()| ConfigError::InvalidMode(file.mode.clone()))?;

    let protocol = match &file.protocol {
        None => Protocol::Tcp,
        Some(s) => s
            .parse::<Protocol>()
            .map_err(|()| ConfigError::InvalidProtocol(s.clone()))?,
    };

    Ok(Config {
        role,
        bridge_id: file.bridge_id,
        protocol,
        exposed_port: file.exposed_port.unwrap_or(DEFAULT_EXPOSED_PORT),
        listen_port: file.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
        secret: file.secret.and_then(non_empty),
        status_port: file.status.unwrap_or(0),
        max_streams: file.max_streams.unwrap_or(DEFAULT_MAX_STREAMS),
        kbps: file.kbps.unwrap_or(0),
        tcp_connect_retries: file.tcp_retries.unwrap_or(DEFAULT_TCP_RETRIES),
        tcp_retry_delay: Duration::from_millis(file.tcp_retry_delay_ms.unwrap_or(DEFAULT_TCP_RETRY_DELAY_MS)),
        handshake_timeout: Duration::from_millis(file.handshake_timeout_ms.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS)),
        verbose: file.verbose.unwrap_or(false),
        json_logs: false,
        show_warnings: false,
    })
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.bridge_id.is_empty() {
        return Err(ConfigError::MissingBridgeId);
    }

    if config.role == Role::Accessor && config.protocol == Protocol::Both {
        return Err(ConfigError::AccessorBothProtocols);
    }

    if config.max_streams == 0 {
        return Err(ConfigError::ZeroMaxStreams);
    }

    Ok(())
}

fn non_empty(s: String) -> Option<String> {
    match s.is_empty() {
        true => None,
        false => Some(s),
    }
}
