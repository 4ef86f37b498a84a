//! Configuration module for Tunium
//!
//! JSON configuration describing one tunnel side: which role it plays,
//! where the tunnel link lives, and whether a proxy port is opened here.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Which tunnel role this process plays
    pub mode: Mode,

    /// The tunnel link
    pub tunnel: TunnelSettings,

    /// Proxy intake on this side, if any
    #[serde(default)]
    pub proxy: Option<ProxySettings>,

    /// Metrics endpoint, if any
    #[serde(default)]
    pub metrics: Option<MetricsSettings>,
}

/// Tunnel role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accept the tunnel connection (cloud side)
    Server,
    /// Dial out to the server (on-prem side)
    Client,
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Tunnel link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Listen address (server) or server address to dial (client)
    pub address: String,

    /// How the link is carried
    #[serde(default)]
    pub transport: TransportSettings,
}

/// Tunnel transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// One of: tcp, tls, ws, wss
    #[serde(rename = "type", default = "default_transport_type")]
    pub transport_type: String,

    #[serde(default)]
    pub tls: Option<TlsSettings>,

    #[serde(default)]
    pub websocket: Option<WebSocketSettings>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            transport_type: default_transport_type(),
            tls: None,
            websocket: None,
        }
    }
}

fn default_transport_type() -> String {
    "tcp".to_string()
}

/// TLS settings for the tunnel link
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Server name for SNI (client side)
    #[serde(default)]
    pub server_name: Option<String>,

    /// Skip certificate verification (client side)
    #[serde(default)]
    pub allow_insecure: bool,

    /// Certificate file path (server side)
    #[serde(default)]
    pub certificate_file: Option<String>,

    /// Private key file path (server side)
    #[serde(default)]
    pub key_file: Option<String>,
}

/// WebSocket settings for the tunnel link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSettings {
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Host header override (client side)
    #[serde(default)]
    pub host: Option<String>,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            host: None,
        }
    }
}

fn default_ws_path() -> String {
    "/tunnel".to_string()
}

/// Proxy intake settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Address proxy clients connect to
    pub listen: String,

    /// Require `Proxy-Authorization: Basic` credentials
    #[serde(default)]
    pub auth: Option<AuthSettings>,

    /// Deadline for reading the CONNECT header block
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Cap on concurrently open sessions originated here
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

fn default_connect_timeout_secs() -> u64 {
    5
}

/// Basic-auth credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    pub username: String,
    pub password: String,
}

/// Metrics endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Listen address for the /metrics endpoint
    pub listen: String,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create a default server (cloud side) configuration
    pub fn default_server() -> Self {
        Config {
            log: LogConfig::default(),
            mode: Mode::Server,
            tunnel: TunnelSettings {
                address: "0.0.0.0:8443".to_string(),
                transport: TransportSettings::default(),
            },
            proxy: Some(ProxySettings {
                listen: "127.0.0.1:3128".to_string(),
                auth: None,
                connect_timeout_secs: default_connect_timeout_secs(),
                max_sessions: None,
            }),
            metrics: None,
        }
    }

    /// Create a default client (on-prem side) configuration
    pub fn default_client() -> Self {
        Config {
            log: LogConfig::default(),
            mode: Mode::Client,
            tunnel: TunnelSettings {
                address: "tunnel.example.com:8443".to_string(),
                transport: TransportSettings::default(),
            },
            proxy: None,
            metrics: None,
        }
    }
}
