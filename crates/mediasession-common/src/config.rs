//! Session and server configuration.
//!
//! Defaults mirror the demo application's preference screen: a plain HTTP
//! content endpoint on the local machine and Google's public STUN server.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Constraints;

pub const DEFAULT_SERVER_PROTOCOL: &str = "http";
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_DEMO_PATH: &str = "/rtp";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Where the JSON-RPC content endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub protocol: String,
    pub address: String,
    pub port: u16,
    /// Demo path on the server, always starting with `/`.
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_SERVER_PROTOCOL.to_string(),
            address: DEFAULT_SERVER_ADDRESS.to_string(),
            port: DEFAULT_SERVER_PORT,
            path: DEFAULT_DEMO_PATH.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.address, self.port, self.path
        )
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.protocol.as_str(), "http" | "https") {
            return Err(Error::config(format!(
                "unsupported server protocol '{}'",
                self.protocol
            )));
        }
        if self.address.trim().is_empty() {
            return Err(Error::config("server address is required"));
        }
        if self.port == 0 {
            return Err(Error::config("server port must be non-zero"));
        }
        if !self.path.starts_with('/') {
            return Err(Error::config(format!(
                "demo path '{}' must start with '/'",
                self.path
            )));
        }
        Ok(())
    }
}

/// Deadlines for each asynchronous wait of a negotiation, in milliseconds.
/// `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Local offer generation, including ICE gathering for peer connections.
    pub local_description_ms: Option<u64>,
    /// Round trip of a JSON-RPC request.
    pub signaling_ms: Option<u64>,
    /// Applying the remote answer.
    pub remote_description_ms: Option<u64>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            local_description_ms: Some(10_000),
            signaling_ms: Some(15_000),
            remote_description_ms: Some(10_000),
        }
    }
}

impl Timeouts {
    /// No deadline on any step.
    pub fn disabled() -> Self {
        Self {
            local_description_ms: None,
            signaling_ms: None,
            remote_description_ms: None,
        }
    }

    pub fn local_description(&self) -> Option<Duration> {
        self.local_description_ms.map(Duration::from_millis)
    }

    pub fn signaling(&self) -> Option<Duration> {
        self.signaling_ms.map(Duration::from_millis)
    }

    pub fn remote_description(&self) -> Option<Duration> {
        self.remote_description_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub server: ServerConfig,
    pub constraints: Constraints,
    pub timeouts: Timeouts,
    pub stun_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            constraints: Constraints::default(),
            timeouts: Timeouts::default(),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        debug!(path = %path.display(), url = %config.server.url(), "loaded session config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        for url in &self.stun_servers {
            if !(url.starts_with("stun:") || url.starts_with("turn:")) {
                return Err(Error::config(format!(
                    "ICE server url '{url}' must start with stun: or turn:"
                )));
            }
        }
        Ok(())
    }
}
