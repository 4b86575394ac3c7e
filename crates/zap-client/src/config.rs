//! Client configuration

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use zap_auth::AuthClientConfig;
use zap_proto::NewProxy;

use crate::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientTransportConfig {
    /// Work connections requested up front
    pub pool_count: usize,
    /// Seconds between pings; 0 or less disables them
    pub heartbeat_interval: i64,
    /// Seconds without a pong before reconnecting; 0 or less disables the check
    pub heartbeat_timeout: i64,
    /// Seconds allowed for dialing the server
    pub dial_timeout: u64,
}

impl Default for ClientTransportConfig {
    fn default() -> Self {
        Self {
            pool_count: 1,
            heartbeat_interval: 30,
            heartbeat_timeout: 90,
            dial_timeout: 10,
        }
    }
}

fn positive_secs(secs: i64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs as u64))
}

impl ClientTransportConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        positive_secs(self.heartbeat_interval)
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        positive_secs(self.heartbeat_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }
}

/// A local service exposed through the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub name: String,
    /// `tcp` or `stcp`
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub local_ip: String,
    pub local_port: u16,
    /// Public port for `tcp` proxies; 0 lets the server pick
    pub remote_port: u16,
    /// Shared secret of an `stcp` proxy
    pub sk: String,
    pub allow_users: Vec<String>,
    pub use_encryption: bool,
    pub use_compression: bool,
    pub metas: HashMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            proxy_type: "tcp".to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 0,
            remote_port: 0,
            sk: String::new(),
            allow_users: Vec::new(),
            use_encryption: false,
            use_compression: false,
            metas: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    pub fn to_new_proxy(&self) -> NewProxy {
        NewProxy {
            proxy_name: self.name.clone(),
            proxy_type: self.proxy_type.clone(),
            use_encryption: self.use_encryption,
            use_compression: self.use_compression,
            metas: self.metas.clone(),
            remote_port: self.remote_port,
            sk: self.sk.clone(),
            allow_users: self.allow_users.clone(),
        }
    }
}

/// Local entry point to another client's `stcp` proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisitorConfig {
    pub name: String,
    /// Name of the `stcp` proxy to reach
    pub server_name: String,
    pub sk: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub use_encryption: bool,
    pub use_compression: bool,
}

impl Default for VisitorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            server_name: String::new(),
            sk: String::new(),
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 0,
            use_encryption: false,
            use_compression: false,
        }
    }
}

impl VisitorConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub user: String,
    pub metas: HashMap<String, String>,
    pub auth: AuthClientConfig,
    pub transport: ClientTransportConfig,
    pub proxies: Vec<ProxyConfig>,
    pub visitors: Vec<VisitorConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            server_port: 7000,
            user: String::new(),
            metas: HashMap::new(),
            auth: AuthClientConfig::default(),
            transport: ClientTransportConfig::default(),
            proxies: Vec::new(),
            visitors: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Read a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ClientError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }

    /// Validate proxies and visitors and resolve the auth token source
    pub fn complete(&mut self) -> Result<(), ClientError> {
        self.auth.complete()?;

        let mut names = HashSet::new();
        for proxy in &self.proxies {
            if proxy.name.is_empty() {
                return Err(ClientError::Config("proxy name is required".to_string()));
            }
            if !names.insert(proxy.name.as_str()) {
                return Err(ClientError::Config(format!(
                    "proxy [{}] is defined more than once",
                    proxy.name
                )));
            }
            match proxy.proxy_type.as_str() {
                "tcp" | "stcp" => {}
                other => {
                    return Err(ClientError::Config(format!(
                        "proxy [{}]: unsupported type [{}]",
                        proxy.name, other
                    )))
                }
            }
            if proxy.local_port == 0 {
                return Err(ClientError::Config(format!(
                    "proxy [{}]: localPort is required",
                    proxy.name
                )));
            }
        }

        for visitor in &self.visitors {
            if visitor.server_name.is_empty() {
                return Err(ClientError::Config(format!(
                    "visitor [{}]: serverName is required",
                    visitor.name
                )));
            }
        }
        Ok(())
    }
}
