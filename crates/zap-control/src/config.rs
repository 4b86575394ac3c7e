//! Server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use zap_auth::{AuthError, AuthServerConfig};
use zap_proto::MsgCtl;

use crate::hook::Op;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerTransportConfig {
    /// Upper bound on the work connections pooled per client
    pub max_pool_count: usize,
    /// Seconds without a ping before a session is closed; 0 or less disables the check
    pub heartbeat_timeout: i64,
    /// Largest accepted frame payload in bytes
    pub max_message_length: i64,
    /// Visitor connections queued per secret proxy before new ones are refused
    pub visitor_backlog: usize,
}

impl Default for ServerTransportConfig {
    fn default() -> Self {
        Self {
            max_pool_count: 5,
            heartbeat_timeout: 90,
            max_message_length: MsgCtl::DEFAULT_MAX_MSG_LENGTH,
            visitor_backlog: zap_transport::listener::DEFAULT_BACKLOG,
        }
    }
}

/// An HTTP hook plugin endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpPluginConfig {
    pub name: String,
    pub addr: String,
    pub path: String,
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    /// Address public proxy ports are bound on; defaults to `bind_addr`
    pub proxy_bind_addr: String,
    pub auth: AuthServerConfig,
    pub transport: ServerTransportConfig,
    pub detailed_errors_to_client: bool,
    /// Seconds a user connection waits for a work connection
    pub user_conn_timeout: u64,
    pub http_plugins: Vec<HttpPluginConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7000,
            proxy_bind_addr: String::new(),
            auth: AuthServerConfig::default(),
            transport: ServerTransportConfig::default(),
            detailed_errors_to_client: true,
            user_conn_timeout: 10,
            http_plugins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Fill derived defaults and resolve the auth token source
    pub fn complete(&mut self) -> Result<(), AuthError> {
        if self.proxy_bind_addr.is_empty() {
            self.proxy_bind_addr = self.bind_addr.clone();
        }
        if self.transport.max_message_length <= 0 {
            self.transport.max_message_length = MsgCtl::DEFAULT_MAX_MSG_LENGTH;
        }
        self.auth.complete()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    /// `None` when the heartbeat check is disabled
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.transport.heartbeat_timeout > 0)
            .then(|| Duration::from_secs(self.transport.heartbeat_timeout as u64))
    }

    pub fn user_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.user_conn_timeout)
    }
}

/// Text sent to the peer for a failed request
///
/// Carries the underlying error only when detailed errors are enabled.
pub fn generate_response_error_string(
    summary: &str,
    err: &dyn std::fmt::Display,
    detailed: bool,
) -> String {
    if detailed {
        err.to_string()
    } else {
        summary.to_string()
    }
}
