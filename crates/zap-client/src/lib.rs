//! Zap client library
//!
//! Logs in to a zap server, registers the configured proxies, answers work
//! connection requests by dialing local services, and exposes local visitor
//! ports for reaching other clients' secret proxies.

pub mod config;
pub mod service;
pub mod visitor;

pub use config::{ClientConfig, ClientTransportConfig, ProxyConfig, VisitorConfig};
pub use service::{ProxyStatus, Service};

use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use zap_auth::AuthError;
use zap_control::DispatcherError;
use zap_proto::CodecError;
use zap_transport::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Login to server failed: {0}")]
    LoginFailed(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Server rejected the connection: {0}")]
    Rejected(String),

    #[error("bind {addr} error: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Errors that retrying with the same configuration cannot fix
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::LoginFailed(_)
                | ClientError::Config(_)
                | ClientError::Auth(_)
                | ClientError::Bind { .. }
        )
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
