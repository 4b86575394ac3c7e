//! Outbound connection factory

use crate::{BoxedStream, TransportError, TransportResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Opens new connections to the server
///
/// The client dials its control connection and every work connection
/// through one of these.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> TransportResult<BoxedStream>;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    dial_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> TransportResult<BoxedStream> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout(self.addr.clone()))?
            .map_err(|e| {
                TransportError::ConnectionError(format!("TCP connect to {} failed: {}", self.addr, e))
            })?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "connected");
        Ok(Box::new(stream))
    }
}
