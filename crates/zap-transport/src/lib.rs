//! Transport primitives for the zap relay
//!
//! Byte streams are handled as boxed `AsyncRead + AsyncWrite` objects so that
//! control, work and visitor connections share one type regardless of how
//! they were established.

pub mod connector;
pub mod crypto;
pub mod listener;

pub use connector::{Connector, TcpConnector};
pub use crypto::{Cipher, CryptoError, EncryptedStream};
pub use listener::{InternalListener, Reservation, ReserveError};

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream usable as a connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased connection
pub type BoxedStream = Box<dyn AsyncStream>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connect to {0} timed out")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A connection handed to a visitor listener, encrypted or not
pub enum VisitorConn {
    Plain(BoxedStream),
    Encrypted(EncryptedStream<BoxedStream>),
}

impl std::fmt::Debug for VisitorConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VisitorConn::Plain(_) => f.write_str("VisitorConn::Plain"),
            VisitorConn::Encrypted(_) => f.write_str("VisitorConn::Encrypted"),
        }
    }
}

impl VisitorConn {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, VisitorConn::Encrypted(_))
    }

    /// Relay bytes between this connection and `other` until both sides finish
    ///
    /// Returns bytes copied as (from self, to self) in plaintext terms.
    pub async fn join<T>(self, mut other: T) -> io::Result<(u64, u64)>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin,
    {
        match self {
            VisitorConn::Plain(mut conn) => tokio::io::copy_bidirectional(&mut conn, &mut other).await,
            VisitorConn::Encrypted(conn) => conn.join(other).await,
        }
    }
}
