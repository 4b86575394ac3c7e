//! Local visitor ports
//!
//! Each visitor listens on a local address. Every connection accepted there
//! is carried to the server on a fresh connection that opens with
//! NewVisitorConn, signed with the shared secret of the target proxy.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use zap_auth::auth_key;
use zap_proto::{Message, MsgCtl, NewVisitorConn};
use zap_transport::{Cipher, Connector, EncryptedStream};

use crate::config::VisitorConfig;
use crate::{lock, ClientError};

/// Deadline for the server's answer to NewVisitorConn
pub const VISITOR_RESP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Visitor {
    config: VisitorConfig,
    connector: Arc<dyn Connector>,
    msg_ctl: Arc<MsgCtl>,
    run_id: Arc<Mutex<String>>,
}

impl Visitor {
    /// `run_id` is read per connection so the visitor follows reconnects
    pub fn new(
        config: VisitorConfig,
        connector: Arc<dyn Connector>,
        msg_ctl: Arc<MsgCtl>,
        run_id: Arc<Mutex<String>>,
    ) -> Self {
        Self {
            config,
            connector,
            msg_ctl,
            run_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn bind(&self) -> Result<TcpListener, ClientError> {
        let addr = self.config.bind_address();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ClientError::Bind { addr, source })
    }

    /// Accept local connections until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        let span = tracing::info_span!("visitor", name = %self.config.name);
        async move {
            info!(addr = ?listener.local_addr().ok(), server_name = %self.config.server_name, "visitor listening");
            loop {
                let (local, peer) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept error: {}", e);
                            continue;
                        }
                    },
                };
                let this = self.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = this.handle_conn(local, peer).await {
                            warn!(peer = %peer, "visitor connection error: {}", e);
                        }
                    }
                    .in_current_span(),
                );
            }
            debug!("visitor stopped");
        }
        .instrument(span)
        .await
    }

    async fn handle_conn(&self, mut local: TcpStream, peer: SocketAddr) -> Result<(), ClientError> {
        let mut conn = self.connector.connect().await?;

        let timestamp = chrono::Utc::now().timestamp();
        let msg = NewVisitorConn {
            run_id: lock(&self.run_id).clone(),
            proxy_name: self.config.server_name.clone(),
            sign_key: auth_key(&self.config.sk, timestamp),
            timestamp,
            use_encryption: self.config.use_encryption,
            use_compression: self.config.use_compression,
        };
        self.msg_ctl.write_msg(&mut conn, &msg.into()).await?;

        let resp = tokio::time::timeout(VISITOR_RESP_TIMEOUT, self.msg_ctl.read_msg(&mut conn))
            .await
            .map_err(|_| ClientError::Timeout("waiting for NewVisitorConnResp".to_string()))??;
        match resp {
            Message::NewVisitorConnResp(resp) if resp.error.is_empty() => {}
            Message::NewVisitorConnResp(resp) => return Err(ClientError::Rejected(resp.error)),
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected NewVisitorConnResp, got {}",
                    other.kind()
                )))
            }
        }

        debug!(peer = %peer, "visitor connection established");
        let (up, down) = if self.config.use_encryption {
            EncryptedStream::with_cipher(conn, Cipher::from_secret(&self.config.sk))
                .join(local)
                .await?
        } else {
            tokio::io::copy_bidirectional(&mut conn, &mut local).await?
        };
        debug!(peer = %peer, up, down, "visitor connection closed");
        Ok(())
    }
}
