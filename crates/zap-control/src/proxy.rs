//! Proxy registration
//!
//! Turns a client's NewProxy into something that accepts user traffic: a
//! public TCP listener for `tcp` proxies, an internal visitor listener for
//! `stcp` proxies. Every accepted connection is paired with a work connection
//! from the owning control session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn, Instrument};
use zap_proto::{Message, NewProxy, StartWorkConn};
use zap_transport::{BoxedStream, InternalListener, VisitorConn};

use crate::config::ServerConfig;
use crate::control::{Control, ControlError};
use crate::hook::{HookManager, NewUserConnContent};
use crate::lock;
use crate::task_tracker::TaskTracker;
use crate::visitor::{VisitorError, VisitorManager};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy [{0}] already exists")]
    NameInUse(String),

    #[error("proxy type [{0}] is not supported")]
    UnsupportedType(String),

    #[error("bind {addr} error: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Visitor(#[from] VisitorError),
}

/// Registers and tears down proxies on behalf of control sessions
#[async_trait]
pub trait ProxyRegistrar: Send + Sync {
    /// Start serving the proxy and return its public remote address
    async fn register_proxy(&self, ctl: &Control, msg: &NewProxy) -> Result<String, ProxyError>;

    async fn close_proxy(&self, name: &str);

    async fn close_all(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyKind {
    Tcp,
    Stcp,
}

impl ProxyKind {
    fn parse(proxy_type: &str) -> Option<Self> {
        match proxy_type {
            "tcp" => Some(ProxyKind::Tcp),
            "stcp" => Some(ProxyKind::Stcp),
            _ => None,
        }
    }
}

/// Default registrar serving `tcp` and `stcp` proxies
pub struct ProxyManager {
    config: Arc<ServerConfig>,
    visitors: Arc<VisitorManager>,
    hooks: Arc<HookManager>,
    proxies: Mutex<HashMap<String, ProxyKind>>,
    tasks: TaskTracker,
}

impl ProxyManager {
    pub fn new(
        config: Arc<ServerConfig>,
        visitors: Arc<VisitorManager>,
        hooks: Arc<HookManager>,
    ) -> Self {
        Self {
            config,
            visitors,
            hooks,
            proxies: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.proxies).contains_key(name)
    }

    pub fn len(&self) -> usize {
        lock(&self.proxies).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bind_host(&self) -> &str {
        if self.config.proxy_bind_addr.is_empty() {
            &self.config.bind_addr
        } else {
            &self.config.proxy_bind_addr
        }
    }

    async fn start_tcp(&self, ctl: &Control, msg: &NewProxy) -> Result<String, ProxyError> {
        let addr = format!("{}:{}", self.bind_host(), msg.remote_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { addr, source })?
            .port();

        let name = msg.proxy_name.clone();
        let ctl = ctl.clone();
        let hooks = self.hooks.clone();
        let span = tracing::info_span!("proxy", proxy = %name);
        let handle = tokio::spawn(
            async move {
                info!(port, "tcp proxy listening");
                loop {
                    match listener.accept().await {
                        Ok((conn, peer)) => {
                            let ctl = ctl.clone();
                            let hooks = hooks.clone();
                            let name = name.clone();
                            tokio::spawn(
                                async move {
                                    serve_tcp_conn(ctl, hooks, name, conn, peer, port).await;
                                }
                                .in_current_span(),
                            );
                        }
                        Err(e) => {
                            warn!("accept user connection error: {}", e);
                            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        }
                    }
                }
            }
            .instrument(span),
        );
        self.tasks.register(msg.proxy_name.clone(), handle);
        Ok(format!(":{}", port))
    }

    fn start_stcp(&self, ctl: &Control, msg: &NewProxy) -> Result<String, ProxyError> {
        let allow_users = if msg.allow_users.is_empty() {
            vec![ctl.login().user.clone()]
        } else {
            msg.allow_users.clone()
        };
        let listener = self
            .visitors
            .listen(&msg.proxy_name, &msg.sk, allow_users)?;

        let name = msg.proxy_name.clone();
        let ctl = ctl.clone();
        let span = tracing::info_span!("proxy", proxy = %name);
        let handle = tokio::spawn(serve_visitors(ctl, name, listener).instrument(span));
        self.tasks.register(msg.proxy_name.clone(), handle);
        Ok(String::new())
    }

    fn stop(&self, name: &str, kind: ProxyKind) {
        self.tasks.unregister(name);
        if kind == ProxyKind::Stcp {
            self.visitors.close_listener(name);
        }
    }
}

#[async_trait]
impl ProxyRegistrar for ProxyManager {
    async fn register_proxy(&self, ctl: &Control, msg: &NewProxy) -> Result<String, ProxyError> {
        let kind = ProxyKind::parse(&msg.proxy_type)
            .ok_or_else(|| ProxyError::UnsupportedType(msg.proxy_type.clone()))?;

        {
            let mut proxies = lock(&self.proxies);
            if proxies.contains_key(&msg.proxy_name) {
                return Err(ProxyError::NameInUse(msg.proxy_name.clone()));
            }
            proxies.insert(msg.proxy_name.clone(), kind);
        }

        let result = match kind {
            ProxyKind::Tcp => self.start_tcp(ctl, msg).await,
            ProxyKind::Stcp => self.start_stcp(ctl, msg),
        };
        if result.is_err() {
            lock(&self.proxies).remove(&msg.proxy_name);
        }
        result
    }

    async fn close_proxy(&self, name: &str) {
        let removed = lock(&self.proxies).remove(name);
        if let Some(kind) = removed {
            self.stop(name, kind);
        }
    }

    async fn close_all(&self) {
        let drained: Vec<(String, ProxyKind)> = lock(&self.proxies).drain().collect();
        for (name, kind) in drained {
            self.stop(&name, kind);
        }
    }
}

/// Take a work connection and announce the user connection on it
///
/// Pooled connections may have gone stale, so a failed announcement is
/// retried with another one.
async fn open_work_conn(ctl: &Control, start: &StartWorkConn) -> Result<BoxedStream, ControlError> {
    let msg: Message = start.clone().into();
    for _ in 0..=ctl.pool_capacity() {
        let mut conn = ctl.get_work_conn().await?;
        match ctl.msg_ctl().write_msg(&mut conn, &msg).await {
            Ok(()) => return Ok(conn),
            Err(e) => debug!("write StartWorkConn to work connection failed: {}", e),
        }
    }
    Err(ControlError::Closed)
}

async fn serve_tcp_conn(
    ctl: Control,
    hooks: Arc<HookManager>,
    name: String,
    mut user: TcpStream,
    peer: SocketAddr,
    port: u16,
) {
    let content = NewUserConnContent {
        user: ctl.user_info(),
        proxy_name: name.clone(),
        proxy_type: "tcp".to_string(),
        remote_addr: peer.to_string(),
    };
    if let Err(e) = hooks.new_user_conn(content).await {
        warn!(peer = %peer, "user connection rejected: {}", e);
        return;
    }

    let start = StartWorkConn {
        proxy_name: name,
        src_addr: peer.ip().to_string(),
        src_port: peer.port(),
        dst_port: port,
        ..Default::default()
    };
    let mut work = match open_work_conn(&ctl, &start).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(peer = %peer, "get work connection error: {}", e);
            return;
        }
    };
    debug!(peer = %peer, "join user connection with work connection");
    join(&mut user, &mut work).await;
}

async fn join<A, B>(a: &mut A, b: &mut B)
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match tokio::io::copy_bidirectional(a, b).await {
        Ok((up, down)) => debug!(up, down, "connection closed"),
        Err(e) => debug!("relay ended: {}", e),
    }
}

async fn serve_visitors(ctl: Control, name: String, listener: Arc<InternalListener<VisitorConn>>) {
    info!("stcp proxy waiting for visitors");
    while let Some(vconn) = listener.accept().await {
        let ctl = ctl.clone();
        let start = StartWorkConn {
            proxy_name: name.clone(),
            ..Default::default()
        };
        tokio::spawn(
            async move {
                let work = match open_work_conn(&ctl, &start).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("get work connection for visitor error: {}", e);
                        return;
                    }
                };
                match vconn.join(work).await {
                    Ok((up, down)) => debug!(up, down, "visitor connection closed"),
                    Err(e) => debug!("visitor relay ended: {}", e),
                }
            }
            .in_current_span(),
        );
    }
    debug!("visitor listener closed");
}
