//! Connection acceptor
//!
//! Every inbound connection must open with Login, NewWorkConn or
//! NewVisitorConn. The first message decides whether the connection becomes a
//! control session, joins a session's work connection pool, or is routed to a
//! visitor listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zap_auth::{new_auth_verifier, AuthError};
use zap_proto::{
    CodecError, Login, LoginResp, Message, MessageKind, MsgCtl, NewVisitorConn,
    NewVisitorConnResp, NewWorkConn, StartWorkConn, PROTOCOL_VERSION,
};
use zap_transport::BoxedStream;

use crate::config::{generate_response_error_string, ServerConfig};
use crate::control::{Control, ControlContext, ControlError};
use crate::hook::{HookError, HookManager, HttpPlugin, LoginContent, NewWorkConnContent, Plugin};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::proxy::{ProxyManager, ProxyRegistrar};
use crate::registry::ControlManager;
use crate::visitor::{Admission, VisitorError, VisitorManager};

/// Deadline for the first message on a new connection
pub const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("bind {addr} error: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Visitor(#[from] VisitorError),

    #[error("no client control found for run id [{0}]")]
    ControlNotFound(String),

    #[error("unexpected first message {0}")]
    UnexpectedMessage(MessageKind),
}

struct Shared {
    ctx: ControlContext,
    proxies: Arc<ProxyManager>,
    controls: Arc<ControlManager>,
    visitors: Arc<VisitorManager>,
}

/// The relay server
pub struct Service {
    shared: Arc<Shared>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl Service {
    /// Bind the control port with plugins from the configuration and no metrics
    pub async fn new(config: ServerConfig) -> Result<Self, ServiceError> {
        Self::with_components(config, Arc::new(NoopMetrics), Vec::new()).await
    }

    /// Like [`Service::new`], with a metrics sink and plugins registered after
    /// the configured HTTP plugins
    pub async fn with_components(
        mut config: ServerConfig,
        metrics: Arc<dyn MetricsSink>,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Self, ServiceError> {
        config.complete()?;

        let msg_ctl = MsgCtl::standard()?.with_max_msg_length(config.transport.max_message_length);
        let verifier = new_auth_verifier(&config.auth)?;

        let mut hooks = HookManager::new();
        for plugin_config in &config.http_plugins {
            info!(plugin = %plugin_config.name, addr = %plugin_config.addr, "register http plugin");
            hooks.register(Arc::new(HttpPlugin::new(plugin_config)));
        }
        for plugin in plugins {
            hooks.register(plugin);
        }

        let addr = config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServiceError::Bind { addr, source })?;

        let config = Arc::new(config);
        let hooks = Arc::new(hooks);
        let visitors = Arc::new(VisitorManager::with_backlog(config.transport.visitor_backlog));
        let proxies = Arc::new(ProxyManager::new(
            config.clone(),
            visitors.clone(),
            hooks.clone(),
        ));
        let ctx = ControlContext {
            config,
            msg_ctl: Arc::new(msg_ctl),
            verifier,
            hooks,
            proxies: proxies.clone(),
            metrics,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                ctx,
                proxies,
                controls: Arc::new(ControlManager::new()),
                visitors,
            }),
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn controls(&self) -> &Arc<ControlManager> {
        &self.shared.controls
    }

    pub fn visitors(&self) -> &Arc<VisitorManager> {
        &self.shared.visitors
    }

    /// Accept connections until [`Service::close`] is called
    pub async fn run(&self) {
        info!(addr = ?self.local_addr().ok(), "zap server listening");
        loop {
            let (conn, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("accept connection error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            let shared = self.shared.clone();
            tokio::spawn(async move { shared.handle_connection(conn, peer).await });
        }
        info!("zap server stopped accepting");
    }

    /// Stop accepting and close every session and proxy
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.shared.controls.close().await;
        self.shared.proxies.close_all().await;
    }
}

impl Shared {
    fn detailed(&self) -> bool {
        self.ctx.config.detailed_errors_to_client
    }

    async fn handle_connection(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        if let Err(e) = conn.set_nodelay(true) {
            debug!("set nodelay: {}", e);
        }
        let mut conn: BoxedStream = Box::new(conn);

        let first = match tokio::time::timeout(
            FIRST_MESSAGE_TIMEOUT,
            self.ctx.msg_ctl.read_msg(&mut conn),
        )
        .await
        {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                debug!(peer = %peer, "read first message error: {}", e);
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "timeout reading first message");
                return;
            }
        };

        match first {
            Message::Login(login) => self.handle_login(conn, login, peer).await,
            Message::NewWorkConn(msg) => self.handle_work_conn(conn, msg).await,
            Message::NewVisitorConn(msg) => self.handle_visitor_conn(conn, msg).await,
            other => {
                warn!(
                    peer = %peer,
                    "{}",
                    ServiceError::UnexpectedMessage(other.kind())
                );
            }
        }
    }

    /// Verify a Login and start its control session
    ///
    /// A login reusing a live run id replaces that session. The new session
    /// answers only after the old one has fully torn down, so the proxy names
    /// and ports it held are free again when the client re-registers them.
    async fn handle_login(&self, mut conn: BoxedStream, login: Login, peer: SocketAddr) {
        info!(
            peer = %peer,
            version = %login.version,
            hostname = %login.hostname,
            os = %login.os,
            arch = %login.arch,
            "client login info"
        );

        let login = match self.check_login(login, peer).await {
            Ok(login) => login,
            Err(e) => {
                warn!(peer = %peer, "register control error: {}", e);
                let resp = LoginResp {
                    version: PROTOCOL_VERSION.to_string(),
                    run_id: String::new(),
                    error: generate_response_error_string(
                        "register control error",
                        &e,
                        self.detailed(),
                    ),
                };
                if let Err(e) = self.ctx.msg_ctl.write_msg(&mut conn, &resp.into()).await {
                    debug!("write LoginResp: {}", e);
                }
                return;
            }
        };

        let run_id = if login.run_id.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            login.run_id.clone()
        };

        let ctl = Control::new(self.ctx.clone(), conn, login, run_id.clone(), peer.to_string());
        if let Some(old) = self.controls.add(&run_id, ctl.clone()).await {
            old.wait_closed().await;
        }

        if let Err(e) = ctl.start().await {
            warn!(run_id = %run_id, "start control error: {}", e);
            ctl.close();
        }

        let controls = self.controls.clone();
        tokio::spawn(async move {
            ctl.wait_closed().await;
            if controls.del(&run_id, &ctl).await {
                debug!(run_id = %run_id, "control removed from registry");
            }
        });
    }

    async fn check_login(&self, login: Login, peer: SocketAddr) -> Result<Login, ServiceError> {
        let content = self
            .ctx
            .hooks
            .login(LoginContent {
                login,
                client_address: peer.to_string(),
            })
            .await?;
        self.ctx.verifier.verify_login(&content.login)?;
        Ok(content.login)
    }

    async fn handle_work_conn(&self, mut conn: BoxedStream, msg: NewWorkConn) {
        let Some(ctl) = self.controls.get_by_id(&msg.run_id).await else {
            warn!(run_id = %msg.run_id, "no client control found for work connection");
            return;
        };

        let checked = async {
            let content = self
                .ctx
                .hooks
                .new_work_conn(NewWorkConnContent {
                    user: ctl.user_info(),
                    new_work_conn: msg,
                })
                .await?;
            self.ctx
                .verifier
                .verify_new_work_conn(&content.new_work_conn)?;
            Ok::<(), ServiceError>(())
        }
        .await;

        if let Err(e) = checked {
            warn!(run_id = %ctl.run_id(), "invalid NewWorkConn: {}", e);
            let resp = StartWorkConn {
                error: generate_response_error_string("invalid NewWorkConn", &e, self.detailed()),
                ..Default::default()
            };
            if let Err(e) = self.ctx.msg_ctl.write_msg(&mut conn, &resp.into()).await {
                debug!("write StartWorkConn: {}", e);
            }
            return;
        }

        match ctl.register_work_conn(conn) {
            Ok(()) => debug!(run_id = %ctl.run_id(), "work connection registered"),
            Err(e) => debug!(run_id = %ctl.run_id(), "work connection dropped: {}", e),
        }
    }

    async fn admit_visitor(&self, msg: &NewVisitorConn) -> Result<Admission, ServiceError> {
        let visitor_user = if msg.run_id.is_empty() {
            String::new()
        } else {
            self.controls
                .get_by_id(&msg.run_id)
                .await
                .ok_or_else(|| ServiceError::ControlNotFound(msg.run_id.clone()))?
                .login()
                .user
                .clone()
        };
        Ok(self.visitors.check(msg, &visitor_user)?)
    }

    async fn handle_visitor_conn(&self, mut conn: BoxedStream, msg: NewVisitorConn) {
        let admitted = self.admit_visitor(&msg).await;
        let resp = NewVisitorConnResp {
            proxy_name: msg.proxy_name.clone(),
            error: match &admitted {
                Ok(_) => String::new(),
                Err(e) => {
                    warn!(proxy = %msg.proxy_name, "register visitor conn error: {}", e);
                    generate_response_error_string("register visitor conn error", e, self.detailed())
                }
            },
        };
        if let Err(e) = self.ctx.msg_ctl.write_msg(&mut conn, &resp.into()).await {
            debug!("write NewVisitorConnResp: {}", e);
            return;
        }

        if let Ok(admission) = admitted {
            admission.deliver(conn);
        }
    }
}
