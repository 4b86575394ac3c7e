//! Control session of one logged-in client
//!
//! A [`Control`] owns the client's control connection through a
//! [`Dispatcher`], answers NewProxy/Ping/CloseProxy, keeps the pool of work
//! connections the client dialed back, and watches the heartbeat. The session
//! ends when its connection closes, when the heartbeat times out, or when a
//! newer login under the same run id replaces it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use zap_auth::{AuthError, AuthVerifier};
use zap_proto::{
    CloseProxy, Login, LoginResp, Message, MessageKind, MsgCtl, NewProxy, NewProxyResp, Ping,
    Pong, ReqWorkConn, PROTOCOL_VERSION,
};
use zap_transport::BoxedStream;

use crate::config::{generate_response_error_string, ServerConfig};
use crate::dispatcher::{handler, Dispatcher, DispatcherError};
use crate::hook::{CloseProxyContent, HookError, HookManager, NewProxyContent, PingContent, UserInfo};
use crate::lock;
use crate::metrics::MetricsSink;
use crate::proxy::{ProxyError, ProxyRegistrar};

/// Interval of the heartbeat check
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("work connection pool is full")]
    PoolFull,

    #[error("control is closed")]
    Closed,

    #[error("timeout trying to get work connection")]
    Timeout,

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    PendingLogin,
    Active,
    Closing,
    Closed,
}

/// Shared collaborators every session of a server uses
#[derive(Clone)]
pub struct ControlContext {
    pub config: Arc<ServerConfig>,
    pub msg_ctl: Arc<MsgCtl>,
    pub verifier: Arc<dyn AuthVerifier>,
    pub hooks: Arc<HookManager>,
    pub proxies: Arc<dyn ProxyRegistrar>,
    pub metrics: Arc<dyn MetricsSink>,
}

enum Command {
    Replaced { by: String },
    Close,
}

#[derive(Default)]
struct WorkConnPool {
    conns: VecDeque<BoxedStream>,
    waiters: VecDeque<oneshot::Sender<BoxedStream>>,
    closed: bool,
}

struct ControlInner {
    ctx: ControlContext,
    run_id: Mutex<String>,
    login: Login,
    client_addr: String,
    dispatcher: Arc<Dispatcher>,
    pool: Mutex<WorkConnPool>,
    pool_capacity: usize,
    last_ping: Mutex<Instant>,
    state: Mutex<ControlState>,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    /// Proxy name to proxy type, for every proxy this session registered
    proxies: Mutex<HashMap<String, String>>,
    closed: CancellationToken,
}

/// Handle to a control session; clones share the session
#[derive(Clone)]
pub struct Control {
    inner: Arc<ControlInner>,
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("run_id", &self.run_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Control {
    /// Wrap a verified login's connection; nothing runs until [`Control::start`]
    pub fn new(
        ctx: ControlContext,
        conn: BoxedStream,
        login: Login,
        run_id: String,
        client_addr: String,
    ) -> Self {
        let pool_capacity = login.pool_count.min(ctx.config.transport.max_pool_count);
        let dispatcher = Dispatcher::new(conn, ctx.msg_ctl.clone());
        let (commands, command_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ControlInner {
                ctx,
                run_id: Mutex::new(run_id),
                login,
                client_addr,
                dispatcher,
                pool: Mutex::new(WorkConnPool::default()),
                pool_capacity,
                last_ping: Mutex::new(Instant::now()),
                state: Mutex::new(ControlState::PendingLogin),
                commands,
                command_rx: Mutex::new(Some(command_rx)),
                proxies: Mutex::new(HashMap::new()),
                closed: CancellationToken::new(),
            }),
        }
    }

    fn from_weak(weak: &Weak<ControlInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn ptr_eq(&self, other: &Control) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Empty once the session was replaced
    pub fn run_id(&self) -> String {
        lock(&self.inner.run_id).clone()
    }

    pub fn login(&self) -> &Login {
        &self.inner.login
    }

    pub fn client_addr(&self) -> &str {
        &self.inner.client_addr
    }

    pub fn msg_ctl(&self) -> &Arc<MsgCtl> {
        &self.inner.ctx.msg_ctl
    }

    pub fn state(&self) -> ControlState {
        *lock(&self.inner.state)
    }

    pub fn pool_capacity(&self) -> usize {
        self.inner.pool_capacity
    }

    pub fn pooled_conns(&self) -> usize {
        lock(&self.inner.pool).conns.len()
    }

    pub fn last_ping(&self) -> Instant {
        *lock(&self.inner.last_ping)
    }

    pub fn proxy_names(&self) -> Vec<String> {
        lock(&self.inner.proxies).keys().cloned().collect()
    }

    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            user: self.inner.login.user.clone(),
            metas: self.inner.login.metas.clone(),
            run_id: self.run_id(),
        }
    }

    /// Activate the session
    ///
    /// Sends the LoginResp, asks the client for its initial work connections
    /// and starts the session loop. Later calls do nothing.
    pub async fn start(&self) -> Result<(), ControlError> {
        let Some(command_rx) = lock(&self.inner.command_rx).take() else {
            return Ok(());
        };
        self.register_handlers()?;
        self.inner.dispatcher.run();
        *lock(&self.inner.state) = ControlState::Active;
        self.inner.ctx.metrics.new_client();

        let run_id = self.run_id();
        let span = info_span!("control", run_id = %run_id);
        let this = self.clone();
        tokio::spawn(this.run_loop(command_rx).instrument(span));

        self.inner
            .dispatcher
            .send(LoginResp {
                version: PROTOCOL_VERSION.to_string(),
                run_id: run_id.clone(),
                error: String::new(),
            })
            .await?;
        info!(run_id = %run_id, addr = %self.inner.client_addr, "client login");

        let dispatcher = self.inner.dispatcher.clone();
        let count = self.inner.pool_capacity;
        tokio::spawn(async move {
            for _ in 0..count {
                if dispatcher.send(ReqWorkConn {}).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn register_handlers(&self) -> Result<(), DispatcherError> {
        let weak = Arc::downgrade(&self.inner);
        let dispatcher = &self.inner.dispatcher;

        let w = weak.clone();
        dispatcher.register_handler(
            MessageKind::NewProxy,
            handler(move |msg| {
                let ctl = Control::from_weak(&w);
                async move {
                    if let (Some(ctl), Message::NewProxy(m)) = (ctl, msg) {
                        ctl.handle_new_proxy(m).await;
                    }
                }
            }),
        )?;

        let w = weak.clone();
        dispatcher.register_handler(
            MessageKind::Ping,
            handler(move |msg| {
                let ctl = Control::from_weak(&w);
                async move {
                    if let (Some(ctl), Message::Ping(m)) = (ctl, msg) {
                        ctl.handle_ping(m).await;
                    }
                }
            }),
        )?;

        let w = weak;
        dispatcher.register_handler(
            MessageKind::CloseProxy,
            handler(move |msg| {
                let ctl = Control::from_weak(&w);
                async move {
                    if let (Some(ctl), Message::CloseProxy(m)) = (ctl, msg) {
                        ctl.handle_close_proxy(m).await;
                    }
                }
            }),
        )
    }

    async fn run_loop(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let heartbeat_timeout = self.inner.ctx.config.heartbeat_timeout();
        let mut ticker = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.dispatcher.done() => break,
                Some(command) = commands.recv() => match command {
                    Command::Replaced { by } => {
                        lock(&self.inner.run_id).clear();
                        info!(by = %by, "replaced by a newer login");
                        self.inner.dispatcher.close();
                    }
                    Command::Close => self.inner.dispatcher.close(),
                },
                _ = ticker.tick(), if heartbeat_timeout.is_some() => {
                    let timeout = heartbeat_timeout.unwrap_or_default();
                    if self.last_ping().elapsed() > timeout {
                        warn!("heartbeat timeout");
                        self.inner.dispatcher.close();
                    }
                }
            }
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        *lock(&self.inner.state) = ControlState::Closing;

        {
            let mut pool = lock(&self.inner.pool);
            pool.closed = true;
            pool.conns.clear();
            pool.waiters.clear();
        }

        let names = self.proxy_names();
        for name in names {
            self.close_proxy(&name).await;
        }

        self.inner.ctx.metrics.close_client();
        *lock(&self.inner.state) = ControlState::Closed;
        self.inner.closed.cancel();
        info!("client exit success");
    }

    /// Offer a work connection dialed back by the client
    ///
    /// Hands it to a waiting taker first, pools it otherwise. Never blocks; a
    /// connection that does not fit is dropped and `PoolFull` returned.
    pub fn register_work_conn(&self, conn: BoxedStream) -> Result<(), ControlError> {
        let mut pool = lock(&self.inner.pool);
        if pool.closed {
            return Err(ControlError::Closed);
        }

        let mut conn = conn;
        while let Some(waiter) = pool.waiters.pop_front() {
            match waiter.send(conn) {
                Ok(()) => return Ok(()),
                Err(returned) => conn = returned,
            }
        }

        if pool.conns.len() < self.inner.pool_capacity {
            pool.conns.push_back(conn);
            Ok(())
        } else {
            debug!("work connection pool is full, discarding");
            Err(ControlError::PoolFull)
        }
    }

    /// Take a work connection for one user connection
    ///
    /// Waits up to the configured user connection timeout when the pool is
    /// empty. Every successful take asks the client for a replacement.
    pub async fn get_work_conn(&self) -> Result<BoxedStream, ControlError> {
        let pending = {
            let mut pool = lock(&self.inner.pool);
            if pool.closed {
                return Err(ControlError::Closed);
            }
            match pool.conns.pop_front() {
                Some(conn) => Ok(conn),
                None => {
                    // Takers that timed out leave closed senders behind
                    pool.waiters.retain(|w| !w.is_closed());
                    let (tx, rx) = oneshot::channel();
                    pool.waiters.push_back(tx);
                    Err(rx)
                }
            }
        };

        let conn = match pending {
            Ok(conn) => conn,
            Err(rx) => {
                self.inner
                    .dispatcher
                    .send(ReqWorkConn {})
                    .await
                    .map_err(|_| ControlError::Closed)?;
                match tokio::time::timeout(self.inner.ctx.config.user_conn_timeout(), rx).await {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(_)) => return Err(ControlError::Closed),
                    Err(_) => {
                        warn!(run_id = %self.run_id(), "timeout trying to get work connection");
                        return Err(ControlError::Timeout);
                    }
                }
            }
        };

        if let Err(e) = self.inner.dispatcher.send(ReqWorkConn {}).await {
            debug!("request replacement work connection: {}", e);
        }
        Ok(conn)
    }

    async fn handle_new_proxy(&self, msg: NewProxy) {
        let name = msg.proxy_name.clone();
        let resp = match self.register_proxy(msg).await {
            Ok(remote_addr) => {
                info!(proxy = %name, remote_addr = %remote_addr, "new proxy success");
                NewProxyResp {
                    proxy_name: name,
                    remote_addr,
                    error: String::new(),
                }
            }
            Err(e) => {
                warn!(proxy = %name, "new proxy error: {}", e);
                NewProxyResp {
                    error: generate_response_error_string(
                        &format!("new proxy [{}] error", name),
                        &e,
                        self.inner.ctx.config.detailed_errors_to_client,
                    ),
                    proxy_name: name,
                    remote_addr: String::new(),
                }
            }
        };
        if let Err(e) = self.inner.dispatcher.send(resp).await {
            debug!("send NewProxyResp: {}", e);
        }
    }

    async fn register_proxy(&self, msg: NewProxy) -> Result<String, ControlError> {
        let content = self
            .inner
            .ctx
            .hooks
            .new_proxy(NewProxyContent {
                user: self.user_info(),
                new_proxy: msg,
            })
            .await?;
        let msg = content.new_proxy;

        let remote_addr = self.inner.ctx.proxies.register_proxy(self, &msg).await?;
        lock(&self.inner.proxies).insert(msg.proxy_name.clone(), msg.proxy_type.clone());
        self.inner
            .ctx
            .metrics
            .new_proxy(&msg.proxy_name, &msg.proxy_type);
        Ok(remote_addr)
    }

    async fn handle_ping(&self, ping: Ping) {
        let pong = match self.verify_ping(ping).await {
            Ok(()) => {
                *lock(&self.inner.last_ping) = Instant::now();
                debug!("receive heartbeat");
                Pong::default()
            }
            Err(e) => {
                warn!("received invalid ping: {}", e);
                Pong {
                    error: generate_response_error_string(
                        "invalid ping",
                        &e,
                        self.inner.ctx.config.detailed_errors_to_client,
                    ),
                }
            }
        };
        if let Err(e) = self.inner.dispatcher.send(pong).await {
            debug!("send Pong: {}", e);
        }
    }

    async fn verify_ping(&self, ping: Ping) -> Result<(), ControlError> {
        let content = self
            .inner
            .ctx
            .hooks
            .ping(PingContent {
                user: self.user_info(),
                ping,
            })
            .await?;
        self.inner.ctx.verifier.verify_ping(&content.ping)?;
        Ok(())
    }

    async fn handle_close_proxy(&self, msg: CloseProxy) {
        self.close_proxy(&msg.proxy_name).await;
    }

    /// Close one proxy this session registered; unknown names are ignored
    pub async fn close_proxy(&self, name: &str) {
        let Some(proxy_type) = lock(&self.inner.proxies).remove(name) else {
            debug!(proxy = %name, "close of unknown proxy ignored");
            return;
        };

        let content = CloseProxyContent {
            user: self.user_info(),
            close_proxy: CloseProxy {
                proxy_name: name.to_string(),
            },
        };
        if let Err(e) = self.inner.ctx.hooks.close_proxy(content).await {
            warn!(proxy = %name, "close proxy hook: {}", e);
        }

        self.inner.ctx.proxies.close_proxy(name).await;
        self.inner.ctx.metrics.close_proxy(name, &proxy_type);
        info!(proxy = %name, "close proxy");
    }

    /// Tell the session a newer login took over its run id
    pub fn replaced(&self, by: &Control) {
        let _ = self.inner.commands.send(Command::Replaced { by: by.run_id() });
    }

    /// Close the control connection; teardown follows asynchronously
    pub fn close(&self) {
        let _ = self.inner.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once teardown has finished
    pub async fn wait_closed(&self) {
        self.inner.closed.cancelled().await
    }
}
