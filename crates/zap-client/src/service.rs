//! Client session management
//!
//! One control connection per session. The session logs in, registers every
//! configured proxy, keeps the heartbeat going and answers ReqWorkConn by
//! dialing a new work connection. [`Service::run`] reconnects with
//! exponential backoff until shut down or until the server refuses the login.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use zap_auth::{new_auth_setter, AuthSetter};
use zap_control::{async_handler, handler, Dispatcher, TaskTracker};
use zap_proto::{
    Login, Message, MessageKind, MsgCtl, NewProxyResp, NewWorkConn, Ping, Pong, PROTOCOL_VERSION,
};
use zap_transport::{BoxedStream, Connector, TcpConnector};

use crate::config::ClientConfig;
use crate::visitor::Visitor;
use crate::{lock, ClientError};

/// Deadline for the server's LoginResp
pub const LOGIN_RESP_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the heartbeat timeout is checked
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Registration state of one proxy in the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyStatus {
    Pending,
    Running { remote_addr: String },
    Failed(String),
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthSetter>,
    msg_ctl: Arc<MsgCtl>,
    run_id: Arc<Mutex<String>>,
    statuses: Mutex<HashMap<String, ProxyStatus>>,
    visitor_addrs: Mutex<HashMap<String, SocketAddr>>,
    visitor_tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// The zap client
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    /// Dial the configured server address over TCP
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let connector = TcpConnector::new(config.server_address())
            .with_dial_timeout(config.transport.dial_timeout());
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(
        mut config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        config.complete()?;
        let auth = new_auth_setter(&config.auth)?;
        let msg_ctl = MsgCtl::standard()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                auth,
                msg_ctl: Arc::new(msg_ctl),
                run_id: Arc::new(Mutex::new(String::new())),
                statuses: Mutex::new(HashMap::new()),
                visitor_addrs: Mutex::new(HashMap::new()),
                visitor_tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Run id assigned by the server, empty before the first login
    pub fn run_id(&self) -> String {
        lock(&self.inner.run_id).clone()
    }

    pub fn proxy_status(&self, name: &str) -> Option<ProxyStatus> {
        lock(&self.inner.statuses).get(name).cloned()
    }

    /// Local address of a started visitor
    pub fn visitor_addr(&self, name: &str) -> Option<SocketAddr> {
        lock(&self.inner.visitor_addrs).get(name).copied()
    }

    /// Bind every configured visitor port; visitors already started are skipped
    pub async fn start_visitors(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        for config in &inner.config.visitors {
            if lock(&inner.visitor_addrs).contains_key(&config.name) {
                continue;
            }
            let visitor = Arc::new(Visitor::new(
                config.clone(),
                inner.connector.clone(),
                inner.msg_ctl.clone(),
                inner.run_id.clone(),
            ));
            let listener = visitor.bind().await?;
            let addr = listener.local_addr()?;
            lock(&inner.visitor_addrs).insert(config.name.clone(), addr);

            let handle = tokio::spawn(visitor.serve(listener, inner.shutdown.clone()));
            inner.visitor_tasks.register(config.name.clone(), handle);
        }
        Ok(())
    }

    /// Keep a session up until [`Service::close`] or a non-recoverable error
    pub async fn run(&self) -> Result<(), ClientError> {
        self.start_visitors().await?;

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Ok(());
            }
            attempt += 1;
            info!(server = %self.inner.config.server_address(), attempt, "connecting to server");

            match self.inner.clone().run_session().await {
                Ok(()) => {
                    attempt = 0;
                    backoff = INITIAL_BACKOFF;
                    if self.inner.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    warn!("session ended, reconnecting in {}s", backoff.as_secs());
                }
                Err(e) if e.is_non_recoverable() => {
                    error!("session failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("session error: {}, reconnecting in {}s", e, backoff.as_secs());
                }
            }

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            if attempt > 0 {
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    /// End the current session and stop reconnecting
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.visitor_tasks.abort_all();
    }
}

impl Inner {
    fn login_message(&self) -> Login {
        Login {
            version: PROTOCOL_VERSION.to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: self.config.user.clone(),
            run_id: lock(&self.run_id).clone(),
            metas: self.config.metas.clone(),
            pool_count: self.config.transport.pool_count,
            ..Default::default()
        }
    }

    /// Log in and serve one session; `Ok` means an established session ended
    async fn run_session(self: Arc<Self>) -> Result<(), ClientError> {
        let mut conn = self.connector.connect().await?;

        let mut login = self.login_message();
        self.auth.set_login(&mut login)?;
        self.msg_ctl.write_msg(&mut conn, &login.into()).await?;

        let resp = tokio::time::timeout(LOGIN_RESP_TIMEOUT, self.msg_ctl.read_msg(&mut conn))
            .await
            .map_err(|_| ClientError::Timeout("waiting for LoginResp".to_string()))??;
        let resp = match resp {
            Message::LoginResp(resp) => resp,
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected LoginResp, got {}",
                    other.kind()
                )))
            }
        };
        if !resp.error.is_empty() {
            return Err(ClientError::LoginFailed(resp.error));
        }
        *lock(&self.run_id) = resp.run_id.clone();

        let span = tracing::info_span!("session", run_id = %resp.run_id);
        self.serve_session(conn).instrument(span).await
    }

    async fn serve_session(
        self: Arc<Self>,
        conn: BoxedStream,
    ) -> Result<(), ClientError> {
        info!("login to server success");

        let dispatcher = Dispatcher::new(conn, self.msg_ctl.clone());
        let last_pong = Arc::new(Mutex::new(Instant::now()));
        self.register_handlers(&dispatcher, &last_pong)?;
        dispatcher.run();

        {
            let mut statuses = lock(&self.statuses);
            statuses.clear();
            for proxy in &self.config.proxies {
                statuses.insert(proxy.name.clone(), ProxyStatus::Pending);
            }
        }
        for proxy in &self.config.proxies {
            dispatcher.send(proxy.to_new_proxy()).await?;
        }

        let transport = &self.config.transport;
        let ping_interval = transport.heartbeat_interval();
        let heartbeat_timeout = transport.heartbeat_timeout();
        let period = ping_interval.unwrap_or(HEARTBEAT_CHECK_INTERVAL);
        let mut ping_ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut check_ticker = tokio::time::interval_at(
            Instant::now() + HEARTBEAT_CHECK_INTERVAL,
            HEARTBEAT_CHECK_INTERVAL,
        );

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = dispatcher.done() => {
                    warn!("control connection closed");
                    break Ok(());
                }
                _ = ping_ticker.tick(), if ping_interval.is_some() => {
                    let mut ping = Ping::default();
                    if let Err(e) = self.auth.set_ping(&mut ping) {
                        break Err(ClientError::from(e));
                    }
                    debug!("send heartbeat to server");
                    if dispatcher.send(ping).await.is_err() {
                        break Ok(());
                    }
                }
                _ = check_ticker.tick(), if heartbeat_timeout.is_some() => {
                    let elapsed = lock(&last_pong).elapsed();
                    if heartbeat_timeout.is_some_and(|timeout| elapsed > timeout) {
                        warn!("heartbeat timeout after {:?}", elapsed);
                        break Ok(());
                    }
                }
            }
        };

        dispatcher.close();
        result
    }

    fn register_handlers(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        last_pong: &Arc<Mutex<Instant>>,
    ) -> Result<(), ClientError> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        dispatcher.register_handler(
            MessageKind::ReqWorkConn,
            async_handler(handler(move |_msg| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_req_work_conn().in_current_span().await;
                    }
                }
            })),
        )?;

        let weak: Weak<Inner> = Arc::downgrade(self);
        dispatcher.register_handler(
            MessageKind::NewProxyResp,
            handler(move |msg| {
                let weak = weak.clone();
                async move {
                    if let (Some(inner), Message::NewProxyResp(resp)) = (weak.upgrade(), msg) {
                        inner.handle_new_proxy_resp(resp);
                    }
                }
            }),
        )?;

        let last_pong = last_pong.clone();
        let dispatcher_ref: Weak<Dispatcher> = Arc::downgrade(dispatcher);
        dispatcher.register_handler(
            MessageKind::Pong,
            handler(move |msg| {
                let last_pong = last_pong.clone();
                let dispatcher_ref = dispatcher_ref.clone();
                async move {
                    if let Message::Pong(pong) = msg {
                        handle_pong(pong, &last_pong, &dispatcher_ref);
                    }
                }
            }),
        )?;
        Ok(())
    }

    fn handle_new_proxy_resp(&self, resp: NewProxyResp) {
        let status = if resp.error.is_empty() {
            info!(proxy = %resp.proxy_name, remote_addr = %resp.remote_addr, "start proxy success");
            ProxyStatus::Running {
                remote_addr: resp.remote_addr,
            }
        } else {
            warn!(proxy = %resp.proxy_name, "start proxy error: {}", resp.error);
            ProxyStatus::Failed(resp.error)
        };
        lock(&self.statuses).insert(resp.proxy_name, status);
    }

    async fn handle_req_work_conn(&self) {
        if let Err(e) = self.new_work_conn().await {
            warn!("work connection error: {}", e);
        }
    }

    async fn new_work_conn(&self) -> Result<(), ClientError> {
        let mut conn = self.connector.connect().await?;
        let mut msg = NewWorkConn {
            run_id: lock(&self.run_id).clone(),
            ..Default::default()
        };
        self.auth.set_new_work_conn(&mut msg)?;
        self.msg_ctl.write_msg(&mut conn, &msg.into()).await?;

        // Blocks until the server hands this connection to a user
        let start = match self.msg_ctl.read_msg(&mut conn).await? {
            Message::StartWorkConn(start) => start,
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected StartWorkConn, got {}",
                    other.kind()
                )))
            }
        };
        if !start.error.is_empty() {
            return Err(ClientError::Rejected(start.error));
        }

        let proxy = self
            .config
            .proxies
            .iter()
            .find(|p| p.name == start.proxy_name)
            .ok_or_else(|| {
                ClientError::Protocol(format!("unknown proxy [{}]", start.proxy_name))
            })?;

        let mut local = TcpStream::connect(proxy.local_addr()).await?;
        debug!(
            proxy = %proxy.name,
            src = %format!("{}:{}", start.src_addr, start.src_port),
            "join work connection with local service"
        );
        match tokio::io::copy_bidirectional(&mut conn, &mut local).await {
            Ok((up, down)) => debug!(proxy = %proxy.name, up, down, "work connection closed"),
            Err(e) => debug!(proxy = %proxy.name, "work connection ended: {}", e),
        }
        Ok(())
    }
}

fn handle_pong(pong: Pong, last_pong: &Mutex<Instant>, dispatcher: &Weak<Dispatcher>) {
    if !pong.error.is_empty() {
        error!("pong error: {}", pong.error);
        if let Some(dispatcher) = dispatcher.upgrade() {
            dispatcher.close();
        }
        return;
    }
    *lock(last_pong) = Instant::now();
    debug!("receive heartbeat from server");
}
