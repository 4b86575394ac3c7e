//! Visitor routing
//!
//! Secret proxies register a named internal listener. Visitor connections
//! name the proxy they want, prove knowledge of its secret, and are queued on
//! that listener, wrapped in the per-frame cipher when they ask for it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info};
use zap_auth::{auth_key, constant_time_eq};
use zap_proto::NewVisitorConn;
use zap_transport::{
    BoxedStream, Cipher, EncryptedStream, InternalListener, Reservation, ReserveError, VisitorConn,
};

#[derive(Debug, Error)]
pub enum VisitorError {
    #[error("custom listener for [{0}] is repeated")]
    DuplicateName(String),

    #[error("custom listener for [{0}] doesn't exist")]
    NotFound(String),

    #[error("visitor connection of [{0}] auth failed")]
    AuthFailed(String),

    #[error("visitor connection of [{name}] user [{user}] not allowed")]
    NotAllowed { name: String, user: String },

    #[error("listener for [{0}] is full")]
    QueueFull(String),

    #[error("listener for [{0}] is closed")]
    ListenerClosed(String),
}

/// A refused visitor connection, handed back so the caller can answer on it
pub struct RejectedConn {
    pub conn: BoxedStream,
    pub error: VisitorError,
}

impl std::fmt::Debug for RejectedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RejectedConn")
            .field("error", &self.error)
            .finish()
    }
}

struct ListenerBundle {
    listener: Arc<InternalListener<VisitorConn>>,
    sk: String,
    allow_users: Vec<String>,
}

/// A visitor request that passed the checks and holds a queue slot
#[derive(Debug)]
pub struct Admission {
    proxy_name: String,
    slot: Reservation<VisitorConn>,
    encryption_secret: Option<String>,
    use_compression: bool,
}

impl Admission {
    pub fn proxy_name(&self) -> &str {
        &self.proxy_name
    }

    /// Wrap the connection as requested and queue it in the reserved slot
    pub fn deliver(self, conn: BoxedStream) {
        let conn = match &self.encryption_secret {
            Some(sk) => VisitorConn::Encrypted(EncryptedStream::with_cipher(
                conn,
                Cipher::from_secret(sk),
            )),
            None => VisitorConn::Plain(conn),
        };
        if self.use_compression {
            debug!(proxy = %self.proxy_name, "compression requested, passing through uncompressed");
        }

        self.slot.put(conn);
    }
}

pub struct VisitorManager {
    listeners: RwLock<HashMap<String, ListenerBundle>>,
    backlog: usize,
}

impl Default for VisitorManager {
    fn default() -> Self {
        Self::with_backlog(zap_transport::listener::DEFAULT_BACKLOG)
    }
}

impl VisitorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listeners created by this manager queue at most `backlog` connections
    pub fn with_backlog(backlog: usize) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            backlog,
        }
    }

    /// Create the internal listener for a secret proxy
    pub fn listen(
        &self,
        name: &str,
        sk: &str,
        allow_users: Vec<String>,
    ) -> Result<Arc<InternalListener<VisitorConn>>, VisitorError> {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if listeners.contains_key(name) {
            return Err(VisitorError::DuplicateName(name.to_string()));
        }

        let listener = Arc::new(InternalListener::with_backlog(self.backlog));
        listeners.insert(
            name.to_string(),
            ListenerBundle {
                listener: listener.clone(),
                sk: sk.to_string(),
                allow_users,
            },
        );
        info!(proxy = %name, "visitor listener created");
        Ok(listener)
    }

    /// Validate a visitor request and reserve its place in the listener queue
    ///
    /// A full or closed queue is reported here, before the visitor is answered.
    pub fn check(&self, req: &NewVisitorConn, visitor_user: &str) -> Result<Admission, VisitorError> {
        let listeners = match self.listeners.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let name = &req.proxy_name;
        let bundle = listeners
            .get(name)
            .ok_or_else(|| VisitorError::NotFound(name.clone()))?;

        if !constant_time_eq(&auth_key(&bundle.sk, req.timestamp), &req.sign_key) {
            return Err(VisitorError::AuthFailed(name.clone()));
        }

        let allowed = bundle
            .allow_users
            .iter()
            .any(|u| u == visitor_user || u == "*");
        if !allowed {
            return Err(VisitorError::NotAllowed {
                name: name.clone(),
                user: visitor_user.to_string(),
            });
        }

        let slot = bundle.listener.reserve().map_err(|e| match e {
            ReserveError::Full => VisitorError::QueueFull(name.clone()),
            ReserveError::Closed => VisitorError::ListenerClosed(name.clone()),
        })?;

        Ok(Admission {
            proxy_name: name.clone(),
            slot,
            encryption_secret: req.use_encryption.then(|| bundle.sk.clone()),
            use_compression: req.use_compression,
        })
    }

    /// Check a visitor request and queue its connection
    pub fn new_conn(
        &self,
        conn: BoxedStream,
        req: &NewVisitorConn,
        visitor_user: &str,
    ) -> Result<(), RejectedConn> {
        match self.check(req, visitor_user) {
            Ok(admission) => {
                admission.deliver(conn);
                Ok(())
            }
            Err(error) => Err(RejectedConn { conn, error }),
        }
    }

    /// Remove a listener; connections already queued stay acceptable
    pub fn close_listener(&self, name: &str) {
        let removed = match self.listeners.write() {
            Ok(mut guard) => guard.remove(name),
            Err(poisoned) => poisoned.into_inner().remove(name),
        };
        if let Some(bundle) = removed {
            bundle.listener.close();
            info!(proxy = %name, "visitor listener closed");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match self.listeners.read() {
            Ok(guard) => guard.contains_key(name),
            Err(poisoned) => poisoned.into_inner().contains_key(name),
        }
    }
}
