//! Duplex message dispatcher
//!
//! Owns one connection. A read loop decodes frames and hands each message to
//! the handler registered for its kind; a send loop drains a bounded queue
//! onto the wire. The first read failure ends the dispatcher, after which
//! `send` fails with [`DispatcherError::Closed`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use zap_proto::{Message, MessageKind, MsgCtl};
use zap_transport::BoxedStream;

use crate::lock;

/// Capacity of the outbound queue
pub const SEND_QUEUE_CAPACITY: usize = 100;

/// Callback for an inbound message
pub type Handler =
    Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatcherError {
    #[error("dispatcher is closed")]
    Closed,

    #[error("handler for {0} is already registered")]
    DuplicateHandler(MessageKind),
}

/// Wrap an async closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Run `inner` on its own task so the read loop does not wait for it
pub fn async_handler(inner: Handler) -> Handler {
    Arc::new(move |msg| {
        let inner = inner.clone();
        Box::pin(async move {
            tokio::spawn(inner(msg));
        })
    })
}

struct Halves {
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
    rx: mpsc::Receiver<Message>,
}

pub struct Dispatcher {
    msg_ctl: Arc<MsgCtl>,
    halves: std::sync::Mutex<Option<Halves>>,
    tx: mpsc::Sender<Message>,
    handlers: RwLock<HashMap<MessageKind, Handler>>,
    default_handler: RwLock<Option<Handler>>,
    /// Fired once the read loop has ended
    done: CancellationToken,
    /// Asks the read loop to stop
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(conn: BoxedStream, msg_ctl: Arc<MsgCtl>) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(conn);
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        Arc::new(Self {
            msg_ctl,
            halves: std::sync::Mutex::new(Some(Halves { reader, writer, rx })),
            tx,
            handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
            done: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Register the handler for one message kind
    pub fn register_handler(&self, kind: MessageKind, h: Handler) -> Result<(), DispatcherError> {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handlers.contains_key(&kind) {
            return Err(DispatcherError::DuplicateHandler(kind));
        }
        handlers.insert(kind, h);
        Ok(())
    }

    /// Handler for messages without a dedicated one; without it they are dropped
    pub fn register_default_handler(&self, h: Handler) {
        let mut default = match self.default_handler.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *default = Some(h);
    }

    fn handler_for(&self, kind: MessageKind) -> Option<Handler> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(h) = handlers.get(&kind) {
            return Some(h.clone());
        }
        drop(handlers);
        match self.default_handler.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Start the read and send loops; later calls do nothing
    pub fn run(self: &Arc<Self>) {
        let Some(Halves { reader, writer, rx }) = lock(&self.halves).take() else {
            return;
        };

        let this = self.clone();
        tokio::spawn(async move { this.send_loop(writer, rx).await });

        let this = self.clone();
        tokio::spawn(async move { this.read_loop(reader).await });
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<BoxedStream>) {
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.msg_ctl.read_msg(&mut reader) => result,
            };

            let msg = match result {
                Ok(msg) => msg,
                Err(e) if e.is_eof() => {
                    debug!("connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!("read message error: {}", e);
                    break;
                }
            };

            trace!(kind = %msg.kind(), "received message");
            match self.handler_for(msg.kind()) {
                Some(h) => h(msg).await,
                None => debug!(kind = %msg.kind(), "no handler, message dropped"),
            }
        }
        self.done.cancel();
    }

    async fn send_loop(
        self: Arc<Self>,
        mut writer: WriteHalf<BoxedStream>,
        mut rx: mpsc::Receiver<Message>,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.done.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if let Err(e) = self.msg_ctl.write_msg(&mut writer, &msg).await {
                debug!("write message error: {}", e);
                self.shutdown.cancel();
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Queue a message for sending
    ///
    /// Waits only for queue space; fails once the dispatcher has ended.
    pub async fn send(&self, msg: impl Into<Message>) -> Result<(), DispatcherError> {
        if self.done.is_cancelled() {
            return Err(DispatcherError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.done.cancelled() => Err(DispatcherError::Closed),
            result = self.tx.send(msg.into()) => result.map_err(|_| DispatcherError::Closed),
        }
    }

    /// Close the connection; the read loop ends and `done` fires
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the read loop has ended
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    pub fn msg_ctl(&self) -> &Arc<MsgCtl> {
        &self.msg_ctl
    }
}
