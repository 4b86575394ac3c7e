//! In-process listener fed by the relay instead of a socket

use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};

/// Default accept backlog
pub const DEFAULT_BACKLOG: usize = 128;

/// Why no queue slot could be reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    Full,
    Closed,
}

impl std::fmt::Display for ReserveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReserveError::Full => f.write_str("listener accept queue is full"),
            ReserveError::Closed => f.write_str("listener is closed"),
        }
    }
}

/// A queue slot held for one connection
///
/// Dropping it without calling [`Reservation::put`] frees the slot.
pub struct Reservation<T> {
    permit: mpsc::OwnedPermit<T>,
}

impl<T> Reservation<T> {
    /// Queue the connection; cannot fail once the slot is held
    pub fn put(self, conn: T) {
        self.permit.send(conn);
    }
}

impl<T> std::fmt::Debug for Reservation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Reservation")
    }
}

/// A listener whose connections are pushed in by the relay
///
/// `reserve` never waits. After `close`, already queued connections can
/// still be accepted; `accept` returns `None` once they are drained.
pub struct InternalListener<T> {
    tx: StdMutex<Option<mpsc::Sender<T>>>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> InternalListener<T> {
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG)
    }

    pub fn with_backlog(backlog: usize) -> Self {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }

    /// Wait for the next queued connection
    pub async fn accept(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Hold a queue slot without blocking
    ///
    /// A slot reserved before `close` can still be filled.
    pub fn reserve(&self) -> Result<Reservation<T>, ReserveError> {
        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let tx = tx.ok_or(ReserveError::Closed)?;
        match tx.try_reserve_owned() {
            Ok(permit) => Ok(Reservation { permit }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ReserveError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ReserveError::Closed),
        }
    }

    /// Stop accepting new connections
    pub fn close(&self) {
        match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
    }

    pub fn is_closed(&self) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl<T> Default for InternalListener<T> {
    fn default() -> Self {
        Self::new()
    }
}
