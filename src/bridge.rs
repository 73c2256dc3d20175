use std::collections::VecDeque;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::stream::{ConnMeta, HandoffStream};

/// Pull-based accept contract shared by the bridge and the TLS wrapper on
/// top of it.
pub trait Accept: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next connection. [`Error::Closed`] is terminal.
    fn accept(&self) -> impl Future<Output = Result<(Self::Io, ConnMeta)>> + Send;

    /// Address reported for this listener.
    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting and wake any pending `accept`.
    fn close(&self) -> Result<()>;
}

type Pending = (HandoffStream, ConnMeta);

// Queue and closed flag share one lock: nothing is queued once `closed` is set.
#[derive(Default)]
struct State {
    queue: VecDeque<Pending>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// Queue-backed synthetic listener. Cloning yields another handle to the
/// same queue.
#[derive(Clone, Default)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection for acceptance. Never blocks.
    ///
    /// Returns `false` when the bridge is closed; the connection is dropped,
    /// which closes it.
    pub fn put_conn(&self, stream: HandoffStream, meta: ConnMeta) -> bool {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            debug!(peer = ?meta.peer_addr, "bridge closed, dropping handed-off connection");
            return false;
        }
        state.queue.push_back((stream, meta));
        drop(state);

        self.shared.notify.notify_one();
        true
    }

    /// Wait until a connection is queued or the bridge is closed.
    pub async fn accept(&self) -> Result<Pending> {
        loop {
            // Registered before the state check so a close or put in between
            // is not missed.
            let notified = self.shared.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(Error::Closed);
                }
                if let Some(pending) = state.queue.pop_front() {
                    return Ok(pending);
                }
            }
            notified.await;
        }
    }

    /// Mark the bridge closed and wake a blocked `accept`. Idempotent.
    ///
    /// Queued connections are left in place; see [`Bridge::take_pending`].
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            debug!(pending = state.queue.len(), "bridge closed");
        }
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Remove every queued, never-accepted connection.
    pub fn take_pending(&self) -> Vec<Pending> {
        self.lock().queue.drain(..).collect()
    }

    /// Placeholder address; the bridge owns no socket.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Accept for Bridge {
    type Io = HandoffStream;

    fn accept(&self) -> impl Future<Output = Result<(Self::Io, ConnMeta)>> + Send {
        Bridge::accept(self)
    }

    fn local_addr(&self) -> SocketAddr {
        Bridge::local_addr(self)
    }

    fn close(&self) -> Result<()> {
        Bridge::close(self)
    }
}
