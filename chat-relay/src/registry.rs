//! Live connection set shared by every connection handler.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::sync::{Mutex, Notify, mpsc};

use crate::error::SendFailure;

pub type ConnectionId = u64;

/// Relay-side handle for one accepted socket.
///
/// The handler that owns the socket holds the receiving end of `outbound`;
/// everyone else talks to the peer through [`Connection::try_send`].
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Arc<str>>,
    open: AtomicBool,
    closed: Notify,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        outbound: mpsc::Sender<Arc<str>>,
    ) -> Self {
        Self {
            id,
            peer,
            outbound,
            open: AtomicBool::new(true),
            closed: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queues a frame without waiting.
    pub fn try_send(&self, frame: Arc<str>) -> Result<(), SendFailure> {
        if !self.is_open() {
            return Err(SendFailure::Closed);
        }
        self.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendFailure::BufferFull,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Marks the connection closed and wakes whoever awaits [`Connection::closed`].
    ///
    /// Returns `false` when it was already closed.
    pub fn close(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        if was_open {
            // notify_one stores a permit, so a handler that is not yet waiting still wakes.
            self.closed.notify_one();
        }
        was_open
    }

    pub async fn closed(&self) {
        if !self.is_open() {
            return;
        }
        self.closed.notified().await;
    }
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.lock().await;
        connections.insert(connection.id(), connection);
    }

    /// Removes and closes a connection. Unknown ids are ignored, since a close
    /// can race with a failed send to the same peer.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = {
            let mut connections = self.connections.lock().await;
            connections.remove(&id)
        };
        if let Some(connection) = &removed {
            connection.close();
        }
        removed
    }

    /// Point-in-time copy of the members, ordered by id.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut members: Vec<_> = {
            let connections = self.connections.lock().await;
            connections.values().cloned().collect()
        };
        members.sort_by_key(|connection| connection.id());
        members
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, connection)| connection).collect()
        };
        for connection in &drained {
            connection.close();
        }
        drained.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
