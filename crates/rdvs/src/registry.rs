use crate::identity::IdentityAllocator;
use crate::metrics::counters;
use dashmap::DashMap;
use rdv_common::{ClientId, RoomId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

/// Item on a client's outbound queue, drained in order by its connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A JSON text frame.
    Text(String),
    /// Close the WebSocket and end the connection task.
    Close,
}

/// Handle held in the registry: one per connected client.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Identity assigned at registration.
    pub id: ClientId,
    /// Outbound queue drained by the client's connection task.
    pub tx: mpsc::Sender<Outbound>,
    /// Room the client belongs to for the life of the connection.
    pub room: RoomId,
    /// Human-readable label derived from the identity.
    pub label: String,
    /// When the client was registered.
    pub joined_at: Instant,
}

/// A client taken out of the registry.
#[derive(Debug)]
pub struct Removed {
    /// The handle that was registered.
    pub handle: ConnHandle,
    /// Whether the close request made it onto the client's queue.
    pub close_queued: bool,
}

/// Why a message could not be queued for a client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// No client with that identity is registered.
    #[error("client not registered")]
    NotRegistered,
    /// The client's outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
    /// The client's connection task has already gone away.
    #[error("channel closed")]
    Closed,
    /// The message could not be encoded.
    #[error("message encoding failed")]
    Encode,
}

impl DeliveryError {
    /// Short label used for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::NotRegistered => "not_registered",
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
            Self::Encode => "encode",
        }
    }
}

/// Concurrent identity → connection table.
#[derive(Debug, Default)]
pub struct Registry {
    conns: DashMap<ClientId, ConnHandle>,
    ids: IdentityAllocator,
    /// Registered clients plus slots claimed by in-progress registrations.
    count: AtomicUsize,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new client for the given queue and room, returning its identity.
    pub fn register(&self, tx: mpsc::Sender<Outbound>, room: RoomId) -> ClientId {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.insert(tx, room)
    }

    /// Like [`register`](Self::register), but only if fewer than `limit`
    /// clients are registered. The check and the slot claim are one atomic
    /// step, so concurrent callers never push the table past `limit`.
    pub fn try_register(
        &self,
        tx: mpsc::Sender<Outbound>,
        room: RoomId,
        limit: usize,
    ) -> Option<ClientId> {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()?;
        Some(self.insert(tx, room))
    }

    fn insert(&self, tx: mpsc::Sender<Outbound>, room: RoomId) -> ClientId {
        let id = self.ids.allocate(|id| self.conns.contains_key(id));
        let handle = ConnHandle {
            id: id.clone(),
            label: id.label(),
            tx,
            room,
            joined_at: Instant::now(),
        };
        self.conns.insert(id.clone(), handle);
        id
    }

    /// Remove a client and ask its task to close the channel.
    ///
    /// Returns the removed handle on the first call and `None` on every later
    /// call, so the close request is issued exactly once. A close request
    /// that does not fit in the queue is reported through
    /// [`Removed::close_queued`]; the task still stops once the last sender
    /// is dropped.
    pub fn unregister(&self, id: &ClientId) -> Option<Removed> {
        let (_, handle) = self.conns.remove(id)?;
        self.count.fetch_sub(1, Ordering::SeqCst);
        let close_queued = match handle.tx.try_send(Outbound::Close) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(client = %handle.label, "close request not queued: {}", e);
                false
            }
        };
        Some(Removed {
            handle,
            close_queued,
        })
    }

    /// Queue a text frame for a client without waiting.
    ///
    /// Failures are logged and counted here; callers only decide whether to
    /// carry on.
    pub fn send(&self, id: &ClientId, text: String) -> Result<(), DeliveryError> {
        let Some(tx) = self.conns.get(id).map(|entry| entry.tx.clone()) else {
            tracing::debug!(client = %id, "send to unregistered client");
            counters::delivery_failures_total(DeliveryError::NotRegistered.reason());
            return Err(DeliveryError::NotRegistered);
        };
        let result = tx.try_send(Outbound::Text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        });
        if let Err(ref e) = result {
            tracing::warn!(client = %id, "delivery failed: {}", e);
            counters::delivery_failures_total(e.reason());
        }
        result
    }

    /// Look up a client handle by identity.
    #[must_use]
    pub fn get(&self, id: &ClientId) -> Option<ConnHandle> {
        self.conns.get(id).map(|entry| entry.value().clone())
    }

    /// Returns `true` if a client with this identity is registered.
    #[must_use]
    pub fn contains(&self, id: &ClientId) -> bool {
        self.conns.contains_key(id)
    }

    /// Snapshot of every registered identity.
    #[must_use]
    pub fn ids(&self) -> Vec<ClientId> {
        self.conns.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Returns `true` if no client is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Total identities issued since startup.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.ids.issued()
    }
}
