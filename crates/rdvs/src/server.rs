use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RdvsError;
use crate::lifecycle::{self, Collaborator};
use crate::metrics::counters;
use crate::presence;
use crate::registry::{Outbound, Registry};
use crate::rooms::{RoomDirectory, RoomError};
use rdv_common::{ClientId, RoomId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shared state for the relay server.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Connected clients by identity.
    pub registry: Registry,
    /// Room membership and reservations.
    pub rooms: RoomDirectory,
    /// Sockets allowed to sit in the WebSocket upgrade at once.
    handshakes: Arc<Semaphore>,
    closing: AtomicBool,
    collaborators: Mutex<Vec<Box<dyn Collaborator>>>,
}

impl ServerState {
    /// Build the shared state, reserving the configured rooms.
    ///
    /// # Errors
    ///
    /// Returns a [`RoomError`] if a configured room cannot be reserved.
    pub fn new(config: ServerConfig) -> Result<Self, RoomError> {
        let rooms = RoomDirectory::new(Duration::from_secs(config.room_ttl), config.max_rooms);
        for room in &config.rooms {
            rooms.reserve_permanent(room)?;
        }
        Ok(Self {
            registry: Registry::new(),
            rooms,
            handshakes: Arc::new(Semaphore::new(config.max_conns)),
            closing: AtomicBool::new(false),
            collaborators: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Register a resource to release when the relay shuts down.
    pub fn add_collaborator(&self, collaborator: Box<dyn Collaborator>) {
        self.collaborators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(collaborator);
    }

    pub(crate) fn take_collaborators(&self) -> Vec<Box<dyn Collaborator>> {
        std::mem::take(&mut *self.collaborators.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Reserve a handshake slot for a freshly accepted socket, or `None` if
    /// `max_conns` sockets are already mid-upgrade.
    pub(crate) fn try_begin_handshake(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.handshakes).try_acquire_owned().ok()
    }

    /// Number of sockets currently mid-upgrade.
    #[must_use]
    pub fn handshakes_in_flight(&self) -> usize {
        self.config.max_conns - self.handshakes.available_permits()
    }

    /// Returns `true` once shutdown has begun.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop registering new clients. Returns `false` if already closing.
    pub(crate) fn begin_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    /// Register a client whose outbound queue is `tx`, place it in a room and
    /// notify the room.
    ///
    /// # Errors
    ///
    /// [`RdvsError::Closing`] during shutdown, [`RdvsError::AtCapacity`] when
    /// the connection limit is reached.
    pub fn admit(
        &self,
        requested_room: Option<&str>,
        tx: mpsc::Sender<Outbound>,
    ) -> Result<(ClientId, RoomId), RdvsError> {
        if self.is_closing() {
            return Err(RdvsError::Closing);
        }

        let room = self.rooms.resolve(requested_room);
        let Some(id) = self
            .registry
            .try_register(tx, room.clone(), self.config.max_conns)
        else {
            return Err(RdvsError::AtCapacity(self.config.max_conns));
        };
        self.rooms.join(&room, &id, |room, members| {
            presence::broadcast(&self.registry, room, members);
        });

        // Shutdown may have swept the registry between the check above and
        // the registration; undo it ourselves in that case.
        if self.is_closing() {
            self.depart(&id, &room);
            return Err(RdvsError::Closing);
        }
        Ok((id, room))
    }

    /// Remove a client and tell the rest of its room. Safe to call more than once.
    pub fn depart(&self, id: &ClientId, room: &RoomId) {
        if let Some(removed) = self.registry.unregister(id) {
            tracing::debug!(
                client = %removed.handle.label,
                connected_secs = removed.handle.joined_at.elapsed().as_secs(),
                "unregistered"
            );
        }
        self.rooms.leave(room, id, |room, members| {
            presence::broadcast(&self.registry, room, members);
        });
    }
}

/// Run the accept loop until the process ends.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RdvsError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop until `shutdown_rx` changes or its sender is dropped,
/// then run the shutdown sequence and drain connection tasks.
///
/// Tasks still running after `drain_timeout` are aborted.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), RdvsError> {
    let local_addr = listener.local_addr()?;
    info!("relay listening on {}", local_addr);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let Some(permit) = state.try_begin_handshake() else {
                            tracing::debug!(peer = %addr, "too many pending handshakes, dropping connection");
                            counters::connections_rejected_total("handshake_limit");
                            drop(stream);
                            continue;
                        };
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state, permit).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("connection task panicked: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }
    drop(listener);

    let report = lifecycle::shutdown(&state);
    info!(
        closed = report.closed,
        rooms = report.rooms_cleared,
        failures = report.failures.len(),
        "relay state torn down"
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(state.config.drain_timeout);
    while !tasks.is_empty() {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "drain timeout reached with {} connections still active, aborting",
                    tasks.len()
                );
                tasks.shutdown().await;
                break;
            }
        }
    }

    info!("relay shut down");
    Ok(())
}
