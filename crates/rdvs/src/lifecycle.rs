//! Orderly teardown of the relay's shared state.
//!
//! Shutdown never stops early: every step runs even if earlier ones
//! reported failures, and failures are collected into the returned
//! [`ShutdownReport`] and logged.

use crate::server::ServerState;
use rdv_common::ClientId;
use tracing::{info, warn};

/// A resource owned outside the relay core that must be released on
/// shutdown, such as a capture device feeding a server-side demo track.
pub trait Collaborator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Release the resource. Called at most once.
    ///
    /// # Errors
    ///
    /// Any failure is logged by the caller and does not stop shutdown.
    fn release(&self) -> anyhow::Result<()>;
}

/// One step of shutdown that did not go cleanly.
#[derive(Debug)]
pub enum ShutdownFailure {
    /// The close request for a client could not be queued, because its
    /// queue was full or its task had already gone. The task still ends once
    /// the registry's sender is dropped.
    Channel(ClientId),
    /// A collaborator failed to release.
    Collaborator {
        /// Collaborator name.
        name: String,
        /// Error text.
        error: String,
    },
}

/// What shutdown did.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Clients unregistered by this shutdown.
    pub closed: usize,
    /// Live rooms removed.
    pub rooms_cleared: usize,
    /// Collaborators released successfully.
    pub released: usize,
    /// Everything that failed along the way.
    pub failures: Vec<ShutdownFailure>,
}

/// Tear down all relay state.
///
/// Marks the server as closing so no new client registers, asks every
/// registered client's task to close, clears the room directory and
/// releases collaborators. Calling it again finds nothing left to do.
pub fn shutdown(state: &ServerState) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    if !state.begin_closing() {
        info!("shutdown already in progress");
    }

    // A client that disconnects concurrently is simply gone by the time we
    // reach it; unregister returns None and nothing is sent twice.
    for id in state.registry.ids() {
        let Some(removed) = state.registry.unregister(&id) else {
            continue;
        };
        report.closed += 1;
        if !removed.close_queued {
            report.failures.push(ShutdownFailure::Channel(id));
        }
    }

    report.rooms_cleared = state.rooms.clear();

    for collaborator in state.take_collaborators() {
        match collaborator.release() {
            Ok(()) => {
                report.released += 1;
                info!(collaborator = collaborator.name(), "released");
            }
            Err(e) => report.failures.push(ShutdownFailure::Collaborator {
                name: collaborator.name().to_owned(),
                error: format!("{e:#}"),
            }),
        }
    }

    for failure in &report.failures {
        match failure {
            ShutdownFailure::Channel(id) => {
                warn!(client = %id, "close request not queued during shutdown");
            }
            ShutdownFailure::Collaborator { name, error } => {
                warn!(collaborator = %name, "release failed: {}", error);
            }
        }
    }
    report
}
