//! Rendezvous relay server: hands out client identities, groups clients into
//! rooms and forwards WebRTC signaling between peers in the same room.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
pub mod http;
/// Client identity allocation.
pub mod identity;
/// Shutdown sequence and external collaborators.
pub mod lifecycle;
pub mod metrics;
/// Room membership snapshots pushed to clients.
pub mod presence;
/// Per-connection inbound rate limiting.
pub mod ratelimit;
/// Identity-keyed table of connected clients.
pub mod registry;
/// Room directory and reservations.
pub mod rooms;
/// Inbound message routing.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use lifecycle::{Collaborator, ShutdownReport};
pub use server::{run, run_with_shutdown, ServerState};
