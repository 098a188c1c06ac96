//! Wire protocol shared by the rendezvous relay and its clients.
//!
//! This crate provides:
//! - JSON signaling message parsing and encoding ([`signal`])
//! - Identity and room identifier types and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod signal;
pub mod types;

pub use signal::{ClientMessage, ProtocolError, SignalKind};
pub use types::{ClientId, RoomId};
