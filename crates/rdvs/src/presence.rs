use crate::metrics::counters;
use crate::registry::{DeliveryError, Registry};
use rdv_common::signal::UserList;
use rdv_common::{ClientId, RoomId};
use std::collections::BTreeSet;

/// Outcome of one presence broadcast.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members whose queue accepted the list.
    pub delivered: usize,
    /// Members that could not be reached, with the reason.
    pub failed: Vec<(ClientId, DeliveryError)>,
}

/// The list `recipient` is allowed to see: every member except itself.
#[must_use]
pub fn user_list_for(room: &RoomId, members: &BTreeSet<ClientId>, recipient: &ClientId) -> UserList {
    UserList {
        users: members.iter().filter(|m| *m != recipient).cloned().collect(),
        room_id: room.clone(),
    }
}

/// Queue a `user_list` for a single member.
///
/// # Errors
///
/// Returns the [`DeliveryError`] reported by the registry.
pub fn send_user_list(
    registry: &Registry,
    room: &RoomId,
    members: &BTreeSet<ClientId>,
    recipient: &ClientId,
) -> Result<(), DeliveryError> {
    match user_list_for(room, members, recipient).to_json() {
        Ok(text) => registry.send(recipient, text),
        Err(e) => {
            tracing::error!(client = %recipient, "failed to encode user list: {}", e);
            Err(DeliveryError::Encode)
        }
    }
}

/// Push each member of `room` its own view of `members`.
///
/// A failed send never stops the remaining members from being notified;
/// failures are collected into the report and logged once.
pub fn broadcast(registry: &Registry, room: &RoomId, members: &BTreeSet<ClientId>) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for member in members {
        match send_user_list(registry, room, members, member) {
            Ok(()) => report.delivered += 1,
            Err(e) => report.failed.push((member.clone(), e)),
        }
    }
    counters::presence_updates_total();

    if report.failed.is_empty() {
        tracing::debug!(room = %room, members = members.len(), "presence broadcast");
    } else {
        let failed: Vec<String> = report
            .failed
            .iter()
            .map(|(id, e)| format!("{}: {}", id.label(), e))
            .collect();
        tracing::warn!(
            room = %room,
            delivered = report.delivered,
            failed = ?failed,
            "presence broadcast partially failed"
        );
    }
    report
}
