use crate::metrics::gauges;
use rdv_common::types::{is_valid_room_id, DEFAULT_ROOM};
use rdv_common::{ClientId, RoomId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Public description of a room, as served by the room resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Room identifier.
    pub room_id: RoomId,
    /// Number of connected members.
    pub user_count: usize,
}

/// Errors from reserving a room identifier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    /// The identifier is empty, too long, or has characters outside `[A-Za-z0-9_-]`.
    #[error("invalid room identifier {0:?}")]
    InvalidId(String),
    /// The directory already holds the maximum number of rooms.
    #[error("room limit reached ({0})")]
    Full(usize),
}

#[derive(Debug, Clone, Copy)]
enum Reservation {
    Permanent,
    Until(Instant),
}

impl Reservation {
    fn is_expired(self, now: Instant) -> bool {
        matches!(self, Self::Until(deadline) if now >= deadline)
    }
}

#[derive(Debug, Default)]
struct Rooms {
    live: HashMap<RoomId, BTreeSet<ClientId>>,
    reserved: HashMap<RoomId, Reservation>,
}

impl Rooms {
    fn is_known(&self, room: &str, now: Instant) -> bool {
        room == DEFAULT_ROOM
            || self.live.contains_key(room)
            || self
                .reserved
                .get(room)
                .is_some_and(|r| !r.is_expired(now))
    }

    /// Rooms counted against the limit. The default room is free.
    fn occupied(&self) -> usize {
        let extra_live = self
            .live
            .keys()
            .filter(|room| !room.is_default() && !self.reserved.contains_key(*room))
            .count();
        self.reserved.len() + extra_live
    }

    fn prune_expired(&mut self, now: Instant) {
        let live = &self.live;
        self.reserved
            .retain(|room, r| live.contains_key(room) || !r.is_expired(now));
    }

    fn info(&self, room: RoomId) -> RoomInfo {
        let user_count = self.live.get(&room).map_or(0, BTreeSet::len);
        RoomInfo {
            room_id: room,
            user_count,
        }
    }
}

/// Room identifier → membership directory.
///
/// Every mutation runs under one lock, and the `on_change` callbacks of
/// [`join`](Self::join) and [`leave`](Self::leave) run inside it, so a
/// presence broadcast always sees the membership exactly as the mutation left
/// it and broadcasts reach each queue in mutation order.
#[derive(Debug)]
pub struct RoomDirectory {
    inner: Mutex<Rooms>,
    ttl: Duration,
    max_rooms: usize,
}

impl RoomDirectory {
    /// Create an empty directory. HTTP reservations live for `ttl` once their
    /// room is empty; at most `max_rooms` rooms are live or reserved.
    #[must_use]
    pub fn new(ttl: Duration, max_rooms: usize) -> Self {
        Self {
            inner: Mutex::new(Rooms::default()),
            ttl,
            max_rooms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Rooms> {
        // Nothing in the critical sections can leave the maps inconsistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map a requested identifier to the room a client will join.
    ///
    /// Absent, empty and unknown identifiers all resolve to the default room.
    #[must_use]
    pub fn resolve(&self, requested: Option<&str>) -> RoomId {
        let rooms = self.lock();
        match requested {
            Some(room) if rooms.is_known(room, Instant::now()) => RoomId::from(room),
            _ => RoomId::default_room(),
        }
    }

    /// Add `id` to `room`, creating the room if needed, then call `on_change`
    /// with the new membership while the lock is still held.
    pub fn join<F>(&self, room: &RoomId, id: &ClientId, on_change: F) -> usize
    where
        F: FnOnce(&RoomId, &BTreeSet<ClientId>),
    {
        let mut rooms = self.lock();
        let members = rooms.live.entry(room.clone()).or_default();
        members.insert(id.clone());
        let count = members.len();
        on_change(room, members);
        gauges::set_rooms_active(rooms.live.len());
        count
    }

    /// Remove `id` from `room`. An emptied room is deleted; otherwise
    /// `on_change` is called with the remaining members under the lock.
    ///
    /// Returns `false` if `id` was not a member.
    pub fn leave<F>(&self, room: &RoomId, id: &ClientId, on_change: F) -> bool
    where
        F: FnOnce(&RoomId, &BTreeSet<ClientId>),
    {
        let mut rooms = self.lock();
        let Some(members) = rooms.live.get_mut(room) else {
            return false;
        };
        if !members.remove(id) {
            return false;
        }
        if members.is_empty() {
            rooms.live.remove(room);
            if let Some(Reservation::Until(deadline)) = rooms.reserved.get_mut(room) {
                *deadline = Instant::now() + self.ttl;
            }
            tracing::debug!(room = %room, "room emptied and removed");
        } else {
            on_change(room, members);
        }
        gauges::set_rooms_active(rooms.live.len());
        true
    }

    /// Members of `room` other than `id`, in identity order.
    #[must_use]
    pub fn members_excluding(&self, room: &RoomId, id: &ClientId) -> Vec<ClientId> {
        self.with_members(room, |members| {
            members.iter().filter(|m| *m != id).cloned().collect()
        })
    }

    /// Run `f` over the membership of `room` (empty if the room is not live)
    /// while holding the lock.
    pub fn with_members<R>(&self, room: &RoomId, f: impl FnOnce(&BTreeSet<ClientId>) -> R) -> R {
        let rooms = self.lock();
        match rooms.live.get(room) {
            Some(members) => f(members),
            None => f(&BTreeSet::new()),
        }
    }

    /// Make `room` joinable for the reservation lifetime.
    ///
    /// Reserving an existing room refreshes it; reserving the default room is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// [`RoomError::InvalidId`] for a malformed identifier,
    /// [`RoomError::Full`] when the room limit is reached.
    pub fn reserve(&self, room: &str) -> Result<RoomInfo, RoomError> {
        self.insert_reservation(room, Reservation::Until(Instant::now() + self.ttl))
    }

    /// Make `room` joinable for the life of the process.
    ///
    /// # Errors
    ///
    /// As for [`reserve`](Self::reserve).
    pub fn reserve_permanent(&self, room: &str) -> Result<RoomInfo, RoomError> {
        self.insert_reservation(room, Reservation::Permanent)
    }

    /// Reserve a freshly generated identifier.
    ///
    /// # Errors
    ///
    /// [`RoomError::Full`] when the room limit is reached.
    pub fn reserve_new(&self) -> Result<RoomInfo, RoomError> {
        loop {
            let room = RoomId::generate();
            if self.lock().is_known(room.as_str(), Instant::now()) {
                continue;
            }
            return self.reserve(room.as_str());
        }
    }

    fn insert_reservation(&self, room: &str, reservation: Reservation) -> Result<RoomInfo, RoomError> {
        if !is_valid_room_id(room) {
            return Err(RoomError::InvalidId(room.to_owned()));
        }
        let room = RoomId::from(room);
        let mut rooms = self.lock();
        if room.is_default() {
            return Ok(rooms.info(room));
        }

        let now = Instant::now();
        rooms.prune_expired(now);
        match rooms.reserved.get_mut(&room) {
            Some(Reservation::Permanent) => {}
            Some(existing) => *existing = reservation,
            None => {
                if !rooms.live.contains_key(&room) && rooms.occupied() >= self.max_rooms {
                    return Err(RoomError::Full(self.max_rooms));
                }
                rooms.reserved.insert(room.clone(), reservation);
            }
        }
        Ok(rooms.info(room))
    }

    /// Describe a room. `None` if it is neither the default room, reserved
    /// nor live.
    #[must_use]
    pub fn describe(&self, room: &str) -> Option<RoomInfo> {
        let rooms = self.lock();
        rooms
            .is_known(room, Instant::now())
            .then(|| rooms.info(RoomId::from(room)))
    }

    /// Drop every room and reservation, returning how many rooms were live.
    pub fn clear(&self) -> usize {
        let mut rooms = self.lock();
        let live = rooms.live.len();
        rooms.live.clear();
        rooms.reserved.clear();
        gauges::set_rooms_active(0);
        live
    }

    /// Number of live (non-empty) rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Returns `true` if `room` currently has members.
    #[must_use]
    pub fn is_live(&self, room: &RoomId) -> bool {
        self.lock().live.contains_key(room)
    }
}
