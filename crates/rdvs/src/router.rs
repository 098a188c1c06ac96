use crate::config::ServerConfig;
use crate::metrics::counters;
use crate::presence;
use crate::ratelimit::{RateLimiter, Throttle};
use crate::registry::DeliveryError;
use crate::server::ServerState;
use rdv_common::signal::{Forwarded, SignalKind};
use rdv_common::{ClientId, ClientMessage, ProtocolError, RoomId};
use serde_json::value::RawValue;

/// What happened to one inbound message.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The signal was queued for its target.
    Forwarded(SignalKind),
    /// A `user_list` was queued for the sender.
    Listed,
    /// The target is not a registered peer in the sender's room.
    TargetMissing,
    /// The target exists but its queue did not accept the message.
    Undelivered(DeliveryError),
    /// The sender is over its rate limit.
    Throttled(Throttle),
    /// The message exceeded the size limit; carries its length.
    TooLarge(usize),
    /// The message could not be understood.
    Rejected(ProtocolError),
}

/// Per-connection routing state.
#[derive(Debug)]
pub struct Session {
    id: ClientId,
    room: RoomId,
    limiter: RateLimiter,
    max_message: usize,
}

impl Session {
    /// Routing state for a client admitted as `id` into `room`.
    #[must_use]
    pub fn new(id: ClientId, room: RoomId, config: &ServerConfig) -> Self {
        Self {
            id,
            room,
            limiter: RateLimiter::new(config.msg_rate, config.bw_rate),
            max_message: config.max_message,
        }
    }

    /// The client this session routes for.
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// The room the client belongs to.
    #[must_use]
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Route one text frame. Nothing here closes the connection; every
    /// failure is logged, counted and reported through the outcome.
    pub fn handle_text(&mut self, state: &ServerState, text: &str) -> RouteOutcome {
        if text.len() > self.max_message {
            counters::messages_dropped_total("too_large");
            tracing::warn!(
                client = %self.id,
                len = text.len(),
                limit = self.max_message,
                "dropping oversized message"
            );
            return RouteOutcome::TooLarge(text.len());
        }
        if let Err(throttle) = self.limiter.admit(text.len()) {
            counters::messages_dropped_total(throttle.reason());
            tracing::debug!(client = %self.id, reason = throttle.reason(), "message throttled");
            return RouteOutcome::Throttled(throttle);
        }

        match ClientMessage::parse(text) {
            Ok(ClientMessage::Signal {
                kind,
                target,
                payload,
            }) => self.forward(state, kind, &target, &payload),
            Ok(ClientMessage::GetUsers) => self.list(state),
            Err(e) => self.reject(e),
        }
    }

    /// Binary frames carry nothing this relay understands.
    pub fn handle_binary(&self, len: usize) -> RouteOutcome {
        self.reject(ProtocolError::Malformed(format!("binary frame of {len} bytes")))
    }

    fn forward(
        &self,
        state: &ServerState,
        kind: SignalKind,
        target: &ClientId,
        payload: &RawValue,
    ) -> RouteOutcome {
        // A peer that left between the sender's last user_list and now is an
        // expected race, so misses are only logged at debug.
        let in_room = target != &self.id
            && state
                .registry
                .get(target)
                .is_some_and(|handle| handle.room == self.room);
        if !in_room {
            counters::messages_dropped_total("no_target");
            tracing::debug!(
                client = %self.id,
                target = %target,
                kind = kind.as_str(),
                "signal target not in room"
            );
            return RouteOutcome::TargetMissing;
        }

        let text = match Forwarded::new(kind, payload, &self.id).to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(client = %self.id, "failed to encode forwarded signal: {}", e);
                return RouteOutcome::Undelivered(DeliveryError::Encode);
            }
        };
        match state.registry.send(target, text) {
            Ok(()) => {
                counters::messages_relayed_total(kind.as_str());
                tracing::trace!(client = %self.id, target = %target, kind = kind.as_str(), "forwarded");
                RouteOutcome::Forwarded(kind)
            }
            Err(e) => {
                counters::messages_dropped_total("undelivered");
                RouteOutcome::Undelivered(e)
            }
        }
    }

    fn list(&self, state: &ServerState) -> RouteOutcome {
        let sent = state.rooms.with_members(&self.room, |members| {
            presence::send_user_list(&state.registry, &self.room, members, &self.id)
        });
        match sent {
            Ok(()) => RouteOutcome::Listed,
            Err(e) => RouteOutcome::Undelivered(e),
        }
    }

    fn reject(&self, error: ProtocolError) -> RouteOutcome {
        counters::messages_dropped_total(error.reason());
        tracing::warn!(client = %self.id, "dropping message: {}", error);
        RouteOutcome::Rejected(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct Peer {
        session: Session,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Peer {
        fn join(state: &ServerState, room: Option<&str>) -> Self {
            let (tx, rx) = mpsc::channel(16);
            let (id, room) = state.admit(room, tx).unwrap();
            let mut peer = Self {
                session: Session::new(id, room, &state.config),
                rx,
            };
            peer.drain();
            peer
        }

        fn id(&self) -> &ClientId {
            self.session.id()
        }

        fn drain(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(Outbound::Text(text)) = self.rx.try_recv() {
                out.push(text);
            }
            out
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            http_addr: "127.0.0.1:0".parse().unwrap(),
            max_conns: 16,
            max_message: 1024,
            msg_rate: 600,
            bw_rate: 1_048_576,
            queue_depth: 16,
            ping_interval: 30,
            drain_timeout: 1,
            handshake_timeout: 10,
            room_ttl: 60,
            max_rooms: 16,
            rooms: vec!["lobby".into()],
        }
    }

    fn state() -> ServerState {
        ServerState::new(config()).unwrap()
    }

    #[test]
    fn offer_is_forwarded_verbatim_with_sender() {
        let state = state();
        let mut a = Peer::join(&state, None);
        let mut b = Peer::join(&state, None);
        a.drain();

        let payload = r#"{ "sdp" : "v=0\r\no=- 1 2 IN IP4 0.0.0.0", "type":"offer", "n": 1.50 }"#;
        let text = format!(r#"{{"type":"offer","target":"{}","offer":{payload}}}"#, b.id());
        assert_eq!(
            a.session.handle_text(&state, &text),
            RouteOutcome::Forwarded(SignalKind::Offer)
        );

        let received = b.drain();
        assert_eq!(received.len(), 1);
        assert!(received[0].contains(payload));
        let value: Value = serde_json::from_str(&received[0]).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["from"], a.id().as_str());
        assert!(value.get("target").is_none());
        assert!(a.drain().is_empty());
    }

    #[test]
    fn answer_and_candidate_use_their_own_fields() {
        let state = state();
        let mut a = Peer::join(&state, None);
        let mut b = Peer::join(&state, None);
        a.drain();

        let answer = json!({"type": "answer", "target": a.id(), "answer": {"sdp": "x"}});
        assert_eq!(
            b.session.handle_text(&state, &answer.to_string()),
            RouteOutcome::Forwarded(SignalKind::Answer)
        );
        let candidate = json!({"type": "ice_candidate", "target": a.id(), "candidate": null});
        assert!(matches!(
            b.session.handle_text(&state, &candidate.to_string()),
            RouteOutcome::Rejected(ProtocolError::MissingField { field: "candidate", .. })
        ));
        let candidate = json!({"type": "ice_candidate", "target": a.id(), "candidate": {"candidate": "c"}});
        assert_eq!(
            b.session.handle_text(&state, &candidate.to_string()),
            RouteOutcome::Forwarded(SignalKind::IceCandidate)
        );

        let received: Vec<Value> = a
            .drain()
            .iter()
            .map(|t| serde_json::from_str(t).unwrap())
            .collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0]["answer"], json!({"sdp": "x"}));
        assert_eq!(received[1]["type"], "ice_candidate");
        assert_eq!(received[1]["candidate"], json!({"candidate": "c"}));
        assert_eq!(received[1]["from"], b.id().as_str());
        assert!(b.drain().is_empty());
    }

    #[test]
    fn unknown_target_is_a_silent_miss() {
        let state = state();
        let mut a = Peer::join(&state, None);
        let text = r#"{"type":"offer","target":"nobody","offer":{}}"#;
        assert_eq!(a.session.handle_text(&state, text), RouteOutcome::TargetMissing);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn self_and_other_room_targets_are_misses() {
        let state = state();
        let mut a = Peer::join(&state, None);
        let mut c = Peer::join(&state, Some("lobby"));

        let to_self = json!({"type": "offer", "target": a.id(), "offer": {}});
        assert_eq!(
            a.session.handle_text(&state, &to_self.to_string()),
            RouteOutcome::TargetMissing
        );
        let across = json!({"type": "offer", "target": c.id(), "offer": {}});
        assert_eq!(
            a.session.handle_text(&state, &across.to_string()),
            RouteOutcome::TargetMissing
        );
        assert!(a.drain().is_empty());
        assert!(c.drain().is_empty());
    }

    #[test]
    fn departed_target_is_a_miss() {
        let state = state();
        let a = Peer::join(&state, None);
        let mut b = Peer::join(&state, None);
        let gone = a.id().clone();
        state.depart(&gone, a.session.room());
        b.drain();

        let text = json!({"type": "answer", "target": gone, "answer": {}});
        assert_eq!(
            b.session.handle_text(&state, &text.to_string()),
            RouteOutcome::TargetMissing
        );
    }

    #[test]
    fn get_users_lists_room_without_requester() {
        let state = state();
        let mut a = Peer::join(&state, None);
        let b = Peer::join(&state, None);
        let _c = Peer::join(&state, Some("lobby"));
        a.drain();

        assert_eq!(
            a.session.handle_text(&state, r#"{"type":"get_users"}"#),
            RouteOutcome::Listed
        );
        let replies = a.drain();
        assert_eq!(replies.len(), 1);
        let value: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(value["type"], "user_list");
        assert_eq!(value["users"], json!([b.id()]));
        assert_eq!(value["room_id"], "default");
    }

    #[test]
    fn get_users_alone_is_empty() {
        let state = state();
        let mut a = Peer::join(&state, Some("lobby"));
        assert_eq!(
            a.session.handle_text(&state, r#"{"type":"get_users","extra":[1,2]}"#),
            RouteOutcome::Listed
        );
        let value: Value = serde_json::from_str(&a.drain()[0]).unwrap();
        assert_eq!(value["users"], json!([]));
        assert_eq!(value["room_id"], "lobby");
    }

    #[test]
    fn malformed_input_is_rejected_without_side_effects() {
        let state = state();
        let mut a = Peer::join(&state, None);
        let mut b = Peer::join(&state, None);
        a.drain();

        for (text, reason) in [
            ("not json", "malformed"),
            ("[1,2,3]", "malformed"),
            (r#"{"target":"x"}"#, "missing_type"),
            (r#"{"type":"bogus"}"#, "unknown_type"),
            (r#"{"type":"offer","offer":{}}"#, "missing_field"),
            (r#"{"type":"offer","target":"","offer":{}}"#, "missing_field"),
        ] {
            match a.session.handle_text(&state, text) {
                RouteOutcome::Rejected(e) => assert_eq!(e.reason(), reason, "{text}"),
                other => panic!("{text}: expected rejection, got {other:?}"),
            }
        }
        let missing_payload = json!({"type": "answer", "target": b.id()});
        assert!(matches!(
            a.session.handle_text(&state, &missing_payload.to_string()),
            RouteOutcome::Rejected(ProtocolError::MissingField { field: "answer", .. })
        ));
        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[test]
    fn binary_frames_are_rejected() {
        let state = state();
        let a = Peer::join(&state, None);
        assert!(matches!(
            a.session.handle_binary(12),
            RouteOutcome::Rejected(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_messages_are_dropped() {
        let state = state();
        let mut a = Peer::join(&state, None);
        let b = Peer::join(&state, None);
        let big = "x".repeat(2000);
        let text = json!({"type": "offer", "target": b.id(), "offer": {"sdp": big}}).to_string();
        assert_eq!(
            a.session.handle_text(&state, &text),
            RouteOutcome::TooLarge(text.len())
        );
    }

    #[test]
    fn message_rate_is_enforced() {
        let mut config = config();
        config.msg_rate = 2;
        let state = ServerState::new(config).unwrap();
        let mut a = Peer::join(&state, None);

        let get = r#"{"type":"get_users"}"#;
        assert_eq!(a.session.handle_text(&state, get), RouteOutcome::Listed);
        assert_eq!(a.session.handle_text(&state, get), RouteOutcome::Listed);
        assert_eq!(
            a.session.handle_text(&state, get),
            RouteOutcome::Throttled(Throttle::Messages)
        );
        assert_eq!(a.drain().len(), 2);
    }

    #[test]
    fn full_target_queue_reports_undelivered() {
        let mut config = config();
        config.queue_depth = 1;
        let state = ServerState::new(config).unwrap();
        let (tx_b, _rx_b) = mpsc::channel(1);
        let (b, _) = state.admit(None, tx_b).unwrap();
        let mut a = Peer::join(&state, None);

        // b's single slot already holds the user_list from a's arrival.
        let text = json!({"type": "offer", "target": b, "offer": {}});
        assert_eq!(
            a.session.handle_text(&state, &text.to_string()),
            RouteOutcome::Undelivered(DeliveryError::QueueFull)
        );
        assert!(a.drain().is_empty());
    }
}
