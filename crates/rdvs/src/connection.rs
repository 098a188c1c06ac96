use crate::error::RdvsError;
use crate::metrics::{counters, gauges, histograms};
use crate::registry::Outbound;
use crate::router::Session;
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rdv_common::types::ROOM_QUERY_PARAM;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::{interval_at, timeout, Duration};
use tokio_tungstenite::tungstenite::http::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Room requested through the upgrade URL's query string, if any.
fn requested_room<B>(req: &Request<B>) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == ROOM_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
}

fn close_frame(code: CloseCode, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Drive the select loop for a registered client until either side closes.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    outbound: &mut mpsc::Receiver<Outbound>,
    state: &ServerState,
    session: &mut Session,
) -> Result<(), RdvsError> {
    let period = Duration::from_secs(state.config.ping_interval);
    let mut ping_interval = interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        session.handle_text(state, &text);
                        histograms::route_latency_seconds(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        session.handle_binary(data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RdvsError::WebSocket(e)),
                    _ => {}
                }
            }
            item = outbound.recv() => {
                match item {
                    Some(Outbound::Text(text)) => {
                        ws_tx.send(Message::Text(text)).await?;
                    }
                    // The registry dropped this client: shutdown or an
                    // explicit unregister.
                    Some(Outbound::Close) | None => {
                        let close = close_frame(CloseCode::Away, "relay shutting down".into());
                        if let Err(e) = ws_tx.send(close).await {
                            tracing::debug!("failed to send close frame: {}", e);
                        }
                        return Ok(());
                    }
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = ws_tx.send(Message::Ping(vec![])).await {
                    tracing::debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}

/// Upgrade one TCP connection, admit it as a client and relay its messages
/// until it disconnects. The client is always removed from the registry and
/// its room before this returns.
///
/// `handshake` is the slot reserved at accept time; it is held until the
/// upgrade completes or `handshake_timeout` expires.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    handshake: OwnedSemaphorePermit,
) -> Result<(), RdvsError> {
    // Frames up to this size reach the router, which drops anything over
    // `max_message` without closing the connection.
    let frame_limit = state.config.max_message.saturating_mul(4);
    let ws_config = WebSocketConfig {
        max_message_size: Some(frame_limit),
        max_frame_size: Some(frame_limit),
        ..WebSocketConfig::default()
    };

    let room_cell = Arc::new(OnceLock::new());
    let cell = room_cell.clone();
    let upgrade = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request<()>, resp: Response<()>| {
            if let Some(room) = requested_room(req) {
                let _ = cell.set(room);
            }
            Ok(resp)
        },
        Some(ws_config),
    );
    let limit = Duration::from_secs(state.config.handshake_timeout);
    let ws_stream = match timeout(limit, upgrade).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::debug!(peer = %peer_addr, "websocket upgrade timed out");
            counters::connections_rejected_total("handshake_timeout");
            return Err(RdvsError::HandshakeTimeout(state.config.handshake_timeout));
        }
    };
    drop(handshake);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut outbound) = mpsc::channel(state.config.queue_depth);

    let requested = room_cell.get().map(String::as_str);
    let (id, room) = match state.admit(requested, tx) {
        Ok(admitted) => admitted,
        Err(e) => {
            tracing::debug!(peer = %peer_addr, "refusing client: {}", e);
            let _ = ws_tx.send(close_frame(CloseCode::Again, e.to_string())).await;
            return Err(e);
        }
    };

    gauges::inc_connections_active();
    tracing::info!(
        client = %id,
        room = %room,
        peer = %peer_addr,
        requested = requested.unwrap_or(""),
        "client connected"
    );

    let mut session = Session::new(id.clone(), room.clone(), &state.config);
    let result = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut outbound,
        &state,
        &mut session,
    )
    .await;

    state.depart(&id, &room);
    gauges::dec_connections_active();
    match &result {
        Ok(()) => tracing::info!(client = %id, room = %room, "client disconnected"),
        Err(e) => tracing::info!(client = %id, room = %room, "client dropped: {}", e),
    }

    result
}
