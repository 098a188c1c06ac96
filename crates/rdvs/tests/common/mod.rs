#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use rdvs::config::ServerConfig;
use rdvs::server::ServerState;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        http_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_message: 65_536,
        msg_rate: 600,
        bw_rate: 4_194_304,
        queue_depth: 256,
        ping_interval: 30,
        drain_timeout: 2,
        handshake_timeout: 10,
        room_ttl: 3600,
        max_rooms: 100,
        rooms: vec!["lobby".into()],
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<WsStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<WsStream>,
    pub id: String,
    pub room: String,
}

impl TestClient {
    /// Connect to the default room and learn our identity from the first
    /// `user_list` that names us (sent to the other members).
    pub async fn connect(addr: &SocketAddr) -> Self {
        Self::connect_path(addr, "/").await
    }

    pub async fn connect_room(addr: &SocketAddr, room: &str) -> Self {
        Self::connect_path(addr, &format!("/?room={room}")).await
    }

    async fn connect_path(addr: &SocketAddr, path: &str) -> Self {
        let url = format!("ws://{addr}{path}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        let mut client = Self {
            ws_tx,
            ws_rx,
            id: String::new(),
            room: String::new(),
        };
        let first = client.recv_type("user_list").await;
        client.room = first["room_id"].as_str().unwrap().to_owned();
        client
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_owned()))
            .await
            .unwrap();
    }

    pub async fn send_binary(&mut self, data: &[u8]) {
        self.ws_tx
            .send(Message::Binary(data.to_vec()))
            .await
            .unwrap();
    }

    /// Next text frame as raw text, skipping control frames.
    pub async fn recv_text(&mut self) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for message")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return text,
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_json(&mut self) -> Value {
        serde_json::from_str(&self.recv_text().await).unwrap()
    }

    /// Next message of the given type, skipping others.
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let value = self.recv_json().await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    /// Next text frame within `timeout`, if any.
    pub async fn recv_text_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.recv_text()).await.ok()
    }

    /// Ask for the current room listing and return the user ids.
    pub async fn get_users(&mut self) -> Vec<String> {
        self.send_json(&serde_json::json!({"type": "get_users"}))
            .await;
        let list = self.recv_type("user_list").await;
        users(&list)
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for close")
            {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    }
}

pub fn users(list: &Value) -> Vec<String> {
    list["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u.as_str().unwrap().to_owned())
        .collect()
}

/// Connect two clients to the same room and fill in their identities from
/// the presence updates each one receives.
pub async fn connect_pair(addr: &SocketAddr, room: Option<&str>) -> (TestClient, TestClient) {
    let mut a = match room {
        Some(room) => TestClient::connect_room(addr, room).await,
        None => TestClient::connect(addr).await,
    };
    let mut b = match room {
        Some(room) => TestClient::connect_room(addr, room).await,
        None => TestClient::connect(addr).await,
    };
    let seen_by_a = a.recv_type("user_list").await;
    b.id = users(&seen_by_a).pop().unwrap();
    a.id = b.get_users().await.pop().unwrap();
    (a, b)
}

/// Open a TCP connection that never sends an upgrade request.
pub async fn raw_socket(addr: &SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

/// Returns `true` if the server closes `stream` within `wait`.
pub async fn closed_within(stream: &mut TcpStream, wait: Duration) -> bool {
    let mut buf = [0u8; 256];
    matches!(
        tokio::time::timeout(wait, stream.read(&mut buf)).await,
        Ok(Ok(0) | Err(_))
    )
}

/// Wait until exactly `n` sockets are mid-upgrade on the server.
pub async fn wait_for_handshakes(state: &ServerState, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.handshakes_in_flight() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {n} pending handshakes, have {}",
            state.handshakes_in_flight()
        )
    });
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = test_config(addr);
        tweak(&mut config);
        let state = Arc::new(ServerState::new(config).unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state_clone = state.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = rdvs::run_with_shutdown(listener, state_clone, shutdown_rx).await {
                eprintln!("server error in test: {e}");
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            state,
            shutdown_tx,
            handle,
        }
    }

    /// Trigger shutdown and wait for the server task to finish.
    pub async fn shutdown(self) {
        self.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not shut down")
            .unwrap();
    }
}
