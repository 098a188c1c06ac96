use clap::Parser;
use rdv_common::types::is_valid_room_id;
use std::net::SocketAddr;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "rdvs")]
#[command(about = "Rendezvous signaling relay")]
#[command(version)]
pub struct Args {
    /// Socket address the WebSocket relay listens on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "RDVS_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the room, health and metrics HTTP endpoints.
    #[arg(long, default_value = "127.0.0.1:9090", env = "RDVS_HTTP_ADDR")]
    pub http_addr: SocketAddr,
    /// Maximum concurrent connections.
    #[arg(long, default_value = "10000", env = "RDVS_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum size of one inbound text message in bytes.
    #[arg(long, default_value = "65536", env = "RDVS_MAX_MESSAGE")]
    pub max_message: usize,
    /// Maximum inbound messages per minute per connection.
    #[arg(long, default_value = "600", env = "RDVS_MSG_RATE")]
    pub msg_rate: u32,
    /// Maximum inbound bytes per minute per connection.
    #[arg(long, default_value = "4194304", env = "RDVS_BW_RATE")]
    pub bw_rate: u64,
    /// Depth of each client's outbound message queue.
    #[arg(long, default_value = "256", env = "RDVS_QUEUE_DEPTH")]
    pub queue_depth: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "RDVS_PING_INTERVAL")]
    pub ping_interval: u64,
    /// How long shutdown waits for connection tasks, in seconds.
    #[arg(long, default_value = "10", env = "RDVS_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,
    /// How long a new socket may take to complete the WebSocket upgrade, in seconds.
    #[arg(long, default_value = "10", env = "RDVS_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Lifetime of an unused room reservation in seconds.
    #[arg(long, default_value = "3600", env = "RDVS_ROOM_TTL")]
    pub room_ttl: u64,
    /// Maximum number of live or reserved rooms.
    #[arg(long, default_value = "10000", env = "RDVS_MAX_ROOMS")]
    pub max_rooms: usize,
    /// Room identifiers that are always joinable. Repeat for several.
    #[arg(long = "room", env = "RDVS_ROOMS", value_delimiter = ',')]
    pub rooms: Vec<String>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address the WebSocket relay listens on.
    pub listen: SocketAddr,
    /// Socket address for the HTTP endpoints.
    pub http_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_conns: usize,
    /// Maximum size of one inbound text message in bytes.
    pub max_message: usize,
    /// Maximum inbound messages per minute per connection.
    pub msg_rate: u32,
    /// Maximum inbound bytes per minute per connection.
    pub bw_rate: u64,
    /// Depth of each client's outbound message queue.
    pub queue_depth: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// How long shutdown waits for connection tasks, in seconds.
    pub drain_timeout: u64,
    /// How long a new socket may take to complete the WebSocket upgrade, in seconds.
    pub handshake_timeout: u64,
    /// Lifetime of an unused room reservation in seconds.
    pub room_ttl: u64,
    /// Maximum number of live or reserved rooms.
    pub max_rooms: usize,
    /// Room identifiers that are always joinable.
    pub rooms: Vec<String>,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        const MAX_ALLOWED_MESSAGE: usize = 1_048_576;
        if self.max_message == 0 {
            return Err("max_message must be greater than 0".to_string());
        }
        if self.max_message > MAX_ALLOWED_MESSAGE {
            return Err(format!(
                "max_message exceeds maximum allowed ({MAX_ALLOWED_MESSAGE} bytes)"
            ));
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.bw_rate == 0 {
            return Err("bw_rate must be greater than 0".to_string());
        }
        if self.bw_rate < self.max_message as u64 {
            return Err("bw_rate must allow at least one max_message per minute".to_string());
        }

        if self.queue_depth == 0 {
            return Err("queue_depth must be greater than 0".to_string());
        }
        if self.queue_depth > 65_536 {
            return Err("queue_depth exceeds reasonable limit (65536)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.drain_timeout == 0 {
            return Err("drain_timeout must be greater than 0".to_string());
        }
        if self.drain_timeout > 300 {
            return Err("drain_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > 300 {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.room_ttl == 0 {
            return Err("room_ttl must be greater than 0".to_string());
        }
        if self.room_ttl > 604_800 {
            return Err("room_ttl exceeds reasonable limit (604800 seconds / 1 week)".to_string());
        }

        if self.max_rooms == 0 {
            return Err("max_rooms must be greater than 0".to_string());
        }
        if self.rooms.len() > self.max_rooms {
            return Err("more pre-reserved rooms than max_rooms".to_string());
        }
        if let Some(bad) = self.rooms.iter().find(|r| !is_valid_room_id(r)) {
            return Err(format!("invalid room identifier {bad:?}"));
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            http_addr: args.http_addr,
            max_conns: args.max_conns,
            max_message: args.max_message,
            msg_rate: args.msg_rate,
            bw_rate: args.bw_rate,
            queue_depth: args.queue_depth,
            ping_interval: args.ping_interval,
            drain_timeout: args.drain_timeout,
            handshake_timeout: args.handshake_timeout,
            room_ttl: args.room_ttl,
            max_rooms: args.max_rooms,
            rooms: args.rooms,
        }
    }
}
