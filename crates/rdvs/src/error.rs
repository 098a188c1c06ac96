use thiserror::Error;

/// Errors that tear down a single relay connection.
#[derive(Error, Debug)]
pub enum RdvsError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer did not finish the WebSocket upgrade in time.
    #[error("websocket upgrade timed out after {0}s")]
    HandshakeTimeout(u64),
    /// The relay is shutting down and no longer registers clients.
    #[error("relay is shutting down")]
    Closing,
    /// The configured connection limit has been reached.
    #[error("connection limit reached ({0})")]
    AtCapacity(usize),
}
