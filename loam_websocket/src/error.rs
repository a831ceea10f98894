//! Error types for the WebSocket transport.

use thiserror::Error;

/// A problem while establishing or running a client connection.
#[cfg(feature = "client")]
#[derive(Debug, Error)]
pub enum ClientError {
    /// The establish (`wsec`) HTTP request failed.
    #[error("establish request error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered the establish request with an error status.
    #[error("establish rejected with status {0}")]
    EstablishRejected(u16),

    /// The server set no session cookie during establish.
    #[error("no session cookie in establish response")]
    MissingCookie,

    /// The WebSocket handshake or stream failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The configured URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// No connection is currently established.
    #[error("not connected")]
    NotConnected,
}
