//! # Loam WebSocket transport
//!
//! Full-duplex transport over WebSocket text frames. Each frame carries one
//! JSON-encoded message; an empty text frame is a ping (and any frame at all
//! is proof of life for the disconnect timer).
//!
//! ## Features
//!
//! - `server` — serve upgraded sockets arriving through the shared [`axum`]
//!   endpoint
//! - `client` — connect out with [`tokio-tungstenite`], with
//!   exponential-backoff reconnection

mod inbound;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

pub mod error;

#[cfg(feature = "client")]
pub use client::Client;

#[cfg(feature = "server")]
pub use server::serve_socket;
