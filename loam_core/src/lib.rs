//! # Loam
//!
//! Bidirectional request/response messaging between a web browser and a web
//! server over a single logical channel. Either endpoint may issue a named
//! request carrying JSON arguments; the peer may answer with a response
//! correlated by id.
//!
//! This crate holds the transport-agnostic core: the wire codec, the
//! change-notifying [`Store`], the [`Connection`] lifecycle machinery, the
//! [`Session`] ownership graph, and the [`Server`] facade. The transports
//! themselves live in `loam_websocket` and `loam_http_long_poll`.

pub mod connection;
pub mod dispatch;
pub mod host;
pub mod key;
pub mod message;
pub mod provider;
pub mod server;
pub mod session;
pub mod store;
pub mod wire;

pub use connection::{CallError, Connection, Method};
pub use host::{Handler, Host};
pub use key::Key;
pub use message::{BadMessage, Message, RequestId};
pub use provider::{MemoryProvider, Provider, ProviderError};
pub use server::{EntropyError, Server, SESSION_COOKIE};
pub use session::Session;
pub use store::Store;

/// Default maximum size in bytes of a single encoded message (1 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of cryptographically random bytes hashed into a session key.
pub const DEFAULT_SESSION_KEY_SIZE: usize = 64;

/// Default interval of peer inactivity before a ping is sent (5 minutes).
pub const DEFAULT_PING_RATE_SECS: u64 = 5 * 60;

/// Default time a peer has to answer a ping before the connection is
/// considered dead (30 seconds).
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 30;

/// Default window after a session's death during which late store mutations
/// are still persisted (30 seconds).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 30;
