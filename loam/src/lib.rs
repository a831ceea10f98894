//! # Loam
//!
//! Bidirectional request/response messaging between a web browser and a web
//! server over a single logical channel, with a WebSocket transport and an
//! HTTP long-poll fallback behind one endpoint.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = loam::Server::new(Arc::new(loam::MemoryProvider::new()));
//!     server.set_origin_access("*", true);
//!     server.handle("Echo", |args, _conn| async move { args });
//!     server.on_connect(|conn| async move {
//!         conn.request(json!("Hello"), vec![json!("welcome")]);
//!     });
//!
//!     let app = loam::router(server);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     axum::serve(
//!         listener,
//!         app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await
//!     .unwrap();
//! }
//! ```

mod endpoint;

pub use endpoint::router;

pub use loam_core::{
    BadMessage, CallError, Connection, EntropyError, Handler, Host, Key, MemoryProvider, Message,
    Method, Provider, ProviderError, RequestId, Server, Session, Store, SESSION_COOKIE,
};
pub use loam_fs_storage::FsProvider;
pub use loam_http_long_poll::{RequestKind, CONNECTION_HEADER, REQUEST_TYPE_HEADER};
pub use loam_websocket::Client;
