//! The server facade.
//!
//! A [`Server`] carries the handler registry and tunables (via [`Host`]),
//! the origin allow-list, the session cache, the live connection list, and
//! the storage provider. The HTTP endpoint itself lives in the transport
//! crates; they resolve cookies to sessions and register connections
//! through this type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::connection::Connection;
use crate::host::Host;
use crate::provider::Provider;
use crate::session::Session;
use crate::store::Store;
use crate::{DEFAULT_SESSION_KEY_SIZE, DEFAULT_SESSION_TIMEOUT_SECS};

/// Name of the HTTP-only cookie carrying the session key.
pub const SESSION_COOKIE: &str = "organics-session";

/// The cryptographic random source failed while generating a key.
#[derive(Debug, Error)]
#[error("entropy source failed: {0}")]
pub struct EntropyError(#[from] getrandom::Error);

struct ServerConfig {
    session_key_size: usize,
    session_timeout: Duration,
}

pub(crate) struct ServerInner {
    host: Host,
    provider: Arc<dyn Provider>,
    sessions: RwLock<HashMap<String, Session>>,
    origins: RwLock<HashSet<String>>,
    connections: RwLock<Vec<Connection>>,
    config: RwLock<ServerConfig>,
}

impl ServerInner {
    pub(crate) fn provider(&self) -> Arc<dyn Provider> {
        self.provider.clone()
    }

    pub(crate) fn session_timeout(&self) -> Duration {
        self.config.read().session_timeout
    }

    pub(crate) fn uncache(&self, session_key: &str) {
        self.sessions.write().remove(session_key);
    }
}

/// The server-side entry point: registry, origin policy, session cache.
///
/// Cheap to clone; clones share the same underlying server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server persisting sessions through `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                host: Host::new(),
                provider,
                sessions: RwLock::new(HashMap::new()),
                origins: RwLock::new(HashSet::new()),
                connections: RwLock::new(Vec::new()),
                config: RwLock::new(ServerConfig {
                    session_key_size: DEFAULT_SESSION_KEY_SIZE,
                    session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
                }),
            }),
        }
    }

    /// The shared registry and tunables.
    #[must_use]
    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// Register `handler` for requests named `name`.
    ///
    /// See [`Host::handle`].
    pub fn handle<F, Fut>(&self, name: impl Into<crate::key::Key>, handler: F)
    where
        F: Fn(Vec<serde_json::Value>, Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<serde_json::Value>> + Send + 'static,
    {
        self.inner.host.handle(name, handler);
    }

    /// Register the connect handler, invoked once per new connection.
    pub fn on_connect<F, Fut>(&self, handler: F)
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.host.on_connect(handler);
    }

    /// Allow or deny an origin. `"*"` means all origins.
    ///
    /// Applies to both CORS preflights and WebSocket `Origin` checks.
    pub fn set_origin_access(&self, origin: impl Into<String>, allowed: bool) {
        let origin = origin.into();
        let mut origins = self.inner.origins.write();
        if allowed {
            origins.insert(origin);
        } else {
            origins.remove(&origin);
        }
    }

    /// Whether `origin` is allowed, honoring a `"*"` wildcard entry.
    #[must_use]
    pub fn origin_access(&self, origin: &str) -> bool {
        let origins = self.inner.origins.read();
        origins.contains("*") || origins.contains(origin)
    }

    /// Every currently allowed origin.
    #[must_use]
    pub fn origins(&self) -> Vec<String> {
        self.inner.origins.read().iter().cloned().collect()
    }

    /// Set the maximum size in bytes of a single encoded message.
    ///
    /// See [`Host::set_max_buffer_size`].
    pub fn set_max_buffer_size(&self, size: usize) {
        self.inner.host.set_max_buffer_size(size);
    }

    /// The maximum size in bytes of a single encoded message.
    #[must_use]
    pub fn max_buffer_size(&self) -> usize {
        self.inner.host.max_buffer_size()
    }

    /// Set the interval of peer inactivity after which a ping is sent.
    pub fn set_ping_rate(&self, rate: Duration) {
        self.inner.host.set_ping_rate(rate);
    }

    /// The interval of peer inactivity after which a ping is sent.
    #[must_use]
    pub fn ping_rate(&self) -> Duration {
        self.inner.host.ping_rate()
    }

    /// Set how long a peer has to answer a ping before its connection is
    /// considered dead.
    pub fn set_ping_timeout(&self, timeout: Duration) {
        self.inner.host.set_ping_timeout(timeout);
    }

    /// How long a peer has to answer a ping before its connection is
    /// considered dead.
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        self.inner.host.ping_timeout()
    }

    /// Set the number of random bytes hashed into session keys.
    pub fn set_session_key_size(&self, size: usize) {
        self.inner.config.write().session_key_size = size;
    }

    /// The number of random bytes hashed into session keys.
    #[must_use]
    pub fn session_key_size(&self) -> usize {
        self.inner.config.read().session_key_size
    }

    /// Set how long a dead session's store is still monitored for late
    /// mutations.
    pub fn set_session_timeout(&self, timeout: Duration) {
        self.inner.config.write().session_timeout = timeout;
    }

    /// How long a dead session's store is still monitored for late
    /// mutations.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        self.inner.config.read().session_timeout
    }

    /// Snapshot of every live server-side connection.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.read().clone()
    }

    /// Kill every live connection; sessions die through the cascade.
    pub async fn kill(&self) {
        for conn in self.connections() {
            conn.kill().await;
        }
    }

    /// Generate a fresh key: `session_key_size` bytes of cryptographic
    /// randomness, SHA-256 hashed, base64 encoded.
    ///
    /// Used for both session cookies and long-poll connection keys (which
    /// double as CSRF tokens).
    ///
    /// # Errors
    ///
    /// Returns [`EntropyError`] when the random source fails.
    pub fn generate_session_key(&self) -> Result<String, EntropyError> {
        let mut buf = vec![0u8; self.session_key_size()];
        getrandom::getrandom(&mut buf)?;
        let digest = Sha256::digest(&buf);
        Ok(BASE64.encode(digest))
    }

    /// Resolve a session key to a session: from the cache, or revived from
    /// the provider.
    ///
    /// A provider failure is treated as "no such session" (and logged).
    pub async fn session_for_key(&self, session_key: &str) -> Option<Session> {
        if let Some(session) = self.inner.sessions.read().get(session_key).cloned() {
            return Some(session);
        }

        match self.inner.provider.load(session_key).await {
            Ok(Some(store)) => {
                let session =
                    Session::spawn(session_key.to_owned(), Arc::downgrade(&self.inner), store);
                self.inner
                    .sessions
                    .write()
                    .insert(session_key.to_owned(), session.clone());
                tracing::info!(session = %session, "session revived from provider");
                Some(session)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::error!(error = %err, "provider load failed, treating as unknown session");
                None
            }
        }
    }

    /// Resolve the session for `cookie`, creating a fresh one when the
    /// cookie is absent or stale.
    ///
    /// Returns the session and, when one was created, the new key the
    /// caller must set as the session cookie.
    ///
    /// # Errors
    ///
    /// Returns [`EntropyError`] when key generation fails.
    pub async fn ensure_session(
        &self,
        cookie: Option<&str>,
    ) -> Result<(Session, Option<String>), EntropyError> {
        if let Some(value) = cookie {
            if let Some(session) = self.session_for_key(value).await {
                if !session.dead() {
                    return Ok((session, None));
                }
            }
        }

        let key = self.generate_session_key()?;
        let session = Session::spawn(key.clone(), Arc::downgrade(&self.inner), Store::new());
        self.inner.sessions.write().insert(key.clone(), session.clone());
        tracing::info!(session = %session, "session created");
        Ok((session, Some(key)))
    }

    /// Record a newly established connection: add it to the live list (and
    /// remove it again on death) and fire the connect handler.
    pub fn register_connection(&self, conn: Connection) {
        tracing::info!(connection = %conn, "connected");
        self.inner.connections.write().push(conn.clone());

        if let Some(notify) = conn.death_notify() {
            let inner = Arc::downgrade(&self.inner);
            let departed = conn.clone();
            tokio::spawn(async move {
                let _ = notify.await;
                if let Some(inner) = inner.upgrade() {
                    inner.connections.write().retain(|c| c != &departed);
                }
            });
        }

        if let Some(handler) = self.inner.host.connect_handler() {
            let fut = handler(conn);
            tokio::spawn(async move {
                // Inner spawn is the panic boundary for the handler body.
                if let Err(err) = tokio::spawn(fut).await {
                    if err.is_panic() {
                        tracing::error!("connect handler panicked; expected fn(Connection)");
                    }
                }
            });
        }
    }

    pub(crate) fn cached(&self, session_key: &str) -> bool {
        self.inner.sessions.read().contains_key(session_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Method;
    use crate::provider::{MemoryProvider, Provider};
    use serde_json::json;

    fn test_server() -> Server {
        Server::new(Arc::new(MemoryProvider::new()))
    }

    #[test]
    fn session_keys_are_base64_sha256_digests() {
        let server = test_server();
        let a = server.generate_session_key().expect("key");
        let b = server.generate_session_key().expect("key");

        // SHA-256 digests are 32 bytes: 44 base64 characters.
        assert_eq!(a.len(), 44);
        assert!(BASE64.decode(&a).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn origin_wildcard_allows_everything() {
        let server = test_server();
        assert!(!server.origin_access("http://example.com"));

        server.set_origin_access("http://example.com", true);
        assert!(server.origin_access("http://example.com"));
        assert!(!server.origin_access("http://other.com"));

        server.set_origin_access("*", true);
        assert!(server.origin_access("http://other.com"));

        server.set_origin_access("*", false);
        assert!(!server.origin_access("http://other.com"));
    }

    #[tokio::test]
    async fn ensure_session_reuses_live_sessions() {
        let server = test_server();
        let (first, cookie) = server.ensure_session(None).await.expect("create");
        let key = cookie.expect("fresh cookie");

        let (second, cookie) = server.ensure_session(Some(&key)).await.expect("resolve");
        assert!(cookie.is_none(), "existing session needs no new cookie");
        assert!(first == second);
    }

    #[tokio::test]
    async fn stale_cookie_gets_a_fresh_session() {
        let server = test_server();
        let (_session, _cookie) = server.ensure_session(None).await.expect("create");

        let (other, cookie) = server
            .ensure_session(Some("no-such-session"))
            .await
            .expect("create");
        assert!(cookie.is_some(), "unknown cookie must be replaced");
        assert!(!other.dead());
    }

    #[tokio::test]
    async fn sessions_revive_from_the_provider() {
        let provider = Arc::new(MemoryProvider::new());
        let server = Server::new(provider.clone());

        let store = Store::new();
        store.set("carried", json!("over"));
        provider
            .save("stored-key", None, &store)
            .await
            .expect("seed provider");

        let session = server
            .session_for_key("stored-key")
            .await
            .expect("revived session");
        assert_eq!(
            session.store().get(&"carried".into()),
            Some(json!("over"))
        );
    }

    #[tokio::test]
    async fn dead_connections_leave_the_live_list() {
        let server = test_server();
        let (session, _) = server.ensure_session(None).await.expect("session");

        let conn = Connection::new_server("127.0.0.1:1", Method::LongPolling, &session, "k");
        conn.spawn_death_task(false, async {});
        server.register_connection(conn.clone());
        assert_eq!(server.connections().len(), 1);

        conn.kill().await;
        tokio::task::yield_now().await;
        assert!(server.connections().is_empty());
    }

    #[tokio::test]
    async fn connect_handler_fires_per_connection() {
        let server = test_server();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.on_connect(move |conn| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(conn.address().to_owned());
            }
        });

        let (session, _) = server.ensure_session(None).await.expect("session");
        let conn = Connection::new_server("10.0.0.1:9", Method::WebSocket, &session, "k");
        conn.spawn_death_task(false, async {});
        server.register_connection(conn);

        assert_eq!(rx.recv().await.as_deref(), Some("10.0.0.1:9"));
    }
}
