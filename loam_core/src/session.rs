//! Sessions: the connection sets behind one cookie.
//!
//! A [`Session`] owns every connection a browser currently has open (one per
//! tab, any transport) plus the store persisted for it. Requests fan out to
//! all live connections. The session dies when its last connection dies;
//! death cascades *downward* only — a dying connection removes itself from
//! the session, and the session observes emptiness and dies on its own.
//!
//! After death a session keeps persisting late store mutations for one
//! grace window (handlers may still be finishing), then detaches from the
//! server.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::server::ServerInner;
use crate::store::Store;
use crate::DEFAULT_SESSION_TIMEOUT_SECS;

pub(crate) struct SessionInner {
    key: String,
    store: Store,
    server: RwLock<Option<Weak<ServerInner>>>,
    connections: RwLock<HashMap<String, Connection>>,

    dead: AtomicBool,
    death_wanted: CancellationToken,
    death_completed: CancellationToken,
    death_subscribers: Mutex<Vec<oneshot::Sender<()>>>,

    /// Trips when the persistence task should begin its grace window.
    stop_saving: CancellationToken,
}

/// A set of connections sharing one session cookie and one store.
///
/// Cheap to clone; clones share the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session and start its death and persistence tasks.
    pub(crate) fn spawn(key: String, server: Weak<ServerInner>, store: Store) -> Self {
        let session = Self {
            inner: Arc::new(SessionInner {
                key,
                store,
                server: RwLock::new(Some(server)),
                connections: RwLock::new(HashMap::new()),
                dead: AtomicBool::new(false),
                death_wanted: CancellationToken::new(),
                death_completed: CancellationToken::new(),
                death_subscribers: Mutex::new(Vec::new()),
                stop_saving: CancellationToken::new(),
            }),
        };

        tokio::spawn(session.clone().death_task());
        tokio::spawn(session.clone().persistence_task());
        session
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    /// The session key (the cookie value).
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The session's store.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Whether this session is dead. Death is terminal.
    #[must_use]
    pub fn dead(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }

    /// A single-shot channel that fires once this session is dead.
    ///
    /// Unlike [`Connection::death_notify`], an already-dead session still
    /// returns a channel, with the notification already delivered.
    #[must_use]
    pub fn death_notify(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.dead() {
            let _ = tx.send(());
        } else {
            self.inner.death_subscribers.lock().push(tx);
        }
        rx
    }

    /// Kill this session: every connection representing it is killed as
    /// well. Blocks until the cascade has finished. No-op when already dead.
    pub async fn kill(&self) {
        if self.dead() {
            return;
        }
        self.inner.death_wanted.cancel();
        self.inner.death_completed.cancelled().await;
    }

    /// Snapshot of the live connections, empty when the session is dead.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        if self.dead() {
            return Vec::new();
        }
        self.inner.connections.read().values().cloned().collect()
    }

    /// The connection registered under `conn_key`, if any.
    #[must_use]
    pub fn connection(&self, conn_key: &str) -> Option<Connection> {
        self.inner.connections.read().get(conn_key).cloned()
    }

    /// Make a request on every connection currently representing this
    /// session.
    pub fn request(&self, name: Value, args: Vec<Value>) {
        for conn in self.connections() {
            conn.request(name.clone(), args.clone());
        }
    }

    pub(crate) fn add_connection(&self, conn_key: String, conn: Connection) {
        self.inner.connections.write().insert(conn_key, conn);
    }

    /// Remove a connection; when the set becomes empty there is nothing
    /// left to represent this session, so it kills itself.
    ///
    /// During a session-initiated cascade the kill is already in flight —
    /// re-entering it from the last dying connection would deadlock the
    /// cascade against itself.
    pub(crate) async fn remove_connection(&self, conn_key: &str) {
        let now_empty = {
            let mut connections = self.inner.connections.write();
            connections.remove(conn_key);
            connections.is_empty()
        };

        if now_empty && !self.inner.death_wanted.is_cancelled() {
            self.kill().await;
        }
    }

    fn server(&self) -> Option<Arc<ServerInner>> {
        self.inner.server.read().as_ref().and_then(Weak::upgrade)
    }

    /// Drive the death cascade: kill the connections, flush the store, and
    /// detach from the server cache.
    async fn death_task(self) {
        self.inner.death_wanted.cancelled().await;

        for conn in self.connections() {
            conn.kill().await;
        }

        self.inner.dead.store(true, Ordering::SeqCst);
        let subscribers = std::mem::take(&mut *self.inner.death_subscribers.lock());
        for tx in subscribers {
            let _ = tx.send(());
        }

        if let Some(server) = self.server() {
            let provider = server.provider();
            for key in self.inner.store.keys() {
                if let Err(err) = provider
                    .save(&self.inner.key, Some(&key), &self.inner.store)
                    .await
                {
                    tracing::error!(error = %err, "final session save failed");
                }
            }
            server.uncache(&self.inner.key);
        }

        tracing::info!(session = %self, "session dead");
        self.inner.death_completed.cancel();
        self.inner.stop_saving.cancel();
    }

    /// Persist the store on every change; after death, keep saving through
    /// one grace window so late-finishing handlers are not lost.
    async fn persistence_task(self) {
        let (watcher_id, mut changes) = self.inner.store.change_watcher();

        'live: loop {
            tokio::select! {
                changed = changes.recv() => match changed {
                    Some(key) => self.save_change(&key).await,
                    None => break 'live,
                },
                () = self.inner.stop_saving.cancelled() => {
                    let grace = self
                        .server()
                        .map_or(Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS), |s| {
                            s.session_timeout()
                        });
                    let deadline = tokio::time::sleep(grace);
                    tokio::pin!(deadline);

                    loop {
                        tokio::select! {
                            changed = changes.recv() => match changed {
                                Some(key) => self.save_change(&key).await,
                                None => break,
                            },
                            () = &mut deadline => break,
                        }
                    }
                    break 'live;
                }
            }
        }

        self.inner.store.remove_change_watcher(watcher_id);
        *self.inner.server.write() = None;
    }

    async fn save_change(&self, key: &crate::key::Key) {
        let Some(server) = self.server() else {
            return;
        };
        if let Err(err) = server
            .provider()
            .save(&self.inner.key, Some(key), &self.inner.store)
            .await
        {
            tracing::error!(error = %err, "session save failed");
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Store contents stay out of logs; only the length is shown.
        write!(
            f,
            "Session(Store.len={}, Dead={})",
            self.inner.store.len(),
            self.dead()
        )
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Method;
    use crate::message::{Message, RequestId};
    use crate::provider::{MemoryProvider, Provider};
    use crate::server::Server;
    use serde_json::json;

    fn test_server() -> Server {
        Server::new(Arc::new(MemoryProvider::new()))
    }

    async fn establish(server: &Server) -> Session {
        let (session, _cookie) = server.ensure_session(None).await.expect("session");
        session
    }

    fn attach(session: &Session, key: &str) -> Connection {
        let conn = Connection::new_server("127.0.0.1:1", Method::LongPolling, session, key);
        conn.spawn_death_task(false, async {});
        conn
    }

    #[tokio::test]
    async fn fans_out_requests_to_every_connection() {
        let server = test_server();
        let session = establish(&server).await;
        let a = attach(&session, "a");
        let b = attach(&session, "b");

        session.request(json!("T"), vec![json!(1)]);

        for conn in [&a, &b] {
            let msg = conn.outbound().recv().await.expect("fan-out message");
            assert_eq!(
                msg,
                Message::request(RequestId::NONE, json!("T"), vec![json!(1)])
            );
        }
    }

    #[tokio::test]
    async fn dies_when_last_connection_dies() {
        let server = test_server();
        let session = establish(&server).await;
        let a = attach(&session, "a");
        let b = attach(&session, "b");

        let death = session.death_notify();

        a.kill().await;
        assert!(!session.dead(), "one connection still represents the session");

        b.kill().await;
        death.await.expect("session death notification");
        assert!(session.dead());
        assert!(session.connections().is_empty());
    }

    #[tokio::test]
    async fn kill_cascades_to_connections() {
        let server = test_server();
        let session = establish(&server).await;
        let a = attach(&session, "a");
        let b = attach(&session, "b");

        session.kill().await;
        assert!(a.dead());
        assert!(b.dead());
        assert!(session.dead());
    }

    #[tokio::test]
    async fn death_notify_fires_immediately_on_dead_session() {
        let server = test_server();
        let session = establish(&server).await;
        let conn = attach(&session, "a");
        conn.kill().await;

        session.death_notify().await.expect("already-dead notification");
    }

    #[tokio::test]
    async fn request_on_dead_session_is_noop() {
        let server = test_server();
        let session = establish(&server).await;
        let conn = attach(&session, "a");
        let outbound = conn.outbound();
        conn.kill().await;

        session.request(json!("T"), vec![]);
        tokio::task::yield_now().await;
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn death_uncaches_from_server() {
        let server = test_server();
        let (session, cookie) = server.ensure_session(None).await.expect("session");
        let key = cookie.expect("fresh session has a new cookie");
        assert!(server.session_for_key(&key).await.is_some());

        let conn = attach(&session, "a");
        conn.kill().await;

        // A dead session is no longer served from the cache; the provider
        // copy (if any) would be loaded into a fresh session instead.
        assert!(!server.cached(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn persists_store_changes_and_honors_grace_window() {
        let provider = Arc::new(MemoryProvider::new());
        let server = Server::new(provider.clone());
        server.set_session_timeout(Duration::from_millis(100));

        let (session, cookie) = server.ensure_session(None).await.expect("session");
        let key = cookie.expect("fresh cookie");
        let conn = attach(&session, "a");

        // A live mutation reaches the provider.
        session.store().set("name", json!("ada"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let saved = provider.load(&key).await.expect("load").expect("saved");
        assert_eq!(saved.get(&"name".into()), Some(json!("ada")));

        conn.kill().await;
        assert!(session.dead());

        // Within the grace window late mutations are still persisted.
        session.store().set("late", json!(true));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let saved = provider.load(&key).await.expect("load").expect("saved");
        assert_eq!(saved.get(&"late".into()), Some(json!(true)));

        // After the window the session has detached; further mutations are
        // no longer persisted.
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.store().set("too-late", json!(true));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let saved = provider.load(&key).await.expect("load").expect("saved");
        assert_eq!(saved.get(&"too-late".into()), None);
    }
}
