//! The transport-agnostic connection core.
//!
//! A [`Connection`] is a single logical channel to one peer (one browser
//! tab) over one transport. It owns the pending-request table, the outbound
//! message queue, the ping timer, and the death machinery; the transports
//! in `loam_websocket` and `loam_http_long_poll` pump bytes in and out of
//! it.
//!
//! Lifecycle:
//!
//! ```text
//!  ALIVE ──death-wanted──► DYING ──death-observed──► DEAD
//!    │                       ▲
//!    └──ping-timeout / transport-error──┘
//! ```
//!
//! Any of [`Connection::kill`], a ping timeout, or a transport error moves
//! the connection to DYING; the transport's death task then fans out death
//! notifications, de-registers from the owning session, runs its own
//! cleanup, and releases any caller blocked in `kill`. Death is terminal.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::message::{Message, RequestId};
use crate::session::{Session, SessionInner};
use crate::store::Store;

/// The transport carrying a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// HTTP long-polling.
    LongPolling,
    /// WebSocket.
    WebSocket,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LongPolling => write!(f, "LongPolling"),
            Self::WebSocket => write!(f, "WebSocket"),
        }
    }
}

/// A problem while waiting for a response via [`Connection::call`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CallError {
    /// The connection (or its session) died before the response arrived.
    #[error("connection dead")]
    ConnectionDead,
}

/// A completion callback, invoked with the response arguments.
pub type Completer = Box<dyn FnOnce(Vec<Value>) + Send + 'static>;

/// Registration of a server-side connection with its owning session.
struct SessionRegistration {
    session: Weak<SessionInner>,
    conn_key: String,
}

struct ConnectionInner {
    address: String,
    method: Method,
    registration: Option<SessionRegistration>,
    store: Store,

    dead: AtomicBool,
    death_wanted: CancellationToken,
    death_completed: CancellationToken,
    death_subscribers: Mutex<Vec<oneshot::Sender<()>>>,

    completers: Mutex<HashMap<RequestId, Completer>>,
    next_id: Mutex<i64>,

    outbound_tx: async_channel::Sender<Message>,
    outbound_rx: async_channel::Receiver<Message>,

    ping_due_tx: async_channel::Sender<()>,
    ping_due_rx: async_channel::Receiver<()>,
    ping_timeout_tx: async_channel::Sender<()>,
    ping_timeout_rx: async_channel::Receiver<()>,
    timer_reset_tx: async_channel::Sender<()>,
    timer_reset_rx: async_channel::Receiver<()>,

    timer_started: AtomicBool,
    death_task_started: AtomicBool,
}

/// A single logical channel to one peer over one transport.
///
/// Cheap to clone; clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    fn new(address: String, method: Method, registration: Option<SessionRegistration>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::bounded(1);
        let (ping_due_tx, ping_due_rx) = async_channel::bounded(1);
        let (ping_timeout_tx, ping_timeout_rx) = async_channel::bounded(1);
        let (timer_reset_tx, timer_reset_rx) = async_channel::bounded(1);

        Self {
            inner: Arc::new(ConnectionInner {
                address,
                method,
                registration,
                store: Store::new(),
                dead: AtomicBool::new(false),
                death_wanted: CancellationToken::new(),
                death_completed: CancellationToken::new(),
                death_subscribers: Mutex::new(Vec::new()),
                completers: Mutex::new(HashMap::new()),
                next_id: Mutex::new(0),
                outbound_tx,
                outbound_rx,
                ping_due_tx,
                ping_due_rx,
                ping_timeout_tx,
                ping_timeout_rx,
                timer_reset_tx,
                timer_reset_rx,
                timer_started: AtomicBool::new(false),
                death_task_started: AtomicBool::new(false),
            }),
        }
    }

    /// Create a server-side connection and register it with `session` under
    /// `conn_key`.
    #[must_use]
    pub fn new_server(
        address: impl Into<String>,
        method: Method,
        session: &Session,
        conn_key: impl Into<String>,
    ) -> Self {
        let conn_key = conn_key.into();
        let conn = Self::new(
            address.into(),
            method,
            Some(SessionRegistration {
                session: session.downgrade(),
                conn_key: conn_key.clone(),
            }),
        );
        session.add_connection(conn_key, conn.clone());
        conn
    }

    /// Create a client-side connection, which has no owning session.
    #[must_use]
    pub fn new_client(address: impl Into<String>, method: Method) -> Self {
        Self::new(address.into(), method, None)
    }

    /// The remote address, for logging.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// The transport carrying this connection.
    #[must_use]
    pub fn method(&self) -> Method {
        self.inner.method
    }

    /// The owning session, if this is a server-side connection and the
    /// session is still around.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.inner
            .registration
            .as_ref()
            .and_then(|r| r.session.upgrade())
            .map(Session::from_inner)
    }

    /// Per-connection storage.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Whether this connection is dead. Death is terminal.
    #[must_use]
    pub fn dead(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }

    /// A single-shot channel that fires once the connection is dead, or
    /// `None` when it already is.
    #[must_use]
    pub fn death_notify(&self) -> Option<oneshot::Receiver<()>> {
        if self.dead() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.inner.death_subscribers.lock().push(tx);
        Some(rx)
    }

    /// Kill this connection and wait until its death task has finished the
    /// terminal cleanup. No-op when already dead.
    pub async fn kill(&self) {
        if self.dead() {
            return;
        }
        self.inner.death_wanted.cancel();
        self.inner.death_completed.cancelled().await;
    }

    /// Token cancelled when death is requested (the DYING transition).
    ///
    /// Transport loops select on this alongside their I/O.
    #[must_use]
    pub fn death_wanted(&self) -> CancellationToken {
        self.inner.death_wanted.clone()
    }

    /// Make a fire-and-forget request: no response is expected, so the wire
    /// id is `-1`.
    ///
    /// No-op when this connection or its session is dead.
    pub fn request(&self, name: Value, args: Vec<Value>) {
        if self.target_dead() {
            return;
        }
        self.submit(Message::request(RequestId::NONE, name, args));
    }

    /// Make a request, invoking `on_complete` with the response arguments
    /// when the peer answers.
    ///
    /// No-op when this connection or its session is dead.
    pub fn request_with(
        &self,
        name: Value,
        args: Vec<Value>,
        on_complete: impl FnOnce(Vec<Value>) + Send + 'static,
    ) {
        if self.target_dead() {
            return;
        }
        let id = self.next_request_id();
        self.inner.completers.lock().insert(id, Box::new(on_complete));
        self.submit(Message::request(id, name, args));
    }

    /// Make a request and wait for the response arguments.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::ConnectionDead`] when the connection (or its
    /// session) is dead, or dies before the response arrives.
    pub async fn call(&self, name: Value, args: Vec<Value>) -> Result<Vec<Value>, CallError> {
        if self.target_dead() {
            return Err(CallError::ConnectionDead);
        }

        let (tx, rx) = oneshot::channel();
        self.request_with(name, args, move |args| {
            let _ = tx.send(args);
        });

        tokio::select! {
            res = rx => res.map_err(|_| CallError::ConnectionDead),
            () = self.inner.death_wanted.cancelled() => Err(CallError::ConnectionDead),
        }
    }

    /// Whether the request target (this connection, or its session) is dead.
    fn target_dead(&self) -> bool {
        if self.dead() {
            return true;
        }
        match &self.inner.registration {
            Some(reg) => match reg.session.upgrade() {
                Some(session) => Session::from_inner(session).dead(),
                // The session is gone entirely; nothing left to talk to.
                None => true,
            },
            None => false,
        }
    }

    /// Allocate the next outbound request id, skipping the `-1` sentinel.
    fn next_request_id(&self) -> RequestId {
        let mut next = self.inner.next_id.lock();
        let id = *next;
        *next = next.wrapping_add(1);
        if *next == -1 {
            *next = next.wrapping_add(1);
        }
        RequestId::from_raw(id)
    }

    /// Queue a message, racing the death signal from a background task so
    /// the caller never blocks on a peer that stops polling.
    fn submit(&self, msg: Message) {
        let tx = self.inner.outbound_tx.clone();
        let death = self.inner.death_wanted.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = tx.send(msg) => {
                    if res.is_err() {
                        tracing::debug!("outbound queue closed before send");
                    }
                }
                () = death.cancelled() => {}
            }
        });
    }

    /// Send a message on the outbound queue, racing death.
    ///
    /// Returns `true` when the message was handed to the transport.
    pub async fn submit_outbound(&self, msg: Message) -> bool {
        tokio::select! {
            res = self.inner.outbound_tx.send(msg) => res.is_ok(),
            () = self.inner.death_wanted.cancelled() => false,
        }
    }

    /// Remove and return the completer registered under `id`, if any.
    #[must_use]
    pub fn take_completer(&self, id: RequestId) -> Option<Completer> {
        self.inner.completers.lock().remove(&id)
    }

    /// The outbound message queue consumer, for transports. Each clone is an
    /// independent competing consumer.
    #[must_use]
    pub fn outbound(&self) -> async_channel::Receiver<Message> {
        self.inner.outbound_rx.clone()
    }

    /// The outbound message queue producer, for transports that submit
    /// replies with their own cancellation race.
    #[must_use]
    pub fn outbound_sender(&self) -> async_channel::Sender<Message> {
        self.inner.outbound_tx.clone()
    }

    /// Fires when the ping timer decides the peer should be pinged.
    #[must_use]
    pub fn ping_due(&self) -> async_channel::Receiver<()> {
        self.inner.ping_due_rx.clone()
    }

    /// Fires when the peer failed to answer a ping in time.
    ///
    /// The WebSocket death task consumes this directly; a waiting long-poll
    /// request consumes it to answer 408 before killing the connection.
    #[must_use]
    pub fn ping_timeout_fired(&self) -> async_channel::Receiver<()> {
        self.inner.ping_timeout_rx.clone()
    }

    /// Record observable peer activity, pushing the disconnect timer back.
    pub fn reset_disconnect_timer(&self) {
        let _ = self.inner.timer_reset_tx.try_send(());
    }

    /// Start the ping timer: after `rate` of silence a ping is requested;
    /// no activity within a further `timeout` fires the timeout signal.
    ///
    /// Starts at most one timer per connection.
    pub fn spawn_ping_timer(&self, rate: Duration, timeout: Duration) {
        if self.inner.timer_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = self.inner.clone();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = inner.death_wanted.cancelled() => return,
                    _ = inner.timer_reset_rx.recv() => continue,
                    () = tokio::time::sleep(rate) => {
                        let _ = inner.ping_due_tx.try_send(());
                        tokio::select! {
                            () = inner.death_wanted.cancelled() => return,
                            _ = inner.timer_reset_rx.recv() => continue,
                            () = tokio::time::sleep(timeout) => {
                                tracing::warn!(connection = %this, "ping timeout");
                                let _ = inner.ping_timeout_tx.try_send(());
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawn the death task that drives DYING → DEAD.
    ///
    /// The task waits for a death request (and, when `watch_ping_timeout`
    /// is set, for the ping timeout — WebSocket transports die directly on
    /// timeout, while long-poll leaves the signal to the waiting poll).
    /// It then marks the connection dead, fans out death notifications,
    /// de-registers from the owning session, runs the transport `cleanup`,
    /// and finally releases callers blocked in [`Connection::kill`].
    ///
    /// Spawns at most one task per connection.
    pub fn spawn_death_task<F>(&self, watch_ping_timeout: bool, cleanup: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.inner.death_task_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = self.inner.clone();
        let this = self.clone();
        tokio::spawn(async move {
            if watch_ping_timeout {
                tokio::select! {
                    () = inner.death_wanted.cancelled() => {}
                    _ = inner.ping_timeout_rx.recv() => {}
                }
            } else {
                inner.death_wanted.cancelled().await;
            }

            // The timeout path skips `kill`; make sure everything selecting
            // on the death signal wakes up.
            inner.death_wanted.cancel();
            inner.dead.store(true, Ordering::SeqCst);

            let subscribers = std::mem::take(&mut *inner.death_subscribers.lock());
            for tx in subscribers {
                let _ = tx.send(());
            }

            if let Some(reg) = &inner.registration {
                if let Some(session) = reg.session.upgrade() {
                    Session::from_inner(session)
                        .remove_connection(&reg.conn_key)
                        .await;
                }
            }

            cleanup.await;

            tracing::info!(connection = %this, "connection dead");
            inner.death_completed.cancel();
        });
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Store contents stay out of logs; only the length is shown.
        write!(
            f,
            "Connection({}, Store.len={}, Dead={}, Method={})",
            self.inner.address,
            self.inner.store.len(),
            self.dead(),
            self.inner.method,
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn test_conn() -> Connection {
        let conn = Connection::new_client("127.0.0.1:1", Method::WebSocket);
        conn.spawn_death_task(false, async {});
        conn
    }

    #[tokio::test]
    async fn allocates_unique_ids_skipping_sentinel() {
        let conn = test_conn();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = conn.next_request_id();
            assert!(!id.is_none(), "allocator must never produce -1");
            assert!(seen.insert(id), "allocator must never repeat an id");
        }
    }

    #[tokio::test]
    async fn id_allocation_skips_minus_one_on_wrap() {
        let conn = test_conn();
        *conn.inner.next_id.lock() = -2;

        let before_wrap = conn.next_request_id();
        assert_eq!(before_wrap.raw(), -2);

        // -1 was skipped entirely.
        let after_wrap = conn.next_request_id();
        assert_eq!(after_wrap.raw(), 0);
    }

    #[tokio::test]
    async fn request_with_queues_allocated_id_and_registers_completer() {
        let conn = test_conn();
        let outbound = conn.outbound();

        conn.request_with(json!("Ping"), vec![json!(42)], |_| {});

        let msg = outbound.recv().await.expect("queued message");
        assert_eq!(
            msg,
            Message::request(RequestId::from_raw(0), json!("Ping"), vec![json!(42)])
        );
        assert!(conn.take_completer(RequestId::from_raw(0)).is_some());
    }

    #[tokio::test]
    async fn plain_request_uses_sentinel_id() {
        let conn = test_conn();
        let outbound = conn.outbound();

        conn.request(json!("Notify"), vec![json!("x")]);

        let msg = outbound.recv().await.expect("queued message");
        assert_eq!(msg.id(), RequestId::NONE);
    }

    #[tokio::test]
    async fn completer_fires_exactly_once() {
        let conn = test_conn();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        conn.request_with(json!("Ping"), vec![], move |args| {
            let _ = tx.send(args);
        });
        let _ = conn.outbound().recv().await;

        let id = RequestId::from_raw(0);
        if let Some(completer) = conn.take_completer(id) {
            completer(vec![json!(43)]);
        }
        assert_eq!(rx.recv().await, Some(vec![json!(43)]));

        // Second arrival with the same id: the table entry is gone.
        assert!(conn.take_completer(id).is_none());
    }

    #[tokio::test]
    async fn kill_is_terminal_and_idempotent() {
        let conn = test_conn();
        let notify = conn.death_notify().expect("alive connection");

        conn.kill().await;
        assert!(conn.dead());
        notify.await.expect("death notification fired");

        // Notify on a dead connection yields nothing to wait on.
        assert!(conn.death_notify().is_none());

        // Killing again is a no-op and does not hang.
        conn.kill().await;
    }

    #[tokio::test]
    async fn request_on_dead_connection_is_noop() {
        let conn = test_conn();
        conn.kill().await;

        let outbound = conn.outbound();
        conn.request(json!("T"), vec![]);
        conn.request_with(json!("T"), vec![], |_| {});
        tokio::task::yield_now().await;

        assert!(outbound.is_empty());
        assert!(conn.inner.completers.lock().is_empty());
    }

    #[tokio::test]
    async fn call_resolves_with_response_args() {
        let conn = test_conn();
        let conn2 = conn.clone();

        let pump = tokio::spawn(async move {
            let msg = conn2.outbound().recv().await.expect("request");
            let completer = conn2.take_completer(msg.id()).expect("completer");
            completer(vec![json!("pong")]);
        });

        let args = conn.call(json!("Ping"), vec![json!(1)]).await.expect("call");
        assert_eq!(args, vec![json!("pong")]);
        pump.await.expect("pump");
    }

    #[tokio::test]
    async fn call_fails_when_connection_dies() {
        let conn = test_conn();
        let conn2 = conn.clone();
        let caller = tokio::spawn(async move { conn2.call(json!("Ping"), vec![]).await });

        // Let the request queue up, then kill without responding.
        tokio::task::yield_now().await;
        conn.kill().await;

        assert_eq!(caller.await.expect("join"), Err(CallError::ConnectionDead));
    }

    #[tokio::test(start_paused = true)]
    async fn ping_timer_requests_ping_then_times_out() {
        let conn = Connection::new_client("127.0.0.1:1", Method::LongPolling);
        conn.spawn_ping_timer(Duration::from_millis(100), Duration::from_millis(50));

        let ping_due = conn.ping_due();
        let timed_out = conn.ping_timeout_fired();

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(ping_due.try_recv().is_ok(), "ping requested after rate");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(timed_out.try_recv().is_ok(), "timeout fired after silence");
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_ping_timer() {
        let conn = Connection::new_client("127.0.0.1:1", Method::LongPolling);
        conn.spawn_ping_timer(Duration::from_millis(100), Duration::from_millis(50));
        let ping_due = conn.ping_due();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            conn.reset_disconnect_timer();
            tokio::task::yield_now().await;
        }
        assert!(ping_due.try_recv().is_err(), "activity kept the timer fresh");
    }

    #[tokio::test]
    async fn ping_timeout_kills_when_death_task_watches_it() {
        let conn = Connection::new_client("127.0.0.1:1", Method::WebSocket);
        conn.spawn_death_task(true, async {});
        conn.spawn_ping_timer(Duration::from_millis(10), Duration::from_millis(10));

        let notify = conn.death_notify().expect("alive");
        notify.await.expect("death from ping timeout");
        assert!(conn.dead());
    }
}
