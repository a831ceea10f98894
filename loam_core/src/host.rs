//! Shared configuration and handler registry.
//!
//! Server and client both carry a [`Host`]: the request-handler registry,
//! the connect-handler slot, and the buffer/ping tunables. Handlers are a
//! uniform callable taking the decoded argument list and the connection the
//! request arrived on, and returning the response argument list.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::Value;

use crate::connection::Connection;
use crate::key::Key;
use crate::{DEFAULT_MAX_BUFFER_SIZE, DEFAULT_PING_RATE_SECS, DEFAULT_PING_TIMEOUT_SECS};

/// A request handler: `(args, connection) -> response args`.
pub type Handler = Arc<dyn Fn(Vec<Value>, Connection) -> BoxFuture<'static, Vec<Value>> + Send + Sync>;

/// A connect handler, invoked once per newly established connection.
pub type ConnectHandler = Arc<dyn Fn(Connection) -> BoxFuture<'static, ()> + Send + Sync>;

struct HostInner {
    handlers: RwLock<HashMap<Key, Handler>>,
    connect: RwLock<Option<ConnectHandler>>,
    max_buffer_size: RwLock<usize>,
    ping_rate: RwLock<Duration>,
    ping_timeout: RwLock<Duration>,
}

/// Handler registry plus the tunables shared by server and client.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    /// Create a host with the default tunables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HostInner {
                handlers: RwLock::new(HashMap::new()),
                connect: RwLock::new(None),
                max_buffer_size: RwLock::new(DEFAULT_MAX_BUFFER_SIZE),
                ping_rate: RwLock::new(Duration::from_secs(DEFAULT_PING_RATE_SECS)),
                ping_timeout: RwLock::new(Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS)),
            }),
        }
    }

    /// Register `handler` for requests named `name`, replacing any previous
    /// registration.
    ///
    /// The name may be any JSON value.
    pub fn handle<F, Fut>(&self, name: impl Into<Key>, handler: F)
    where
        F: Fn(Vec<Value>, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args, conn| handler(args, conn).boxed());
        self.inner.handlers.write().insert(name.into(), handler);
    }

    /// Remove the handler registered for `name`, if any.
    pub fn remove_handler(&self, name: &Key) {
        self.inner.handlers.write().remove(name);
    }

    /// The handler registered for `name`, if any.
    #[must_use]
    pub fn handler(&self, name: &Key) -> Option<Handler> {
        self.inner.handlers.read().get(name).cloned()
    }

    /// Register the connect handler, invoked once per newly established
    /// connection.
    pub fn on_connect<F, Fut>(&self, handler: F)
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ConnectHandler = Arc::new(move |conn| handler(conn).boxed());
        *self.inner.connect.write() = Some(handler);
    }

    /// The registered connect handler, if any.
    #[must_use]
    pub fn connect_handler(&self) -> Option<ConnectHandler> {
        self.inner.connect.read().clone()
    }

    /// Set the maximum size in bytes of a single encoded message.
    ///
    /// A long-poll message body exceeding this kills the whole session; an
    /// oversized WebSocket frame kills the connection.
    pub fn set_max_buffer_size(&self, size: usize) {
        *self.inner.max_buffer_size.write() = size;
    }

    /// The maximum size in bytes of a single encoded message.
    #[must_use]
    pub fn max_buffer_size(&self) -> usize {
        *self.inner.max_buffer_size.read()
    }

    /// Set the interval of peer inactivity after which a ping is sent.
    pub fn set_ping_rate(&self, rate: Duration) {
        *self.inner.ping_rate.write() = rate;
    }

    /// The interval of peer inactivity after which a ping is sent.
    #[must_use]
    pub fn ping_rate(&self) -> Duration {
        *self.inner.ping_rate.read()
    }

    /// Set how long a peer has to answer a ping before its connection is
    /// considered dead.
    pub fn set_ping_timeout(&self, timeout: Duration) {
        *self.inner.ping_timeout.write() = timeout;
    }

    /// How long a peer has to answer a ping before its connection is
    /// considered dead.
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        *self.inner.ping_timeout.read()
    }
}
