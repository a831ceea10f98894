//! Outbound WebSocket client.
//!
//! A [`Client`] first POSTs a `wsec` establish request to the shared HTTP
//! endpoint so the server hands out the session cookie, then upgrades to a
//! WebSocket carrying that cookie. When the transport fails, the client
//! reconnects with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use loam_core::wire::{RequestKind, REQUEST_TYPE_HEADER};
use loam_core::{CallError, Connection, Host, Method, SESSION_COOKIE};

use crate::error::ClientError;
use crate::inbound::{handle_text_frame, FrameOutcome};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// First reconnect delay after a transport failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Reconnect delays double per consecutive failure, up to this cap.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

struct ClientInner {
    host: Host,
    endpoint: String,
    ws_endpoint: String,
    origin: Mutex<Option<String>>,
    http: reqwest::Client,
    cookie: Mutex<Option<String>>,
    connection: RwLock<Option<Connection>>,
    closed: CancellationToken,
}

/// A client-side endpoint: registry, tunables, and the (re)connect loop.
///
/// Cheap to clone; clones share the same underlying client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client for the server endpoint at `endpoint`
    /// (an `http://` or `https://` URL).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] for other schemes.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        let endpoint = endpoint.into();
        let ws_endpoint = if let Some(rest) = endpoint.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if let Some(rest) = endpoint.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            return Err(ClientError::InvalidUrl(endpoint));
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                host: Host::new(),
                endpoint,
                ws_endpoint,
                origin: Mutex::new(None),
                http: reqwest::Client::new(),
                cookie: Mutex::new(None),
                connection: RwLock::new(None),
                closed: CancellationToken::new(),
            }),
        })
    }

    /// The shared registry and tunables.
    #[must_use]
    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// Set the `Origin` header presented during the upgrade.
    pub fn set_origin(&self, origin: impl Into<String>) {
        *self.inner.origin.lock() = Some(origin.into());
    }

    /// Register `handler` for requests named `name`. See [`Host::handle`].
    pub fn handle<F, Fut>(&self, name: impl Into<loam_core::Key>, handler: F)
    where
        F: Fn(Vec<Value>, Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<Value>> + Send + 'static,
    {
        self.inner.host.handle(name, handler);
    }

    /// The current connection, if one is established.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connection.read().clone()
    }

    /// Make a fire-and-forget request on the current connection.
    ///
    /// No-op while disconnected.
    pub fn request(&self, name: Value, args: Vec<Value>) {
        if let Some(conn) = self.connection() {
            conn.request(name, args);
        }
    }

    /// Make a request with a completion callback on the current connection.
    ///
    /// No-op while disconnected.
    pub fn request_with(
        &self,
        name: Value,
        args: Vec<Value>,
        on_complete: impl FnOnce(Vec<Value>) + Send + 'static,
    ) {
        if let Some(conn) = self.connection() {
            conn.request_with(name, args, on_complete);
        }
    }

    /// Make a request and wait for the response arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] while disconnected, and
    /// [`ClientError`] wrapping [`CallError`] semantics when the connection
    /// dies mid-call.
    pub async fn call(&self, name: Value, args: Vec<Value>) -> Result<Vec<Value>, ClientError> {
        let conn = self.connection().ok_or(ClientError::NotConnected)?;
        conn.call(name, args)
            .await
            .map_err(|_: CallError| ClientError::NotConnected)
    }

    /// Connect to the server. After the first success, transport failures
    /// trigger automatic reconnection with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns the error of the initial attempt; reconnection failures are
    /// logged and retried instead.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (conn, stream) = self.connect_once().await?;
        self.spawn_read(conn, stream);
        Ok(())
    }

    /// Shut the client down: no more reconnects, current connection killed.
    pub async fn close(&self) {
        self.inner.closed.cancel();
        let conn = self.inner.connection.write().take();
        if let Some(conn) = conn {
            conn.kill().await;
        }
    }

    /// One full connection attempt: establish the cookie, upgrade, wire the
    /// connection tasks.
    async fn connect_once(&self) -> Result<(Connection, SplitStream<WsStream>), ClientError> {
        self.establish().await?;

        let mut request = self
            .inner
            .ws_endpoint
            .as_str()
            .into_client_request()
            .map_err(ClientError::WebSocket)?;
        if let Some(cookie) = self.inner.cookie.lock().clone() {
            if let Ok(value) = HeaderValue::from_str(&format!("{SESSION_COOKIE}={cookie}")) {
                request.headers_mut().insert(header::COOKIE, value);
            }
        }
        if let Some(origin) = self.inner.origin.lock().clone() {
            if let Ok(value) = HeaderValue::from_str(&origin) {
                request.headers_mut().insert(header::ORIGIN, value);
            }
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (sink, stream) = stream.split();

        let conn = Connection::new_client(self.inner.ws_endpoint.clone(), Method::WebSocket);
        conn.spawn_death_task(true, async {});
        tokio::spawn(run_writer(conn.clone(), sink));
        conn.spawn_ping_timer(self.inner.host.ping_rate(), self.inner.host.ping_timeout());

        *self.inner.connection.write() = Some(conn.clone());
        tracing::info!(endpoint = %self.inner.ws_endpoint, "connected");
        Ok((conn, stream))
    }

    /// POST the `wsec` establish request so the server hands out (or
    /// refreshes) the session cookie picked up by the upgrade.
    async fn establish(&self) -> Result<(), ClientError> {
        let mut request = self
            .inner
            .http
            .post(&self.inner.endpoint)
            .header(REQUEST_TYPE_HEADER, RequestKind::WebSocketEstablish.as_str());
        if let Some(cookie) = self.inner.cookie.lock().clone() {
            request = request.header(header::COOKIE.as_str(), format!("{SESSION_COOKIE}={cookie}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ClientError::EstablishRejected(response.status().as_u16()));
        }

        if let Some(cookie) = extract_session_cookie(&response) {
            *self.inner.cookie.lock() = Some(cookie);
        }
        if self.inner.cookie.lock().is_none() {
            return Err(ClientError::MissingCookie);
        }
        Ok(())
    }

    fn spawn_read(&self, conn: Connection, mut stream: SplitStream<WsStream>) {
        let client = self.clone();
        tokio::spawn(async move {
            client.read_loop(&conn, &mut stream).await;
            conn.kill().await;
            *client.inner.connection.write() = None;

            if !client.inner.closed.is_cancelled() {
                client.reconnect_loop().await;
            }
        });
    }

    async fn read_loop(&self, conn: &Connection, stream: &mut SplitStream<WsStream>) {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    if handle_text_frame(&self.inner.host, conn, text.as_str()).await
                        == FrameOutcome::Kill
                    {
                        return;
                    }
                }
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => conn.reset_disconnect_timer(),
                Ok(WsMessage::Binary(_)) => {
                    tracing::warn!(connection = %conn, "unexpected binary frame");
                }
                Ok(WsMessage::Close(_)) => return,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(connection = %conn, error = %err, "websocket read failed");
                    return;
                }
            }
        }
    }

    /// Keep trying to reconnect, doubling the delay per failure.
    async fn reconnect_loop(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            tokio::select! {
                () = self.inner.closed.cancelled() => return,
                () = tokio::time::sleep(backoff) => {}
            }

            match self.connect_once().await {
                Ok((conn, stream)) => {
                    self.spawn_read(conn, stream);
                    return;
                }
                Err(err) => {
                    tracing::warn!(error = %err, backoff = ?backoff, "reconnect failed");
                    backoff = next_backoff(backoff);
                }
            }
        }
    }
}

/// Send ping and outbound frames until death; an empty text frame is the
/// ping.
async fn run_writer(conn: Connection, mut sink: SplitSink<WsStream, WsMessage>) {
    let outbound = conn.outbound();
    let ping_due = conn.ping_due();
    let death = conn.death_wanted();

    loop {
        tokio::select! {
            () = death.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return;
            }
            _ = ping_due.recv() => {
                if let Err(err) = sink.send(WsMessage::Text(String::new().into())).await {
                    tracing::warn!(connection = %conn, error = %err, "ping write failed");
                    conn.kill().await;
                    return;
                }
            }
            msg = outbound.recv() => {
                let Ok(msg) = msg else { return };
                let encoded = match String::from_utf8(msg.encode()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::error!(connection = %conn, "encoded message is not UTF-8");
                        continue;
                    }
                };
                if let Err(err) = sink.send(WsMessage::Text(encoded.into())).await {
                    tracing::warn!(connection = %conn, error = %err, "frame write failed");
                    conn.kill().await;
                    return;
                }
            }
        }
    }
}

fn extract_session_cookie(response: &reqwest::Response) -> Option<String> {
    for value in response.headers().get_all(header::SET_COOKIE.as_str()) {
        let Ok(raw) = value.to_str() else { continue };
        let (pair, _attrs) = raw.split_once(';').unwrap_or((raw, ""));
        if let Some((name, value)) = pair.split_once('=') {
            if name.trim() == SESSION_COOKIE {
                return Some(value.trim().to_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derives_websocket_url_from_http_endpoint() {
        let client = Client::new("http://127.0.0.1:8080/").expect("client");
        assert_eq!(client.inner.ws_endpoint, "ws://127.0.0.1:8080/");

        let client = Client::new("https://example.com/chat").expect("client");
        assert_eq!(client.inner.ws_endpoint, "wss://example.com/chat");
    }

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(matches!(
            Client::new("ftp://example.com/"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(backoff);
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen[0], Duration::from_millis(500));
        assert_eq!(seen[1], Duration::from_secs(1));
        assert_eq!(seen[2], Duration::from_secs(2));
        assert_eq!(*seen.last().expect("nonempty"), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn requests_before_connecting_are_noops() {
        let client = Client::new("http://127.0.0.1:1/").expect("client");
        client.request(json!("T"), vec![]);
        assert!(matches!(
            client.call(json!("T"), vec![]).await,
            Err(ClientError::NotConnected)
        ));
    }
}
