//! The long-poll request handlers.

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use loam_core::dispatch::dispatch_inbound;
use loam_core::{Connection, Message, Server, Session, SESSION_COOKIE};

use crate::{RequestKind, CONNECTION_HEADER, REQUEST_TYPE_HEADER};

/// Handle one long-poll endpoint request.
///
/// `remote` is the peer address when the caller knows it (it is absent in
/// router-level tests).
pub async fn handle(server: Server, remote: Option<SocketAddr>, req: Request<Body>) -> Response {
    // Data flows both ways and any request may mutate server state, so the
    // endpoint is POST-only.
    if req.method() != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, HeaderValue::from_static("POST"))],
        )
            .into_response();
    }

    let (parts, body) = req.into_parts();
    let headers = parts.headers;

    let kind = headers
        .get(REQUEST_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(RequestKind::parse);
    let Some(kind) = kind else {
        tracing::warn!("bad request: missing or invalid {REQUEST_TYPE_HEADER} header");
        return StatusCode::BAD_REQUEST.into_response();
    };

    match kind {
        RequestKind::WebSocketEstablish => establish(&server, &headers, remote, false).await,
        RequestKind::LongPollEstablish => establish(&server, &headers, remote, true).await,
        RequestKind::LongPoll | RequestKind::Message => {
            let Some(session) = resolve_session(&server, &headers).await else {
                tracing::warn!("long-poll request without an established session");
                return StatusCode::BAD_REQUEST.into_response();
            };
            if session.dead() {
                tracing::warn!("bad request: request for dead session");
                return StatusCode::BAD_REQUEST.into_response();
            }

            let conn_key = headers.get(CONNECTION_HEADER).and_then(|v| v.to_str().ok());
            let Some(conn_key) = conn_key else {
                tracing::warn!("bad request: {CONNECTION_HEADER} header not present");
                return StatusCode::BAD_REQUEST.into_response();
            };
            let Some(conn) = session.connection(conn_key) else {
                tracing::warn!("bad request: {CONNECTION_HEADER} value invalid");
                return StatusCode::BAD_REQUEST.into_response();
            };
            if conn.dead() {
                tracing::warn!("bad request: request for dead connection");
                return StatusCode::BAD_REQUEST.into_response();
            }

            match kind {
                RequestKind::LongPoll => long_poll(conn).await,
                _ => message(&server, &session, &conn, &headers, body).await,
            }
        }
    }
}

/// `wsec` / `lpec`: make sure a session exists, handing out a cookie when a
/// fresh one was created. For `lpec`, additionally create the connection and
/// return its key as the body.
async fn establish(
    server: &Server,
    headers: &HeaderMap,
    remote: Option<SocketAddr>,
    long_poll: bool,
) -> Response {
    let cookie = session_cookie(headers);
    let (session, new_key) = match server.ensure_session(cookie.as_deref()).await {
        Ok(established) => established,
        Err(err) => {
            tracing::error!(error = %err, "failed to generate session key");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    if let Some(key) = new_key {
        match HeaderValue::from_str(&format!("{SESSION_COOKIE}={key}; HttpOnly")) {
            Ok(value) => {
                response_headers.insert(header::SET_COOKIE, value);
            }
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    if !long_poll {
        return (StatusCode::OK, response_headers).into_response();
    }

    // The connection key doubles as the CSRF token: the client echoes it in
    // X-Organics-Conn on every lp/m request.
    let conn_key = match server.generate_session_key() {
        Ok(key) => key,
        Err(err) => {
            tracing::error!(error = %err, "failed to generate connection key");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let address = remote.map_or_else(|| "unknown".to_owned(), |a| a.to_string());
    let conn = Connection::new_server(
        address,
        loam_core::Method::LongPolling,
        &session,
        conn_key.clone(),
    );
    conn.spawn_death_task(false, async {});
    conn.spawn_ping_timer(server.host().ping_rate(), server.host().ping_timeout());
    server.register_connection(conn);

    (StatusCode::OK, response_headers, conn_key).into_response()
}

/// `lp`: hold the request open until there is something to say.
async fn long_poll(conn: Connection) -> Response {
    // A valid poll is peer activity.
    conn.reset_disconnect_timer();

    let outbound = conn.outbound();
    let ping_due = conn.ping_due();
    let timed_out = conn.ping_timeout_fired();
    let death = conn.death_wanted();

    // The client can vanish at any moment (tab closed, connectivity lost);
    // axum then drops this future, and the guard kills the connection.
    let mut guard = KillOnDrop::arm(conn.clone());

    let response = tokio::select! {
        msg = outbound.recv() => match msg {
            // An empty poll response is a ping; a body is a message.
            Ok(msg) => (StatusCode::OK, msg.encode()).into_response(),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        },
        _ = ping_due.recv() => StatusCode::OK.into_response(),
        () = death.cancelled() => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        _ = timed_out.recv() => {
            guard.disarm();
            conn.kill().await;
            return StatusCode::REQUEST_TIMEOUT.into_response();
        }
    };

    guard.disarm();
    response
}

/// `m`: decode an inbound message and run it through the shared dispatch
/// path, submitting any reply to the connection's outbound queue.
async fn message(
    server: &Server,
    session: &Session,
    conn: &Connection,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    let Some(content_length) = content_length else {
        tracing::warn!("bad request: missing or invalid Content-Length");
        return StatusCode::BAD_REQUEST.into_response();
    };

    // The buffer cap protects the server from a single peer allocating
    // unbounded memory; exceeding it is treated as hostile and costs the
    // whole session.
    if content_length > server.host().max_buffer_size() {
        session.kill().await;
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    conn.reset_disconnect_timer();

    let bytes = match axum::body::to_bytes(body, content_length).await {
        Ok(bytes) if bytes.len() == content_length => bytes,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    let msg = match Message::decode(&bytes) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!(error = %err, "undecodable long-poll message");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let Some(reply) = dispatch_inbound(server.host(), conn, msg).await else {
        return StatusCode::OK.into_response();
    };

    // The peer may never poll again; race the submission against the
    // connection's death and disconnect timeout.
    let sender = conn.outbound_sender();
    let timed_out = conn.ping_timeout_fired();
    let death = conn.death_wanted();
    let mut guard = KillOnDrop::arm(conn.clone());

    let response = tokio::select! {
        _ = sender.send(reply) => StatusCode::OK.into_response(),
        () = death.cancelled() => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        _ = timed_out.recv() => {
            guard.disarm();
            conn.kill().await;
            return StatusCode::REQUEST_TIMEOUT.into_response();
        }
    };

    guard.disarm();
    response
}

async fn resolve_session(server: &Server, headers: &HeaderMap) -> Option<Session> {
    let cookie = session_cookie(headers)?;
    server.session_for_key(&cookie).await
}

/// Extract the session cookie value from the `Cookie` header.
#[must_use]
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(SESSION_COOKIE) {
            if let Some(value) = value.strip_prefix('=') {
                return Some(value.to_owned());
            }
        }
    }
    None
}

/// Kills the connection unless disarmed: the axum analogue of
/// `CloseNotify` — when the client abandons a request, the handler future
/// is dropped with the guard still armed.
struct KillOnDrop {
    conn: Option<Connection>,
}

impl KillOnDrop {
    fn arm(conn: Connection) -> Self {
        Self { conn: Some(conn) }
    }

    fn disarm(&mut self) {
        self.conn = None;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(connection = %conn, "client went away mid-request");
            tokio::spawn(async move { conn.kill().await });
        }
    }
}
