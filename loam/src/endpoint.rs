//! The single HTTP endpoint serving both transports.
//!
//! Dispatch order mirrors the protocol: `OPTIONS` answers the CORS
//! preflight, an `Upgrade: websocket` header routes to the WebSocket
//! transport (after the Origin check), and everything else falls back to
//! long-polling.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use loam_core::Server;

/// Build the router serving the loam endpoint at `/`.
///
/// Mount it behind [`axum::serve`]; use
/// `into_make_service_with_connect_info::<SocketAddr>` so connections learn
/// their peer addresses.
pub fn router(server: Server) -> Router {
    Router::new().route("/", any(endpoint)).with_state(server)
}

async fn endpoint(State(server): State<Server>, request: Request<Body>) -> Response {
    if request.method() == Method::OPTIONS {
        return preflight(&server, request.headers());
    }

    if wants_websocket(request.headers()) {
        return upgrade(server, request).await;
    }

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    loam_http_long_poll::handle(server, remote, request).await
}

/// Whether the request asks for a WebSocket upgrade. Matched
/// case-insensitively: not every browser sends the lowercase form.
fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
}

/// Answer a CORS preflight according to the origin allow-list.
fn preflight(server: &Server, headers: &HeaderMap) -> Response {
    let allow_origin = if server.origin_access("*") {
        HeaderValue::from_static("*")
    } else {
        let Some(origin) = headers.get(header::ORIGIN) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        match origin.to_str() {
            Ok(value) if server.origin_access(value) => origin.clone(),
            _ => HeaderValue::from_static("null"),
        }
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    response_headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST"),
    );
    response_headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("600"),
    );
    (StatusCode::OK, response_headers).into_response()
}

/// Check origin and session, then hand the upgraded socket to the WebSocket
/// transport.
async fn upgrade(server: Server, request: Request<Body>) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    let Some(origin) = origin else {
        tracing::warn!("websocket upgrade without origin header, dropped");
        return StatusCode::FORBIDDEN.into_response();
    };
    if !server.origin_access(origin) {
        tracing::warn!(origin, "websocket upgrade from disallowed origin, dropped");
        return StatusCode::FORBIDDEN.into_response();
    }

    // The session cookie must have been established with a `wsec` request
    // before the upgrade.
    let session = match loam_http_long_poll::session_cookie(request.headers()) {
        Some(cookie) => server.session_for_key(&cookie).await,
        None => None,
    };
    let Some(session) = session else {
        tracing::warn!("websocket upgrade with an invalid session, dropped");
        return StatusCode::BAD_REQUEST.into_response();
    };
    if session.dead() {
        tracing::warn!("websocket upgrade for a dead session, dropped");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let (mut parts, _body) = request.into_parts();
    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |info| info.0.to_string());

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &server).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.max_message_size(server.host().max_buffer_size())
        .on_upgrade(move |socket| loam_websocket::serve_socket(server, session, socket, remote))
}
