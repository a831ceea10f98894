//! Server-side socket loops.
//!
//! The shared HTTP endpoint upgrades the request and hands the socket here.
//! Three tasks then drive the connection: the writer (ping and outbound
//! frames), the death task (terminal cleanup, watching the ping timeout
//! directly), and the read loop running on the calling task.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use loam_core::{Connection, Method, Server, Session};

use crate::inbound::{handle_text_frame, FrameOutcome};

/// Run an upgraded server-side WebSocket until it closes.
///
/// Creates the connection, registers it with `session` (and the server's
/// live list, firing the connect handler), and pumps frames until EOF, a
/// transport error, or death.
pub async fn serve_socket(server: Server, session: Session, socket: WebSocket, remote: String) {
    let conn_key = match server.generate_session_key() {
        Ok(key) => key,
        Err(err) => {
            tracing::error!(error = %err, "failed to generate connection key");
            return;
        }
    };

    let conn = Connection::new_server(remote, Method::WebSocket, &session, conn_key);
    let (sink, stream) = socket.split();

    // WebSocket connections die directly on ping timeout; there is no poll
    // request around to observe it.
    conn.spawn_death_task(true, async {});
    tokio::spawn(run_writer(conn.clone(), sink));
    conn.spawn_ping_timer(server.host().ping_rate(), server.host().ping_timeout());
    server.register_connection(conn.clone());

    read_loop(&server, &conn, stream).await;
    conn.kill().await;
}

/// Send ping and outbound frames until death; an empty text frame is the
/// ping.
async fn run_writer(conn: Connection, mut sink: SplitSink<WebSocket, WsMessage>) {
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
                if let Err(err) = sink.send(WsMessage::Text("".into())).await {
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

async fn read_loop(server: &Server, conn: &Connection, mut stream: SplitStream<WebSocket>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if handle_text_frame(server.host(), conn, text.as_str()).await
                    == FrameOutcome::Kill
                {
                    return;
                }
            }
            // axum answers pings itself; both directions are proof of life.
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => conn.reset_disconnect_timer(),
            Ok(WsMessage::Binary(_)) => {
                tracing::warn!(connection = %conn, "unexpected binary frame");
            }
            Ok(WsMessage::Close(_)) => return,
            Err(err) => {
                tracing::warn!(connection = %conn, error = %err, "websocket read failed");
                return;
            }
        }
    }
}
