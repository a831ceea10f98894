//! Frame handling shared by the server and client socket loops.

use loam_core::dispatch::dispatch_inbound;
use loam_core::{Connection, Host, Message};

/// What the read loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameOutcome {
    /// Keep reading.
    Continue,
    /// Kill the connection and stop.
    Kill,
}

/// Handle one inbound text frame.
///
/// Any frame is peer activity and resets the disconnect timer. An empty
/// frame is a ping answer and carries no message. Oversized or undecodable
/// frames kill the connection.
pub(crate) async fn handle_text_frame(
    host: &Host,
    conn: &Connection,
    text: &str,
) -> FrameOutcome {
    conn.reset_disconnect_timer();

    if text.is_empty() {
        return FrameOutcome::Continue;
    }

    if text.len() > host.max_buffer_size() {
        tracing::warn!(
            connection = %conn,
            size = text.len(),
            "frame exceeds max buffer size"
        );
        return FrameOutcome::Kill;
    }

    let msg = match Message::decode(text.as_bytes()) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!(connection = %conn, error = %err, "undecodable frame");
            return FrameOutcome::Kill;
        }
    };

    if let Some(reply) = dispatch_inbound(host, conn, msg).await {
        // A false return means death won the race; the loop will notice.
        let _ = conn.submit_outbound(reply).await;
    }

    FrameOutcome::Continue
}
