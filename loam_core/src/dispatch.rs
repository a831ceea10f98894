//! Shared inbound-message handling.
//!
//! Both transports funnel every decoded message through [`dispatch_inbound`]:
//! responses are matched against the connection's pending-completer table,
//! requests are routed to the host's handler registry. A faulting handler or
//! completer never takes down the connection — the failure is logged with a
//! diagnostic of the argument shapes involved.

use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;

use crate::connection::Connection;
use crate::host::Host;
use crate::key::Key;
use crate::message::{Message, RequestId};

/// Handle one decoded inbound message.
///
/// Returns the response message the transport must submit to the peer, when
/// the inbound message was a request whose sender expects one. Submission is
/// left to the transport so it can race its own death and timeout signals.
pub async fn dispatch_inbound(host: &Host, conn: &Connection, msg: Message) -> Option<Message> {
    match msg {
        Message::Response { id, args } => {
            deliver_response(conn, id, args);
            None
        }
        Message::Request { id, name, args } => {
            let Some(handler) = host.handler(&Key::new(name.clone())) else {
                tracing::warn!(name = %name, "no handler for request");
                return None;
            };

            let expected = signature_of(&args);
            let fut = handler(args, conn.clone());

            // The spawn is the panic boundary: a faulting handler surfaces
            // as a join error here instead of unwinding the transport task.
            match tokio::spawn(fut).await {
                Ok(result) => (!id.is_none()).then(|| Message::response(id, result)),
                Err(err) if err.is_panic() => {
                    tracing::error!(
                        name = %name,
                        expected = %format!("{expected} -> ..."),
                        "request handler panicked"
                    );
                    None
                }
                Err(_) => None,
            }
        }
    }
}

/// Deliver a response to its registered completer.
///
/// A response with an unknown id is logged and dropped; a panicking
/// completer is isolated and logged with the expected callable shape.
pub fn deliver_response(conn: &Connection, id: RequestId, args: Vec<Value>) {
    let Some(completer) = conn.take_completer(id) else {
        tracing::warn!(%id, "response with unknown id, ignoring");
        return;
    };

    let expected = signature_of(&args);
    if panic::catch_unwind(AssertUnwindSafe(move || completer(args))).is_err() {
        tracing::error!(
            %id,
            expected = %expected,
            "completer panicked; expected a callable accepting the response args"
        );
    }
}

/// Render the callable shape implied by a list of JSON arguments, for
/// handler-failure diagnostics.
fn signature_of(args: &[Value]) -> String {
    let types: Vec<&str> = args.iter().map(json_type_name).collect();
    format!("fn({})", types.join(", "))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Method;
    use serde_json::json;

    fn test_conn() -> Connection {
        let conn = Connection::new_client("127.0.0.1:1", Method::WebSocket);
        conn.spawn_death_task(false, async {});
        conn
    }

    #[tokio::test]
    async fn request_is_answered_by_registered_handler() {
        let host = Host::new();
        host.handle("Echo", |args, _conn| async move { args });

        let conn = test_conn();
        let req = Message::request(RequestId::from_raw(0), json!("Echo"), vec![json!("hi")]);

        let reply = dispatch_inbound(&host, &conn, req).await;
        assert_eq!(
            reply,
            Some(Message::response(RequestId::from_raw(0), vec![json!("hi")]))
        );
    }

    #[tokio::test]
    async fn sentinel_id_request_gets_no_reply() {
        let host = Host::new();
        host.handle("Echo", |args, _conn| async move { args });

        let conn = test_conn();
        let req = Message::request(RequestId::NONE, json!("Echo"), vec![json!("hi")]);
        assert_eq!(dispatch_inbound(&host, &conn, req).await, None);
    }

    #[tokio::test]
    async fn unknown_request_name_is_dropped() {
        let host = Host::new();
        let conn = test_conn();
        let req = Message::request(RequestId::from_raw(1), json!("Nope"), vec![]);
        assert_eq!(dispatch_inbound(&host, &conn, req).await, None);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_the_connection() {
        let host = Host::new();
        host.handle("Boom", |_args, _conn| async move {
            panic!("handler bug");
        });

        let conn = test_conn();
        let req = Message::request(RequestId::from_raw(2), json!("Boom"), vec![]);
        assert_eq!(dispatch_inbound(&host, &conn, req).await, None);
        assert!(!conn.dead());
    }

    #[tokio::test]
    async fn response_reaches_completer_exactly_once() {
        let host = Host::new();
        let conn = test_conn();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.request_with(json!("Ping"), vec![json!(42)], move |args| {
            let _ = tx.send(args);
        });
        let _ = conn.outbound().recv().await;

        let resp = Message::response(RequestId::from_raw(0), vec![json!(43)]);
        dispatch_inbound(&host, &conn, resp.clone()).await;
        assert_eq!(rx.recv().await, Some(vec![json!(43)]));

        // A second arrival with the same id is logged and ignored.
        dispatch_inbound(&host, &conn, resp).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn panicking_completer_is_isolated() {
        let host = Host::new();
        let conn = test_conn();

        conn.request_with(json!("Ping"), vec![], |_args| {
            panic!("completer bug");
        });
        let _ = conn.outbound().recv().await;

        let resp = Message::response(RequestId::from_raw(0), vec![json!(1)]);
        dispatch_inbound(&host, &conn, resp).await;
        assert!(!conn.dead());
    }

    #[test]
    fn signature_diagnostics_name_json_types() {
        let sig = signature_of(&[json!(1), json!("x"), json!(null), json!([])]);
        assert_eq!(sig, "fn(number, string, null, array)");
    }
}
