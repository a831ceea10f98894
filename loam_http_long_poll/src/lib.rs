//! # Loam HTTP long-poll transport
//!
//! Half-duplex channel emulation over plain HTTP `POST`: the browser keeps a
//! poll request open, and the server answers it with one outbound message at
//! a time. All traffic goes to a single endpoint; the `X-Organics-Req`
//! header names the request kind:
//!
//! | Value | Kind |
//! |---|---|
//! | `wsec` | WebSocket establish (cookie only, before the upgrade) |
//! | `lpec` | long-poll establish |
//! | `lp` | long poll |
//! | `m` | message (request or response) |
//!
//! The connection key returned by `lpec` is echoed back in the
//! `X-Organics-Conn` header and doubles as a CSRF token.

mod handlers;

pub use handlers::{handle, session_cookie};
pub use loam_core::wire::{RequestKind, CONNECTION_HEADER, REQUEST_TYPE_HEADER};
