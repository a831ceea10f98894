//! Wire-level constants shared by the transports.
//!
//! Both transports speak through the same HTTP endpoint: long-poll traffic
//! uses it directly, and WebSocket clients POST a `wsec` establish request
//! to it for their session cookie before upgrading.

/// Header naming the request kind.
pub const REQUEST_TYPE_HEADER: &str = "X-Organics-Req";

/// Header carrying the connection key (the CSRF token handed out by the
/// long-poll establish request).
pub const CONNECTION_HEADER: &str = "X-Organics-Conn";

/// The kind of endpoint request, from the `X-Organics-Req` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `wsec` — establish a session cookie before a WebSocket upgrade.
    WebSocketEstablish,
    /// `lpec` — establish a session cookie and a long-poll connection.
    LongPollEstablish,
    /// `lp` — wait for the next server-to-client message.
    LongPoll,
    /// `m` — deliver a client-to-server message.
    Message,
}

impl RequestKind {
    /// Parse the header value, rejecting unknown kinds.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "wsec" => Some(Self::WebSocketEstablish),
            "lpec" => Some(Self::LongPollEstablish),
            "lp" => Some(Self::LongPoll),
            "m" => Some(Self::Message),
            _ => None,
        }
    }

    /// The wire form of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebSocketEstablish => "wsec",
            Self::LongPollEstablish => "lpec",
            Self::LongPoll => "lp",
            Self::Message => "m",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_kinds() {
        for kind in [
            RequestKind::WebSocketEstablish,
            RequestKind::LongPollEstablish,
            RequestKind::LongPoll,
            RequestKind::Message,
        ] {
            assert_eq!(RequestKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn rejects_unknown_kinds() {
        assert_eq!(RequestKind::parse("bogus"), None);
        assert_eq!(RequestKind::parse(""), None);
        assert_eq!(RequestKind::parse("LP"), None);
    }
}
