//! The wire codec.
//!
//! Two message shapes travel in either direction, each encoded as a JSON
//! array:
//!
//! - *Request*: `[id, requestName, args]` — `id` is a number unique to the
//!   sender on this connection, `requestName` is any JSON value, and `args`
//!   is an array of JSON values. An id of `-1` means the sender declines any
//!   response.
//! - *Response*: `[id, args]`, or just `[id]` when `args` is empty — `id`
//!   echoes the request being answered.
//!
//! The codec is stateless and safe to call from any number of tasks.

use core::fmt;

use serde_json::Value;
use thiserror::Error;

/// A request correlation id.
///
/// Ids are JSON numbers on the wire. `-1` is the reserved "no response
/// expected" sentinel and is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(i64);

impl RequestId {
    /// The sentinel id meaning "do not respond to this request".
    pub const NONE: Self = Self(-1);

    /// Create an id from its raw wire value.
    #[must_use]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// The raw wire value.
    #[must_use]
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Whether this is the "no response expected" sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == -1
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A named request carrying JSON arguments.
    Request {
        /// Correlation id, or [`RequestId::NONE`] when no response is wanted.
        id: RequestId,
        /// The request name; any JSON value.
        name: Value,
        /// The request arguments.
        args: Vec<Value>,
    },

    /// A response to a previously sent request.
    Response {
        /// The id of the request being answered.
        id: RequestId,
        /// The response arguments; may be empty.
        args: Vec<Value>,
    },
}

/// A message that could not be decoded, or that has an invalid shape.
#[derive(Debug, Error)]
pub enum BadMessage {
    /// The payload was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload was valid JSON but not an array.
    #[error("message is not a JSON array")]
    NotAnArray,

    /// The array had a length other than 1, 2 or 3.
    #[error("message array has invalid length {0}")]
    BadLength(usize),

    /// The first element was not a JSON number.
    #[error("message id is not a JSON number")]
    IdNotANumber,

    /// The args element was not a JSON array.
    #[error("message args is not a JSON array")]
    ArgsNotAnArray,
}

impl Message {
    /// Build a request message.
    #[must_use]
    pub fn request(id: RequestId, name: Value, args: Vec<Value>) -> Self {
        Self::Request { id, name, args }
    }

    /// Build a response message.
    #[must_use]
    pub fn response(id: RequestId, args: Vec<Value>) -> Self {
        Self::Response { id, args }
    }

    /// The correlation id of this message.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => *id,
        }
    }

    /// Encode into the JSON array wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let array = match self {
            Self::Request { id, name, args } => vec![
                Value::from(id.raw()),
                name.clone(),
                Value::Array(args.clone()),
            ],
            Self::Response { id, args } => {
                if args.is_empty() {
                    vec![Value::from(id.raw())]
                } else {
                    vec![Value::from(id.raw()), Value::Array(args.clone())]
                }
            }
        };

        #[allow(clippy::expect_used)]
        let encoded =
            serde_json::to_vec(&Value::Array(array)).expect("JSON values encode infallibly");
        encoded
    }

    /// Decode from the JSON array wire form.
    ///
    /// Array length selects the shape: 1 is an empty-args response, 2 is a
    /// response, 3 is a request.
    ///
    /// # Errors
    ///
    /// Returns [`BadMessage`] on JSON errors, a non-array payload, a wrong
    /// array length, a non-number id, or non-array args.
    pub fn decode(data: &[u8]) -> Result<Self, BadMessage> {
        let value: Value = serde_json::from_slice(data)?;
        let Value::Array(mut elements) = value else {
            return Err(BadMessage::NotAnArray);
        };

        let id = decode_id(elements.first().ok_or(BadMessage::BadLength(0))?)?;

        match elements.len() {
            1 => Ok(Self::Response { id, args: vec![] }),
            2 => {
                let args = decode_args(elements.remove(1))?;
                Ok(Self::Response { id, args })
            }
            3 => {
                let args = decode_args(elements.remove(2))?;
                let name = elements.remove(1);
                Ok(Self::Request { id, name, args })
            }
            n => Err(BadMessage::BadLength(n)),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn decode_id(value: &Value) -> Result<RequestId, BadMessage> {
    let raw = value.as_f64().ok_or(BadMessage::IdNotANumber)?;
    Ok(RequestId::from_raw(raw as i64))
}

fn decode_args(value: Value) -> Result<Vec<Value>, BadMessage> {
    match value {
        Value::Array(args) => Ok(args),
        _ => Err(BadMessage::ArgsNotAnArray),
    }
}
