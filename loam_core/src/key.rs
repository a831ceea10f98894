//! Hashable wrapper for arbitrary JSON values.
//!
//! Store keys, request names, and handler-registry keys may be any
//! JSON-compatible value. [`serde_json::Value`] itself is not `Eq + Hash`,
//! so [`Key`] supplies both by hashing the canonical JSON text (serde_json
//! maps are ordered, so equal values serialize identically).

use core::fmt;
use core::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An arbitrary JSON value usable as a map key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Value);

impl Key {
    /// Wrap a JSON value.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// The underlying JSON value.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.0
    }

    /// Unwrap into the underlying JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    fn canonical(&self) -> String {
        #[allow(clippy::expect_used)]
        let canonical = serde_json::to_string(&self.0).expect("JSON values encode infallibly");
        canonical
    }
}

// JSON numbers are never NaN, so `PartialEq` on `Value` is total here.
impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl From<Value> for Key {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(Value::from(s))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(Value::from(s))
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Self(Value::from(n))
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Self(Value::from(n))
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Self(Value::from(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn equal_values_hash_equal() {
        let mut map = HashMap::new();
        map.insert(Key::from("user"), 1);
        assert_eq!(map.get(&Key::new(json!("user"))), Some(&1));
    }

    #[test]
    fn object_keys_are_order_insensitive() {
        // serde_json orders map entries, so these are the same key.
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).expect("parse");
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).expect("parse");

        let mut map = HashMap::new();
        map.insert(Key::new(a), ());
        assert!(map.contains_key(&Key::new(b)));
    }

    #[test]
    fn distinct_types_are_distinct_keys() {
        assert_ne!(Key::from("1"), Key::from(1i64));
        assert_ne!(Key::from(true), Key::from("true"));
    }

    #[test]
    fn displays_as_canonical_json() {
        assert_eq!(Key::from("hi").to_string(), r#""hi""#);
        assert_eq!(Key::new(json!([1, 2])).to_string(), "[1,2]");
    }
}
