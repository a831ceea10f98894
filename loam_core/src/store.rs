//! Concurrent key/value storage with change notifications.
//!
//! A [`Store`] maps arbitrary JSON keys to arbitrary JSON values. It backs
//! both per-session and per-connection state, and drives session persistence
//! through its change streams:
//!
//! - [`Store::change_notify`] hands out single-shot channels that fire once
//!   on the next mutation and are then spent;
//! - [`Store::change_watcher`] hands out a buffered stream that yields the
//!   key of every mutation until the watcher is removed. When the buffer is
//!   full, delivery moves to a spawned task; events are never dropped.
//!
//! All operations go through one reader/writer lock, which is never held
//! across an await.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::key::Key;

/// Serialization format version written as the leading byte.
const STORE_VERSION: u8 = 1;

/// Buffer depth of a change watcher before delivery is deferred.
const WATCHER_BUFFER: usize = 10;

/// Identifies a change watcher for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

/// A store payload that could not be deserialized.
#[derive(Debug, Error)]
pub enum StoreDecodeError {
    /// The payload was empty.
    #[error("store payload is empty")]
    Empty,

    /// The version byte was not one this build understands.
    #[error("unsupported store version {0}")]
    UnsupportedVersion(u8),

    /// The entry list was not valid JSON.
    #[error("invalid store payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Default)]
struct State {
    data: HashMap<Key, Value>,
    notifiers: Vec<oneshot::Sender<()>>,
    watchers: HashMap<u64, mpsc::Sender<Key>>,
    next_watcher: u64,
}

/// A concurrent JSON key/value map with change notifications.
///
/// Cheap to clone; clones share the same underlying map.
#[derive(Clone, Default)]
pub struct Store {
    state: Arc<RwLock<State>>,
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the store contains `key`.
    pub fn has(&self, key: &Key) -> bool {
        self.state.read().data.contains_key(key)
    }

    /// The value under `key`, if present.
    pub fn get(&self, key: &Key) -> Option<Value> {
        self.state.read().data.get(key).cloned()
    }

    /// The value under `key`, inserting `default` first when absent.
    ///
    /// The insert-on-miss counts as a mutation and fires change
    /// notifications.
    pub fn get_or_insert(&self, key: impl Into<Key>, default: Value) -> Value {
        let key = key.into();

        if let Some(value) = self.state.read().data.get(&key) {
            return value.clone();
        }

        let mut state = self.state.write();
        // Re-check: another writer may have raced us between the locks.
        if let Some(value) = state.data.get(&key) {
            return value.clone();
        }
        state.data.insert(key.clone(), default.clone());
        fire_changed(&mut state, &[key]);
        default
    }

    /// Set `key` to `value`.
    pub fn set(&self, key: impl Into<Key>, value: Value) {
        let key = key.into();
        let mut state = self.state.write();
        state.data.insert(key.clone(), value);
        fire_changed(&mut state, &[key]);
    }

    /// Remove `key`.
    pub fn delete(&self, key: impl Into<Key>) {
        let key = key.into();
        let mut state = self.state.write();
        state.data.remove(&key);
        fire_changed(&mut state, &[key]);
    }

    /// Remove every entry. Watchers observe one event per removed key.
    pub fn reset(&self) {
        let mut state = self.state.write();
        let removed: Vec<Key> = state.data.drain().map(|(k, _)| k).collect();
        fire_changed(&mut state, &removed);
    }

    /// All keys, in no particular order.
    pub fn keys(&self) -> Vec<Key> {
        self.state.read().data.keys().cloned().collect()
    }

    /// All values, in no particular order.
    pub fn values(&self) -> Vec<Value> {
        self.state.read().data.values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.state.read().data.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().data.is_empty()
    }

    /// A copy of the underlying map.
    pub fn snapshot(&self) -> HashMap<Key, Value> {
        self.state.read().data.clone()
    }

    /// A single-shot channel that fires on the next mutation.
    ///
    /// The channel is spent after one event; callers who want continuous
    /// notifications re-subscribe, or use [`Store::change_watcher`].
    pub fn change_notify(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.state.write().notifiers.push(tx);
        rx
    }

    /// A buffered stream of mutated keys.
    ///
    /// The stream lives until [`Store::remove_change_watcher`] is called
    /// with the returned id (or the receiver is dropped).
    pub fn change_watcher(&self) -> (WatcherId, mpsc::Receiver<Key>) {
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
        let mut state = self.state.write();
        let id = state.next_watcher;
        state.next_watcher += 1;
        state.watchers.insert(id, tx);
        (WatcherId(id), rx)
    }

    /// Remove a change watcher; its stream ends.
    pub fn remove_change_watcher(&self, id: WatcherId) {
        self.state.write().watchers.remove(&id.0);
    }

    /// Encode the store: a version byte followed by the JSON entry list.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let state = self.state.read();
        let entries: Vec<(&Key, &Value)> = state.data.iter().collect();

        #[allow(clippy::expect_used)]
        let body = serde_json::to_vec(&entries).expect("JSON values encode infallibly");

        let mut out = Vec::with_capacity(1 + body.len());
        out.push(STORE_VERSION);
        out.extend_from_slice(&body);
        out
    }

    /// Replace the map with a previously serialized one.
    ///
    /// The swap is atomic, and watchers observe one event per restored key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreDecodeError`] on an empty payload, an unknown version
    /// byte, or an undecodable entry list.
    pub fn deserialize(&self, data: &[u8]) -> Result<(), StoreDecodeError> {
        let (&version, body) = data.split_first().ok_or(StoreDecodeError::Empty)?;
        if version != STORE_VERSION {
            return Err(StoreDecodeError::UnsupportedVersion(version));
        }

        let entries: Vec<(Key, Value)> = serde_json::from_slice(body)?;

        let mut state = self.state.write();
        state.data = entries.into_iter().collect();
        let restored: Vec<Key> = state.data.keys().cloned().collect();
        fire_changed(&mut state, &restored);
        Ok(())
    }
}

/// Signal every pending notifier and deliver `keys` to every watcher.
///
/// Called with the write lock held; the deferred-delivery path hands the
/// send to a task so the lock is never held across an await.
fn fire_changed(state: &mut State, keys: &[Key]) {
    for tx in state.notifiers.drain(..) {
        let _ = tx.send(());
    }

    if keys.is_empty() {
        return;
    }

    let mut closed = Vec::new();
    for (&id, tx) in &state.watchers {
        for key in keys {
            match tx.try_send(key.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(key)) => {
                    deliver_deferred(tx.clone(), key);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(id);
                    break;
                }
            }
        }
    }
    for id in closed {
        state.watchers.remove(&id);
    }
}

/// Deliver a key to a watcher whose buffer is full without dropping it.
fn deliver_deferred(tx: mpsc::Sender<Key>, key: Key) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = tx.send(key).await;
        });
    } else {
        let _ = tx.blocking_send(key);
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Contents stay out of logs; only the entry count is shown.
        write!(f, "Store(len={})", self.len())
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store(len={})", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn set_get_delete() {
        let store = Store::new();
        assert!(!store.has(&Key::from("a")));

        store.set("a", json!(1));
        assert!(store.has(&Key::from("a")));
        assert_eq!(store.get(&Key::from("a")), Some(json!(1)));

        store.delete("a");
        assert_eq!(store.get(&Key::from("a")), None);
    }

    #[test]
    fn get_or_insert_mutates_on_miss() {
        let store = Store::new();
        let notify = store.change_notify();

        let v = store.get_or_insert("counter", json!(0));
        assert_eq!(v, json!(0));
        assert!(store.has(&Key::from("counter")));
        notify.blocking_recv().expect("insert-on-miss must notify");

        // Present key: plain read, no mutation.
        let mut notify = store.change_notify();
        let v = store.get_or_insert("counter", json!(99));
        assert_eq!(v, json!(0));
        assert!(notify.try_recv().is_err());
    }

    #[test]
    fn change_notify_fires_once_per_subscription() {
        let store = Store::new();
        let first = store.change_notify();
        store.set("k", json!(1));
        first.blocking_recv().expect("fired");

        // The old channel is spent; a new mutation needs a new subscription.
        let second = store.change_notify();
        store.delete("k");
        second.blocking_recv().expect("fired again");
    }

    #[tokio::test]
    async fn watcher_sees_mutated_keys() {
        let store = Store::new();
        let (id, mut rx) = store.change_watcher();

        store.set("a", json!(1));
        store.delete("a");
        assert_eq!(rx.recv().await, Some(Key::from("a")));
        assert_eq!(rx.recv().await, Some(Key::from("a")));

        store.remove_change_watcher(id);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn reset_fires_for_every_prior_key() {
        let store = Store::new();
        store.set("a", json!(1));
        store.set("b", json!(2));
        store.set("c", json!(3));

        let (_id, mut rx) = store.change_watcher();
        store.reset();
        assert!(store.is_empty());

        let mut seen = HashSet::new();
        for _ in 0..3 {
            seen.insert(rx.recv().await.expect("event"));
        }
        assert_eq!(
            seen,
            HashSet::from([Key::from("a"), Key::from("b"), Key::from("c")])
        );
    }

    #[tokio::test]
    async fn full_watcher_buffer_defers_instead_of_dropping() {
        let store = Store::new();
        let (_id, mut rx) = store.change_watcher();

        // Push well past the buffer without draining.
        for i in 0..25 {
            store.set(format!("k{i}"), json!(i));
        }

        let mut seen = HashSet::new();
        for _ in 0..25 {
            seen.insert(rx.recv().await.expect("event"));
        }
        assert_eq!(seen.len(), 25);
    }

    #[test]
    fn serialize_round_trips() {
        let store = Store::new();
        store.set("name", json!("loam"));
        store.set(Key::new(json!([1, 2])), json!({"nested": true}));
        store.set(7i64, json!(null));

        let restored = Store::new();
        restored
            .deserialize(&store.serialize())
            .expect("deserialize");
        assert_eq!(restored.snapshot(), store.snapshot());
    }

    #[test]
    fn serialized_form_is_version_prefixed() {
        let store = Store::new();
        assert_eq!(store.serialize()[0], 1);
    }

    #[tokio::test]
    async fn deserialize_replaces_atomically_and_notifies() {
        let donor = Store::new();
        donor.set("x", json!(1));
        let encoded = donor.serialize();

        let store = Store::new();
        store.set("stale", json!(0));
        let (_id, mut rx) = store.change_watcher();

        store.deserialize(&encoded).expect("deserialize");
        assert!(!store.has(&Key::from("stale")));
        assert_eq!(store.get(&Key::from("x")), Some(json!(1)));
        assert_eq!(rx.recv().await, Some(Key::from("x")));
    }

    #[test]
    fn deserialize_rejects_bad_payloads() {
        let store = Store::new();
        assert!(matches!(
            store.deserialize(&[]),
            Err(StoreDecodeError::Empty)
        ));
        assert!(matches!(
            store.deserialize(&[9, b'[', b']']),
            Err(StoreDecodeError::UnsupportedVersion(9))
        ));
        assert!(matches!(
            store.deserialize(&[1, b'x']),
            Err(StoreDecodeError::Json(_))
        ));
    }

    #[test]
    fn display_redacts_contents() {
        let store = Store::new();
        store.set("secret", json!("hunter2"));
        let shown = store.to_string();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("len=1"));
    }
}
