//! Session storage providers.
//!
//! A provider persists session stores keyed by session key. The server
//! calls [`Provider::save`] on every store mutation (and once per key while
//! a session dies) and [`Provider::load`] when a cookie arrives for a
//! session that is no longer cached in memory.
//!
//! Providers must be safe for concurrent invocation across distinct session
//! keys.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use thiserror::Error;

use crate::key::Key;
use crate::store::{Store, StoreDecodeError};

/// A problem while saving or loading a session store.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend could not be reached or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored payload could not be decoded.
    #[error("stored session is corrupt: {0}")]
    Decode(#[from] StoreDecodeError),

    /// Any other backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Storage backend for session stores.
pub trait Provider: Send + Sync {
    /// Persist the store for `session_key`.
    ///
    /// `what_changed` names the mutated key, or is `None` for the bulk
    /// saves performed while a session dies.
    fn save<'a>(
        &'a self,
        session_key: &'a str,
        what_changed: Option<&'a Key>,
        store: &'a Store,
    ) -> BoxFuture<'a, Result<(), ProviderError>>;

    /// Reconstruct the store previously saved for `session_key`, or `None`
    /// when the key is unknown.
    fn load<'a>(&'a self, session_key: &'a str) -> BoxFuture<'a, Result<Option<Store>, ProviderError>>;
}

/// An in-memory provider: sessions survive as long as the process does.
#[derive(Default)]
pub struct MemoryProvider {
    sessions: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryProvider {
    /// Create an empty in-memory provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of session stores currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session store is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl Provider for MemoryProvider {
    fn save<'a>(
        &'a self,
        session_key: &'a str,
        _what_changed: Option<&'a Key>,
        store: &'a Store,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        async move {
            let encoded = store.serialize();
            self.sessions.lock().insert(session_key.to_owned(), encoded);
            Ok(())
        }
        .boxed()
    }

    fn load<'a>(&'a self, session_key: &'a str) -> BoxFuture<'a, Result<Option<Store>, ProviderError>> {
        async move {
            let encoded = self.sessions.lock().get(session_key).cloned();
            match encoded {
                Some(bytes) => {
                    let store = Store::new();
                    store.deserialize(&bytes)?;
                    Ok(Some(store))
                }
                None => Ok(None),
            }
        }
        .boxed()
    }
}
