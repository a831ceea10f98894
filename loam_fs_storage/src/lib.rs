//! # Loam filesystem storage
//!
//! A [`Provider`] keeping one file per session under a root directory.
//! Session keys are base64 digests and not path-safe, so file names are the
//! URL-safe base64 encoding of the key. Saves write the whole serialized
//! store through a temporary file and rename it into place, so a crashed
//! save never leaves a torn session behind.
//!
//! Saves for one session key serialize through a per-key write lock: a
//! session's death-time flush and its persistence task may both save the
//! same key at once, and the two writes share one tmp path and one rename
//! target. Distinct session keys save concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::future::{BoxFuture, FutureExt};
use loam_core::{Key, Provider, ProviderError, Store};
use tokio::sync::Mutex as AsyncMutex;

/// A provider persisting each session store to its own file.
///
/// Cheap to clone; clones share the same per-key write locks.
#[derive(Debug, Clone)]
pub struct FsProvider {
    root: PathBuf,
    write_locks: Arc<parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl FsProvider {
    /// Create a provider rooted at `root`. The directory is created on the
    /// first save.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    /// The directory session files live under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_path(&self, session_key: &str) -> PathBuf {
        self.root.join(URL_SAFE_NO_PAD.encode(session_key))
    }

    /// The write lock serializing saves for `session_key`.
    fn write_lock(&self, session_key: &str) -> Arc<AsyncMutex<()>> {
        self.write_locks
            .lock()
            .entry(session_key.to_owned())
            .or_default()
            .clone()
    }
}

impl Provider for FsProvider {
    fn save<'a>(
        &'a self,
        session_key: &'a str,
        what_changed: Option<&'a Key>,
        store: &'a Store,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        async move {
            let lock = self.write_lock(session_key);
            let _write_guard = lock.lock().await;

            tokio::fs::create_dir_all(&self.root).await?;

            let path = self.session_path(session_key);
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, store.serialize()).await?;
            tokio::fs::rename(&tmp, &path).await?;

            tracing::debug!(
                path = %path.display(),
                changed = what_changed.map(ToString::to_string).as_deref(),
                "session saved"
            );
            Ok(())
        }
        .boxed()
    }

    fn load<'a>(
        &'a self,
        session_key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Store>, ProviderError>> {
        async move {
            let path = self.session_path(session_key);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            };

            let store = Store::new();
            store.deserialize(&bytes)?;
            Ok(Some(store))
        }
        .boxed()
    }
}
