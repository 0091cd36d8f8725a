//! Persistent key/record storage.
//!
//! `Store` is the contract the rest of the core depends on; `FileStore` is the
//! durable binding rooted at a directory and `MemoryStore` backs tests.

use std::{collections::VecDeque, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;

use crate::{domain::Record, errors::Error, Result};

pub mod file;
pub mod locks;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Key/record storage.
///
/// Every operation is atomic for a single key. There are no cross-key
/// transactions. Implementations serialize writers per key and let readers
/// of the same key proceed concurrently.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Record>;

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<Record>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, in ascending order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Make every write that already returned durable.
    async fn flush(&self) -> Result<()>;
}

impl<'s> dyn Store + 's {
    /// Start a fresh, lazy scan over the records whose key starts with `prefix`.
    ///
    /// Keys are listed up front; values are read one at a time as the scan is
    /// advanced. Records deleted after the listing are skipped.
    pub async fn scan<'a>(&'a self, prefix: &str) -> Result<Scan<'a>> {
        let keys = self.keys(prefix).await?;
        Ok(Scan {
            store: self,
            keys: keys.into(),
        })
    }
}

/// A finite cursor over a prefix of the store. See [`Store::keys`].
pub struct Scan<'a> {
    store: &'a (dyn Store + 'a),
    keys: VecDeque<String>,
}

impl<'a> Scan<'a> {
    pub async fn next_record(&mut self) -> Option<Result<Record>> {
        while let Some(key) = self.keys.pop_front() {
            match self.store.get(&key).await {
                Ok(record) => return Some(Ok(record)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    /// Upper bound on the records still to come.
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    pub async fn collect_all(mut self) -> Result<Vec<Record>> {
        let mut out = Vec::with_capacity(self.keys.len());
        while let Some(record) = self.next_record().await {
            out.push(record?);
        }
        Ok(out)
    }
}

/// Opens the store while the core is starting.
#[async_trait]
pub trait StoreOpener: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn Store>>;
}

/// Opens a [`FileStore`] rooted at a directory.
#[derive(Clone, Debug)]
pub struct FileStoreOpener {
    pub root: PathBuf,
    pub timeout: Duration,
}

impl FileStoreOpener {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }
}

#[async_trait]
impl StoreOpener for FileStoreOpener {
    async fn open(&self) -> Result<Arc<dyn Store>> {
        let store = FileStore::open(self.root.clone(), self.timeout).await?;
        Ok(Arc::new(store))
    }
}

/// Hands out an already constructed store (tests, embedding).
#[derive(Clone)]
pub struct OpenedStore(pub Arc<dyn Store>);

#[async_trait]
impl StoreOpener for OpenedStore {
    async fn open(&self) -> Result<Arc<dyn Store>> {
        Ok(self.0.clone())
    }
}

/// Open with bounded retries and exponential backoff.
///
/// Exhausting `attempts` yields `StorageUnavailable` carrying the last error.
pub async fn open_with_retry(
    opener: &dyn StoreOpener,
    attempts: u32,
    initial_backoff: Duration,
) -> Result<Arc<dyn Store>> {
    let attempts = attempts.max(1);
    let mut backoff = initial_backoff;
    let mut last: Option<Error> = None;

    for attempt in 1..=attempts {
        match opener.open().await {
            Ok(store) => return Ok(store),
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "store open failed");
                last = Some(e);
            }
        }
        if attempt < attempts {
            sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    let reason = last.map(|e| e.to_string()).unwrap_or_default();
    Err(Error::StorageUnavailable(format!(
        "gave up after {attempts} attempts: {reason}"
    )))
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}
