use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Unused entries are pruned once the map grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

/// Per-key reader/writer locks.
///
/// Writers to the same key are serialized; readers share. Different keys never
/// contend beyond the short critical section that hands out the lock.
#[derive(Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &str) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock().await;
        if map.len() >= PRUNE_THRESHOLD {
            // Only the map holds these: nobody is waiting on or holding them.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub async fn read(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.slot(key).await.read_owned().await
    }

    pub async fn write(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.slot(key).await.write_owned().await
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn writers_on_the_same_key_are_exclusive() {
        let locks = KeyLocks::new();
        let held = locks.write("a").await;
        let blocked = timeout(Duration::from_millis(20), locks.write("a")).await;
        assert!(blocked.is_err());
        drop(held);
        assert!(timeout(Duration::from_millis(20), locks.write("a"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn readers_share_and_keys_are_independent() {
        let locks = KeyLocks::new();
        let _r1 = locks.read("a").await;
        assert!(timeout(Duration::from_millis(20), locks.read("a"))
            .await
            .is_ok());
        assert!(timeout(Duration::from_millis(20), locks.write("b"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn prunes_idle_entries() {
        let locks = KeyLocks::new();
        for i in 0..PRUNE_THRESHOLD {
            drop(locks.write(&format!("k{i}")).await);
        }
        let _held = locks.write("held").await;
        assert!(locks.len().await <= 2);
    }
}
