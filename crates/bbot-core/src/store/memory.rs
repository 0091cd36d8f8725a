use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    domain::Record,
    errors::Error,
    store::{validate_key, Store},
    Result,
};

/// Volatile store for tests and embedding. Not durable across restarts.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Record> {
        validate_key(key)?;
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<Record> {
        validate_key(key)?;
        let record = Record {
            key: key.to_string(),
            value,
            updated_at: Utc::now(),
        };
        self.records
            .write()
            .await
            .insert(key.to_string(), record.clone());
        Ok(record)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.records
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.records.read().await;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
