use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context as _;
use async_nats::jetstream::{
    context::KeyValueErrorKind,
    kv::{self, CreateErrorKind},
    Context as JsContext,
};
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::BusError;

pub type SharedKvStore = Arc<dyn KvStore>;

/// Single-key cache operations with per-key TTL. The ACL evaluator treats
/// every error from this trait as a miss.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError>;
}

/// In-memory TTL map double.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    inner: Arc<RwLock<HashMap<String, (String, OffsetDateTime)>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let now = OffsetDateTime::now_utc();
        let guard = self.inner.read().await;
        Ok(guard
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError> {
        let expires = OffsetDateTime::now_utc() + ttl;
        let mut guard = self.inner.write().await;
        guard.retain(|_, (_, exp)| *exp > OffsetDateTime::now_utc());
        guard.insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }
}

/// JetStream key-value binding. Per-key TTL is only available on create, so
/// writes purge first.
pub struct NatsKvStore {
    bucket: kv::Store,
}

impl NatsKvStore {
    /// Ensures the bucket exists (or creates it) and returns a handle.
    pub async fn new(js: &JsContext, namespace: &str) -> Result<Self, BusError> {
        let bucket = match js.get_key_value(namespace).await {
            Ok(store) => store,
            Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
                .create_key_value(kv::Config {
                    bucket: namespace.to_string(),
                    history: 1,
                    max_age: Duration::from_secs(0),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("create JetStream KV bucket {namespace}"))
                .map_err(BusError::Transport)?,
            Err(err) => {
                return Err(BusError::Transport(
                    anyhow::anyhow!(err).context("initializing kv bucket"),
                ))
            }
        };
        Ok(Self { bucket })
    }
}

#[async_trait]
impl KvStore for NatsKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let entry = self
            .bucket
            .entry(key)
            .await
            .with_context(|| format!("kv get {key}"))
            .map_err(BusError::Transport)?;
        Ok(entry.and_then(|e| String::from_utf8(e.value.to_vec()).ok()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError> {
        let payload = value.as_bytes().to_vec();
        match self
            .bucket
            .create_with_ttl(key, payload.clone().into(), ttl)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == CreateErrorKind::AlreadyExists => {
                self.bucket
                    .purge(key)
                    .await
                    .with_context(|| format!("kv purge {key}"))
                    .map_err(BusError::Transport)?;
                self.bucket
                    .create_with_ttl(key, payload.into(), ttl)
                    .await
                    .with_context(|| format!("kv recreate {key}"))
                    .map_err(BusError::Transport)?;
                Ok(())
            }
            Err(err) => Err(BusError::Transport(
                anyhow::anyhow!(err).context(format!("kv set {key}")),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let kv = InMemoryKvStore::new();
        kv.set_with_ttl("k", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_missing() {
        let kv = InMemoryKvStore::new();
        kv.set_with_ttl("k", "0", Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let kv = InMemoryKvStore::new();
        kv.set_with_ttl("k", "0", Duration::from_secs(60))
            .await
            .unwrap();
        kv.set_with_ttl("k", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("1"));
    }
}
