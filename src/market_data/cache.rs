//! Key-value cache with per-key TTL, plus the typed layer the orchestrator
//! reads and writes through.
//!
//! The store may be shared with unrelated subsystems, so this module only ever
//! touches keys in its own `price:`, `history:`, `perf:` and `fx:` namespaces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

use super::AssetRef;

#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value`; `ttl: None` never expires.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Live keys matching a glob where `*` matches any run of characters.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;
}

pub const LAST_GOOD_SUFFIX: &str = ":last_good";
pub const FX_RATES_KEY: &str = "fx:rates";
pub const FX_META_KEY: &str = "fx:meta";

pub fn price_key(asset: &AssetRef) -> String {
    format!("price:{}:{}", asset.kind, asset.id)
}

pub fn history_key(asset: &AssetRef, days: u32) -> String {
    format!("history:{}:{}:{days}", asset.kind, asset.id)
}

pub fn perf_key(asset: &AssetRef) -> String {
    format!("perf:{}:{}", asset.kind, asset.id)
}

pub fn last_good_key(key: &str) -> String {
    format!("{key}{LAST_GOOD_SUFFIX}")
}

/// Glob match supporting only `*`.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(head) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(head) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((tail, middle)) = parts.split_last() else {
        // No `*` at all: exact match.
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(tail)
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process store, used in tests and when no durable backend is configured.
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn is_live(&self, entry: &MemoryEntry) -> bool {
        entry.expires_at.map_or(true, |at| at > self.clock.now())
    }
}

/// Absolute expiry for a TTL. TTLs too large to represent never expire.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    now.checked_add_signed(ttl)
}

#[async_trait::async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if self.is_live(entry) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = expiry(self.clock.now(), ttl);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| self.is_live(entry) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Typed, best-effort access to a [`CacheStore`].
///
/// Read failures are treated as misses and write failures are logged and
/// dropped; a broken cache never fails a fetch.
#[derive(Clone)]
pub struct CacheLayer {
    store: Arc<dyn CacheStore>,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "discarding unparseable cache entry");
                None
            }
        }
    }

    pub async fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "failed to serialize cache entry");
                return;
            }
        };
        if let Err(e) = self.store.set(key, json, ttl).await {
            warn!(key, error = %e, "cache write failed");
        }
    }

    /// Writes the TTL entry and its non-expiring last-good companion. Only
    /// call this with verified live data.
    pub async fn write_with_last_good<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        self.write(key, value, Some(ttl)).await;
        self.write(&last_good_key(key), value, None).await;
    }

    pub async fn read_last_good<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.read(&last_good_key(key)).await
    }

    /// Drops every TTL entry for `asset`. Last-good snapshots survive.
    pub async fn invalidate(&self, asset: &AssetRef) -> Result<usize> {
        let mut keys = vec![price_key(asset), perf_key(asset)];
        let history_pattern = format!("history:{}:{}:*", asset.kind, asset.id);
        keys.extend(
            self.store
                .scan(&history_pattern)
                .await?
                .into_iter()
                .filter(|key| !key.ends_with(LAST_GOOD_SUFFIX)),
        );

        let mut removed = 0;
        for key in keys {
            if self.store.get(&key).await?.is_some() {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }
        debug!(asset = %asset, removed, "cache invalidated");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()))
    }

    #[test]
    fn key_shapes() {
        let btc = AssetRef::crypto("bitcoin");
        assert_eq!(price_key(&btc), "price:crypto:bitcoin");
        assert_eq!(history_key(&btc, 30), "history:crypto:bitcoin:30");
        assert_eq!(perf_key(&AssetRef::stock("AAPL")), "perf:stock:AAPL");
        assert_eq!(last_good_key("price:stock:AAPL"), "price:stock:AAPL:last_good");
    }

    #[test]
    fn globs() {
        assert!(glob_match("history:crypto:bitcoin:*", "history:crypto:bitcoin:7"));
        assert!(!glob_match("history:crypto:bitcoin:*", "history:crypto:bitcoin-cash:7"));
        assert!(glob_match("*:last_good", "price:stock:AAPL:last_good"));
        assert!(glob_match("price:*:AAPL", "price:stock:AAPL"));
        assert!(glob_match("fx:rates", "fx:rates"));
        assert!(!glob_match("fx:rates", "fx:rates2"));
        assert!(glob_match("*", "anything"));
    }

    #[tokio::test]
    async fn memory_store_expires_entries() -> Result<()> {
        let clock = clock();
        let store = MemoryCacheStore::with_clock(clock.clone());
        store.set("a", "1".into(), Some(Duration::from_secs(60))).await?;
        store.set("b", "2".into(), None).await?;

        clock.advance(chrono::Duration::seconds(59));
        assert_eq!(store.get("a").await?.as_deref(), Some("1"));

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(store.get("a").await?, None);
        assert_eq!(store.get("b").await?.as_deref(), Some("2"));
        assert_eq!(store.scan("*").await?, vec!["b".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn layer_treats_garbage_as_miss() {
        let store = Arc::new(MemoryCacheStore::new());
        store.set("price:stock:AAPL", "not json".into(), None).await.unwrap();
        let layer = CacheLayer::new(store);
        let value: Option<f64> = layer.read("price:stock:AAPL").await;
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn invalidate_keeps_last_good_and_foreign_keys() -> Result<()> {
        let store = Arc::new(MemoryCacheStore::new());
        let layer = CacheLayer::new(store.clone());
        let btc = AssetRef::crypto("bitcoin");

        layer.write_with_last_good(&price_key(&btc), &1.0, Duration::from_secs(60)).await;
        layer.write_with_last_good(&history_key(&btc, 7), &2.0, Duration::from_secs(60)).await;
        layer.write(&perf_key(&btc), &3.0, Some(Duration::from_secs(60))).await;
        layer
            .write(&price_key(&AssetRef::crypto("bitcoin-cash")), &4.0, None)
            .await;
        store.set("session:abc", "x".into(), None).await?;

        assert_eq!(layer.invalidate(&btc).await?, 3);

        let remaining = store.scan("*").await?;
        assert_eq!(
            remaining,
            vec![
                "history:crypto:bitcoin:7:last_good".to_string(),
                "price:crypto:bitcoin-cash".to_string(),
                "price:crypto:bitcoin:last_good".to_string(),
                "session:abc".to_string(),
            ]
        );
        Ok(())
    }
}
