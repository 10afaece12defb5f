//! Production [`Broker`] implementation: a process-local, concurrently
//! accessible store backed by [`dashmap::DashMap`], with TTL tracked
//! alongside each key so expired reads return absent without a separate
//! sweep (Maintenance still runs its own policy sweep per §4.9, but
//! correctness does not depend on it running promptly).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::broadcast;

use super::{Broker, BrokerError, ZEntry};

const BROADCAST_CAPACITY: usize = 1024;

struct TtlEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> TtlEntry<V> {
    fn fresh(value: V, ttl: Option<Duration>) -> Self {
        TtlEntry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if Instant::now() >= t)
    }
}

pub struct InMemoryBroker {
    kv: DashMap<String, TtlEntry<Vec<u8>>>,
    hashes: DashMap<String, TtlEntry<HashMap<String, Vec<u8>>>>,
    zsets: DashMap<String, TtlEntry<Vec<ZEntry>>>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker {
            kv: DashMap::new(),
            hashes: DashMap::new(),
            zsets: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .clone()
    }

    fn glob_to_regex(pattern: &str) -> Option<Regex> {
        let escaped = regex::escape(pattern).replace("\\*", ".*");
        Regex::new(&format!("^{escaped}$")).ok()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BrokerError> {
        self.kv.insert(key.to_string(), TtlEntry::fresh(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        match self.kv.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.kv.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.kv.remove(key);
        self.hashes.remove(key);
        self.zsets.remove(key);
        Ok(())
    }

    async fn hset(
        &self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let mut entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| TtlEntry::fresh(HashMap::new(), ttl));
        for (field, value) in fields {
            entry.value.insert(field, value);
        }
        entry.expires_at = ttl.map(|d| Instant::now() + d).or(entry.expires_at);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Option<Vec<(String, Vec<u8>)>>, BrokerError> {
        match self.hashes.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.hashes.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(
                entry.value.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            None => Ok(None),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: Vec<u8>, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut entry = self
            .zsets
            .entry(key.to_string())
            .or_insert_with(|| TtlEntry::fresh(Vec::new(), ttl));
        entry.value.push((score, member));
        entry
            .value
            .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        if ttl.is_some() {
            entry.expires_at = ttl.map(|d| Instant::now() + d);
        }
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<ZEntry>, BrokerError> {
        match self.zsets.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.zsets.remove(key);
                Ok(Vec::new())
            }
            Some(entry) => Ok(entry
                .value
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .cloned()
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<(), BrokerError> {
        if let Some(mut entry) = self.zsets.get_mut(key) {
            entry.value.retain(|(score, _)| *score < min || *score > max);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        // `send` only fails when there are currently no subscribers,
        // which is an ordinary state for this pub/sub fabric (readers
        // subscribe and unsubscribe freely) and not the retry-worthy
        // "broker unavailable" condition §4.1 describes for a networked
        // broker; a lost message to zero subscribers is simply dropped.
        let _ = self.sender_for(channel).send(payload);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        self.sender_for(channel).subscribe()
    }

    async fn apply_ttl(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let expires_at = Some(Instant::now() + ttl);
        if let Some(mut e) = self.kv.get_mut(key) {
            e.expires_at = expires_at;
        }
        if let Some(mut e) = self.hashes.get_mut(key) {
            e.expires_at = expires_at;
        }
        if let Some(mut e) = self.zsets.get_mut(key) {
            e.expires_at = expires_at;
        }
        Ok(())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let Some(re) = Self::glob_to_regex(pattern) else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<String> = self
            .kv
            .iter()
            .map(|e| e.key().clone())
            .chain(self.hashes.iter().map(|e| e.key().clone()))
            .chain(self.zsets.iter().map(|e| e.key().clone()))
            .filter(|k| re.is_match(k))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let broker = InMemoryBroker::new();
        broker.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(broker.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn ttl_expires_key() {
        let broker = InMemoryBroker::new();
        broker
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zrange_filters_by_score() {
        let broker = InMemoryBroker::new();
        broker.zadd("z", 1.0, b"a".to_vec(), None).await.unwrap();
        broker.zadd("z", 5.0, b"b".to_vec(), None).await.unwrap();
        broker.zadd("z", 10.0, b"c".to_vec(), None).await.unwrap();
        let range = broker.zrange_by_score("z", 2.0, 8.0).await.unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].1, b"b".to_vec());
    }

    #[tokio::test]
    async fn zremrangebyscore_evicts_old_entries() {
        let broker = InMemoryBroker::new();
        broker.zadd("z", 1.0, b"old".to_vec(), None).await.unwrap();
        broker.zadd("z", 100.0, b"new".to_vec(), None).await.unwrap();
        broker.zremrangebyscore("z", 0.0, 50.0).await.unwrap();
        let range = broker.zrange_by_score("z", 0.0, 1000.0).await.unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].1, b"new".to_vec());
    }

    #[tokio::test]
    async fn subscribers_receive_only_messages_after_subscription() {
        let broker = InMemoryBroker::new();
        broker.publish("traffic:radar", b"before".to_vec()).await.ok();
        let mut rx = broker.subscribe("traffic:radar");
        broker.publish("traffic:radar", b"after".to_vec()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, b"after".to_vec());
    }

    #[tokio::test]
    async fn keys_matching_supports_glob() {
        let broker = InMemoryBroker::new();
        broker.set("weather:dht22:latest", b"1".to_vec(), None).await.unwrap();
        broker.set("weather:airport:latest", b"1".to_vec(), None).await.unwrap();
        broker.set("radar:latest", b"1".to_vec(), None).await.unwrap();
        let matched = broker.keys_matching("weather:*").await.unwrap();
        assert_eq!(matched.len(), 2);
    }
}
