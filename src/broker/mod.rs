//! The in-memory event fabric: keyed value/hash/sorted-set storage with
//! TTL, plus pub/sub over the closed channel set in [`channels`].
//!
//! [`Broker`] is defined as a trait rather than a concrete type so
//! production code and tests can swap implementations without changing
//! the components that depend on it — the same shape as the acquisition
//! layer's `PersistenceLayer` trait, generalized to cover hashes,
//! sorted sets and pub/sub in addition to plain key/value.

pub mod channels;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::{Classify, ErrorKind};

pub use memory::InMemoryBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker operation timed out")]
    Timeout,
    #[error("broker publish exhausted its retry budget")]
    PublishRetriesExhausted,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for BrokerError {
    fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Timeout | BrokerError::PublishRetriesExhausted => ErrorKind::Transient,
            BrokerError::Serialization(_) => ErrorKind::Degraded,
        }
    }
}

/// A single entry in a sorted time-series: `(score, member)`. Scores are
/// Unix timestamps in this system.
pub type ZEntry = (f64, Vec<u8>);

#[async_trait]
pub trait Broker: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BrokerError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError>;
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;

    async fn hset(
        &self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError>;
    async fn hgetall(&self, key: &str) -> Result<Option<Vec<(String, Vec<u8>)>>, BrokerError>;

    async fn zadd(&self, key: &str, score: f64, member: Vec<u8>, ttl: Option<Duration>) -> Result<(), BrokerError>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<ZEntry>, BrokerError>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<(), BrokerError>;

    /// Publish retries internally up to a bounded budget (default 10
    /// attempts, linear backoff) and returns
    /// [`BrokerError::PublishRetriesExhausted`] only once that budget is
    /// spent — a lost single message is tolerable for sensor readings
    /// per §4.1, so callers besides the Persister should log and move
    /// on rather than treat this as fatal.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>>;

    /// Apply (or replace) the TTL on an existing key, used by the
    /// Maintenance component's TTL-policy sweep. No-op if the key is
    /// absent.
    async fn apply_ttl(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Keys whose current TTL policy should be inspected by
    /// Maintenance, matched against a simple `*`-glob pattern.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, BrokerError>;
}

/// Convenience helpers for JSON-encoded payloads, layered over the raw
/// byte operations so components work with typed values instead of
/// hand-rolling `serde_json::to_vec` at every call site.
#[async_trait]
pub trait BrokerJsonExt: Broker {
    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BrokerError> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn publish_json<T: Serialize + Sync>(&self, channel: &str, value: &T) -> Result<(), BrokerError> {
        let bytes = serde_json::to_vec(value)?;
        self.publish(channel, bytes).await
    }
}

impl<T: Broker + ?Sized> BrokerJsonExt for T {}
