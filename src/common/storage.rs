//! Stored items and the storage engine contract.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::Id;

/// Default number of items a [MemoryStorage] keeps before evicting the least recently used.
pub const MAX_VALUES: usize = 1000;

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A value stored in the Dht, with the metadata needed to republish and expire it.
pub struct StorageItem {
    pub value: Value,
    /// Id of the node that originally published this value.
    pub publisher: Id,
    /// Milliseconds since the unix epoch, refreshed on every republish.
    pub timestamp: u64,
}

impl StorageItem {
    pub fn new(value: Value, publisher: Id) -> Self {
        StorageItem {
            value,
            publisher,
            timestamp: now_millis(),
        }
    }

    /// Wrap `value` for (re)publishing.
    ///
    /// A value that already is a stored item keeps its publisher and gets a fresh
    /// timestamp, anything else is published by `publisher`.
    pub fn from_value(value: Value, publisher: Id) -> Self {
        let is_item = value
            .as_object()
            .map(|object| {
                object.contains_key("value")
                    && object.contains_key("publisher")
                    && object.contains_key("timestamp")
            })
            .unwrap_or(false);

        if is_item {
            if let Ok(item) = serde_json::from_value::<StorageItem>(value.clone()) {
                return item.refreshed();
            }
        }

        StorageItem::new(value, publisher)
    }

    /// Same item with the timestamp set to now.
    pub fn refreshed(mut self) -> Self {
        self.timestamp = now_millis().max(self.timestamp);
        self
    }

    /// Time elapsed since the last (re)publish, relative to `now` in milliseconds.
    pub fn age(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.timestamp))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Errors raised by a [Storage] engine.
pub enum StorageError {
    #[error("Storage lock was poisoned")]
    Poisoned,

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Key value store for [StorageItem]s.
pub trait Storage: Debug + Send {
    fn get(&self, key: &Id) -> Result<Option<StorageItem>, StorageError>;

    fn put(&mut self, key: Id, item: StorageItem) -> Result<(), StorageError>;

    fn del(&mut self, key: &Id) -> Result<Option<StorageItem>, StorageError>;

    /// Snapshot of every stored item.
    fn entries(&self) -> Result<Vec<(Id, StorageItem)>, StorageError>;

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.entries()?.len())
    }
}

#[derive(Debug, Clone)]
/// In memory LRU [Storage].
///
/// Clones share the same items.
pub struct MemoryStorage {
    items: Arc<Mutex<LruCache<Id, StorageItem>>>,
}

impl MemoryStorage {
    pub fn new(capacity: NonZeroUsize) -> Self {
        MemoryStorage {
            items: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<Id, StorageItem>>, StorageError> {
        self.items.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(MAX_VALUES).unwrap_or(NonZeroUsize::MIN))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &Id) -> Result<Option<StorageItem>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&mut self, key: Id, item: StorageItem) -> Result<(), StorageError> {
        self.lock()?.put(key, item);

        Ok(())
    }

    fn del(&mut self, key: &Id) -> Result<Option<StorageItem>, StorageError> {
        Ok(self.lock()?.pop(key))
    }

    fn entries(&self) -> Result<Vec<(Id, StorageItem)>, StorageError> {
        Ok(self
            .lock()?
            .iter()
            .map(|(key, item)| (*key, item.clone()))
            .collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.len())
    }
}
