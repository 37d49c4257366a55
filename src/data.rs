//! A caching data layer in front of persistence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{Data, Message};
use crate::plugins::{DataManager, MessageWithData, Persistence};

/// A fully resolved message held in cache.
#[derive(Clone)]
struct CacheEntry {
    message: Message,
    data: Vec<Data>,
    inserted: Instant,
}

/// A data manager which caches fully resolved messages for a bounded amount of time.
///
/// Only messages with all of their data present are cached, as messages with missing data are
/// expected to be resolved again once their data arrives.
pub struct CachedDataManager {
    store: Arc<dyn Persistence>,
    cache: DashMap<Uuid, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl CachedDataManager {
    /// Create a new instance.
    pub fn new(config: &Config, store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl: config.cache_ttl(),
            max_entries: config.cache_max_entries,
        }
    }

    /// The number of entries currently cached.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn get_cached(&self, id: &Uuid) -> Option<MessageWithData> {
        let entry = self.cache.get(id)?;
        if entry.inserted.elapsed() > self.ttl {
            drop(entry);
            self.cache.remove(id);
            return None;
        }
        Some(MessageWithData {
            message: entry.message.clone(),
            data: entry.data.clone(),
            all_present: true,
        })
    }

    fn insert_cached(&self, message: &Message, data: &[Data]) {
        if self.max_entries == 0 {
            return;
        }
        if self.cache.len() >= self.max_entries {
            self.evict();
        }
        self.cache.insert(
            message.header.id,
            CacheEntry { message: message.clone(), data: data.to_vec(), inserted: Instant::now() },
        );
    }

    /// Evict expired entries, falling back to the oldest entry when none have expired.
    fn evict(&self) {
        let ttl = self.ttl;
        self.cache.retain(|_, entry| entry.inserted.elapsed() <= ttl);
        if self.cache.len() < self.max_entries {
            return;
        }
        let oldest = self
            .cache
            .iter()
            .min_by_key(|entry| entry.value().inserted)
            .map(|entry| *entry.key());
        if let Some(id) = oldest {
            self.cache.remove(&id);
        }
    }
}

impl DataManager for CachedDataManager {
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_message_with_data_cached(&self, id: &Uuid) -> Result<Option<MessageWithData>> {
        if let Some(found) = self.get_cached(id) {
            return Ok(Some(found));
        }

        let message = match self.store.get_message_by_id(id)? {
            Some(message) => message,
            None => return Ok(None),
        };
        let (mut data, mut all_present) = (Vec::with_capacity(message.data.len()), true);
        for data_ref in message.data.iter() {
            match self.store.get_data_by_id(&data_ref.id)? {
                Some(item) if item.hash == data_ref.hash => data.push(item),
                Some(item) => {
                    tracing::warn!(message = %id, data = %data_ref.id, expected = %data_ref.hash, got = %item.hash, "data hash mismatch");
                    all_present = false;
                }
                None => {
                    tracing::debug!(message = %id, data = %data_ref.id, "referenced data not found");
                    all_present = false;
                }
            }
        }

        if all_present {
            self.insert_cached(&message, &data);
        }
        Ok(Some(MessageWithData { message, data, all_present }))
    }

    fn update_message_if_cached(&self, msg: &Message) {
        if let Some(mut entry) = self.cache.get_mut(&msg.header.id) {
            entry.message = msg.clone();
        }
    }
}
