//! Noun store (C3): a typed document store over [`StorageBackend`], with an
//! LRU hot cache. Does no similarity search itself — that is the HNSW
//! index's job; this module only persists and retrieves noun records.

use crate::error::Result;
use crate::model::Noun;
use crate::storage::{get_decoded, put_encoded, StorageBackend};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A small fixed-capacity LRU cache keyed by noun id.
///
/// Hand-rolled rather than pulled from a crate: the core only needs
/// get/insert/remove with eviction, and the HashMap+VecDeque combination
/// keeps the dependency list unchanged from the storage layer's.
struct LruCache {
    capacity: usize,
    map: HashMap<String, Noun>,
    order: VecDeque<String>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            let k = self.order.remove(pos).unwrap();
            self.order.push_back(k);
        }
    }

    fn get(&mut self, id: &str) -> Option<Noun> {
        let found = self.map.get(id).cloned();
        if found.is_some() {
            self.touch(id);
        }
        found
    }

    fn insert(&mut self, noun: Noun) {
        let id = noun.id.clone();
        if self.map.insert(id.clone(), noun).is_some() {
            self.touch(&id);
        } else {
            self.order.push_back(id);
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }

    fn remove(&mut self, id: &str) {
        self.map.remove(id);
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
    }
}

/// Persisted, cached noun store.
pub struct NounStore<S: StorageBackend> {
    backend: Arc<S>,
    cache: RwLock<LruCache>,
}

impl<S: StorageBackend> NounStore<S> {
    /// Create a noun store with the given hot-cache capacity.
    pub fn new(backend: Arc<S>, cache_capacity: usize) -> Self {
        Self {
            backend,
            cache: RwLock::new(LruCache::new(cache_capacity.max(1))),
        }
    }

    fn key(id: &str) -> String {
        format!("nouns/{id}")
    }

    /// Persist (insert or overwrite) a noun.
    pub async fn put(&self, noun: &Noun) -> Result<()> {
        put_encoded(self.backend.as_ref(), &Self::key(&noun.id), noun).await?;
        self.cache.write().insert(noun.clone());
        Ok(())
    }

    /// Fetch a noun by id, consulting the hot cache first.
    pub async fn get(&self, id: &str) -> Result<Option<Noun>> {
        if let Some(hit) = self.cache.write().get(id) {
            return Ok(Some(hit));
        }
        let loaded: Option<Noun> = get_decoded(self.backend.as_ref(), &Self::key(id)).await?;
        if let Some(noun) = &loaded {
            self.cache.write().insert(noun.clone());
        }
        Ok(loaded)
    }

    /// Delete a noun by id. Returns `true` if it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.cache.write().remove(id);
        self.backend.delete(&Self::key(id)).await
    }

    /// List all nouns matching `filter`. On a per-item decode failure, the
    /// error is recorded but the remaining items are still returned, per the
    /// core's batch-read failure policy.
    pub async fn list(&self, filter: impl Fn(&Noun) -> bool) -> Result<Vec<Noun>> {
        let mut out = Vec::new();
        for key in self.backend.list("nouns/").await? {
            if let Some(noun) = get_decoded::<Noun, _>(self.backend.as_ref(), &key).await? {
                if filter(&noun) {
                    out.push(noun);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NounType, Noun};
    use crate::storage::memory::MemoryBackend;
    use std::collections::BTreeMap;

    fn sample(id: &str) -> Noun {
        Noun {
            id: id.to_string(),
            r#type: NounType::Thing,
            vector: vec![0.0; crate::model::VECTOR_DIM],
            metadata: BTreeMap::new(),
            created_at: 0,
            updated_at: 0,
            service: None,
        }
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = NounStore::new(Arc::new(MemoryBackend::new()), 10);
        store.put(&sample("a")).await.unwrap();
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_eviction_does_not_lose_persisted_data() {
        let store = NounStore::new(Arc::new(MemoryBackend::new()), 1);
        store.put(&sample("a")).await.unwrap();
        store.put(&sample("b")).await.unwrap(); // evicts "a" from cache, not storage
        assert!(store.get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_filters() {
        let store = NounStore::new(Arc::new(MemoryBackend::new()), 10);
        store.put(&sample("a")).await.unwrap();
        let mut b = sample("b");
        b.service = Some("svc".to_string());
        store.put(&b).await.unwrap();
        let filtered = store
            .list(|n| n.service.as_deref() == Some("svc"))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "b");
    }
}
