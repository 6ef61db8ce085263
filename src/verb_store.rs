//! Verb store (C4): typed directed edges with by-source, by-target, and
//! by-type inverted indexes, and cascade-deletion support.

use crate::error::Result;
use crate::model::{Verb, VerbType};
use crate::storage::{get_decoded, put_encoded, StorageBackend};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Persisted, indexed verb store.
pub struct VerbStore<S: StorageBackend> {
    backend: Arc<S>,
    by_from: DashMap<String, BTreeSet<String>>,
    by_to: DashMap<String, BTreeSet<String>>,
    by_type: DashMap<String, BTreeSet<String>>,
}

impl<S: StorageBackend> VerbStore<S> {
    /// Create an empty verb store. Call [`Self::rebuild_indexes`] after
    /// construction if the backend already holds verbs (e.g. on reopen).
    pub fn new(backend: Arc<S>) -> Self {
        Self {
            backend,
            by_from: DashMap::new(),
            by_to: DashMap::new(),
            by_type: DashMap::new(),
        }
    }

    fn key(id: &str) -> String {
        format!("verbs/{id}")
    }

    fn type_key(t: &VerbType) -> String {
        t.to_string()
    }

    /// Re-scan the backend and rebuild the by-from/by-to/by-type indexes
    /// from scratch. Used on `init()`.
    pub async fn rebuild_indexes(&self) -> Result<()> {
        self.by_from.clear();
        self.by_to.clear();
        self.by_type.clear();
        for key in self.backend.list("verbs/").await? {
            if let Some(verb) = get_decoded::<Verb, _>(self.backend.as_ref(), &key).await? {
                self.index_insert(&verb);
            }
        }
        Ok(())
    }

    fn index_insert(&self, verb: &Verb) {
        self.by_from.entry(verb.from.clone()).or_default().insert(verb.id.clone());
        self.by_to.entry(verb.to.clone()).or_default().insert(verb.id.clone());
        self.by_type
            .entry(Self::type_key(&verb.r#type))
            .or_default()
            .insert(verb.id.clone());
    }

    fn index_remove(&self, verb: &Verb) {
        if let Some(mut set) = self.by_from.get_mut(&verb.from) {
            set.remove(&verb.id);
        }
        if let Some(mut set) = self.by_to.get_mut(&verb.to) {
            set.remove(&verb.id);
        }
        if let Some(mut set) = self.by_type.get_mut(&Self::type_key(&verb.r#type)) {
            set.remove(&verb.id);
        }
    }

    /// Persist (insert or overwrite) a verb, updating indexes. If a verb with
    /// the same id already exists under a different source/target/type, its
    /// old index entries are removed first.
    pub async fn put(&self, verb: &Verb) -> Result<()> {
        if let Some(old) = self.get(&verb.id).await? {
            self.index_remove(&old);
        }
        put_encoded(self.backend.as_ref(), &Self::key(&verb.id), verb).await?;
        self.index_insert(verb);
        Ok(())
    }

    /// Fetch a verb by id.
    pub async fn get(&self, id: &str) -> Result<Option<Verb>> {
        get_decoded(self.backend.as_ref(), &Self::key(id)).await
    }

    /// Delete a verb by id, removing it from all indexes. Returns `true` if
    /// it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        if let Some(old) = self.get(id).await? {
            self.index_remove(&old);
        }
        self.backend.delete(&Self::key(id)).await
    }

    async fn resolve(&self, ids: impl IntoIterator<Item = String>) -> Result<Vec<Verb>> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(v) = self.get(&id).await? {
                out.push(v);
            }
        }
        Ok(out)
    }

    /// All verbs with the given source noun id.
    pub async fn list_by_source(&self, from: &str) -> Result<Vec<Verb>> {
        let ids = self
            .by_from
            .get(from)
            .map(|s| s.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        self.resolve(ids).await
    }

    /// All verbs with the given target noun id.
    pub async fn list_by_target(&self, to: &str) -> Result<Vec<Verb>> {
        let ids = self
            .by_to
            .get(to)
            .map(|s| s.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        self.resolve(ids).await
    }

    /// All verbs of a given type.
    pub async fn list_by_type(&self, t: &VerbType) -> Result<Vec<Verb>> {
        let ids = self
            .by_type
            .get(&Self::type_key(t))
            .map(|s| s.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        self.resolve(ids).await
    }

    /// All verb ids where `noun_id` participates as source or target — used
    /// by cascade deletion.
    pub async fn verb_ids_touching(&self, noun_id: &str) -> Vec<String> {
        let mut ids: BTreeSet<String> = self
            .by_from
            .get(noun_id)
            .map(|s| s.clone())
            .unwrap_or_default();
        if let Some(to_set) = self.by_to.get(noun_id) {
            ids.extend(to_set.iter().cloned());
        }
        ids.into_iter().collect()
    }
}
