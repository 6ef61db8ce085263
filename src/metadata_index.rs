//! Metadata inverted index (C6): equality, range, and containment lookups
//! over noun metadata, backed by concurrent maps so reads never block on
//! the single writer.

use crate::filter::{self, Predicate};
use crate::model::{OrderedF64, Value};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

struct FieldIndex {
    equality: DashMap<String, BTreeSet<String>>,
    ordered: RwLock<BTreeMap<OrderedF64, BTreeSet<String>>>,
    hits: AtomicU64,
}

impl FieldIndex {
    fn new() -> Self {
        Self {
            equality: DashMap::new(),
            ordered: RwLock::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
        }
    }
}

/// Inverted index over noun metadata, mirroring spec §4.6.
pub struct MetadataIndex {
    fields: DashMap<String, FieldIndex>,
    values_cache: DashMap<String, Vec<String>>,
    max_index_size: usize,
    evicted_field_paths: AtomicUsize,
}

impl MetadataIndex {
    /// Create an index that evicts least-used field paths once more than
    /// `max_index_size` distinct fields are tracked.
    pub fn new(max_index_size: usize) -> Self {
        Self {
            fields: DashMap::new(),
            values_cache: DashMap::new(),
            max_index_size: max_index_size.max(1),
            evicted_field_paths: AtomicUsize::new(0),
        }
    }

    /// Number of field paths evicted for capacity since creation.
    pub fn evicted_field_paths(&self) -> usize {
        self.evicted_field_paths.load(Ordering::Relaxed)
    }

    fn flatten<'a>(prefix: &str, value: &'a Value, out: &mut Vec<(String, &'a Value)>) {
        match value {
            Value::Map(m) => {
                for (k, v) in m {
                    let path = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                    Self::flatten(&path, v, out);
                }
            }
            other => out.push((prefix.to_string(), other)),
        }
    }

    fn touch_field(&self, field: &str) -> dashmap::mapref::one::Ref<'_, String, FieldIndex> {
        if !self.fields.contains_key(field) && self.fields.len() >= self.max_index_size {
            self.evict_least_used();
        }
        self.fields.entry(field.to_string()).or_insert_with(FieldIndex::new);
        self.values_cache.remove(field);
        self.fields.get(field).unwrap()
    }

    fn evict_least_used(&self) {
        let victim = self
            .fields
            .iter()
            .min_by_key(|entry| entry.value().hits.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());
        if let Some(field) = victim {
            self.fields.remove(&field);
            self.values_cache.remove(&field);
            self.evicted_field_paths.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(field = %field, "metadata index evicted field path for capacity");
        }
    }

    fn index_leaf(&self, field: &str, value: &Value, id: &str) {
        let entry = self.touch_field(field);
        if let Some(order) = value.order_key() {
            entry.ordered.write().entry(order).or_default().insert(id.to_string());
        }
        if let Some(token) = value.equality_token() {
            entry.equality.entry(token).or_default().insert(id.to_string());
        }
        if let Value::Array(items) = value {
            for item in items {
                if let Some(token) = item.equality_token() {
                    entry.equality.entry(token).or_default().insert(id.to_string());
                }
            }
        }
    }

    fn remove_leaf(&self, field: &str, value: &Value, id: &str) {
        let Some(entry) = self.fields.get(field) else { return };
        if let Some(order) = value.order_key() {
            if let Some(set) = entry.ordered.write().get_mut(&order) {
                set.remove(id);
            }
        }
        if let Some(token) = value.equality_token() {
            if let Some(mut set) = entry.equality.get_mut(&token) {
                set.remove(id);
            }
        }
        if let Value::Array(items) = value {
            for item in items {
                if let Some(token) = item.equality_token() {
                    if let Some(mut set) = entry.equality.get_mut(&token) {
                        set.remove(id);
                    }
                }
            }
        }
        self.values_cache.remove(field);
    }

    /// Index a noun's metadata under `id`. Skips the reserved `id` path.
    pub fn index_noun(&self, id: &str, metadata: &BTreeMap<String, Value>) {
        for (field, value) in metadata {
            if field == "id" {
                continue;
            }
            let mut leaves = Vec::new();
            Self::flatten(field, value, &mut leaves);
            for (path, leaf) in leaves {
                self.index_leaf(&path, leaf, id);
            }
        }
    }

    /// Remove a noun's metadata entries, reversing [`Self::index_noun`].
    pub fn remove_noun(&self, id: &str, metadata: &BTreeMap<String, Value>) {
        for (field, value) in metadata {
            if field == "id" {
                continue;
            }
            let mut leaves = Vec::new();
            Self::flatten(field, value, &mut leaves);
            for (path, leaf) in leaves {
                self.remove_leaf(&path, leaf, id);
            }
        }
    }

    /// Drop all indexed state (used before a full `rebuild`).
    pub fn clear(&self) {
        self.fields.clear();
        self.values_cache.clear();
    }

    /// All field paths currently tracked by the index.
    pub fn fields(&self) -> Vec<String> {
        self.fields.iter().map(|e| e.key().clone()).collect()
    }

    /// All distinct value tokens observed for `field`, cached until the
    /// next write touches that field.
    pub fn values(&self, field: &str) -> Vec<String> {
        let Some(entry) = self.fields.get(field) else { return Vec::new() };
        if let Some(cached) = self.values_cache.get(field) {
            return cached.clone();
        }
        let values: Vec<String> = entry.equality.iter().map(|e| e.key().clone()).collect();
        self.values_cache.insert(field.to_string(), values.clone());
        values
    }

    fn equality_ids(&self, field: &str, value: &Value) -> BTreeSet<String> {
        let Some(entry) = self.fields.get(field) else { return BTreeSet::new() };
        entry.hits.fetch_add(1, Ordering::Relaxed);
        match value.equality_token() {
            Some(token) => entry.equality.get(&token).map(|s| s.clone()).unwrap_or_default(),
            None => BTreeSet::new(),
        }
    }

    fn range_ids(&self, field: &str, bound: std::ops::Bound<&OrderedF64>, upper: bool) -> BTreeSet<String> {
        let Some(entry) = self.fields.get(field) else { return BTreeSet::new() };
        entry.hits.fetch_add(1, Ordering::Relaxed);
        let ordered = entry.ordered.read();
        let range: Box<dyn Iterator<Item = (&OrderedF64, &BTreeSet<String>)>> = if upper {
            Box::new(ordered.range((std::ops::Bound::Unbounded, bound)))
        } else {
            Box::new(ordered.range((bound, std::ops::Bound::Unbounded)))
        };
        range.flat_map(|(_, ids)| ids.iter().cloned()).collect()
    }

    /// Attempt to resolve `predicate` entirely from the index, returning
    /// `None` when any subtree needs the filter evaluator (regex).
    /// `universe` supplies the live-id set for `NOT` and `NotIn` negation.
    pub fn try_query(&self, predicate: &Predicate, universe: &BTreeSet<String>) -> Option<BTreeSet<String>> {
        if predicate.requires_fallback() {
            return None;
        }
        Some(match predicate {
            Predicate::Eq(f, v) => self.equality_ids(f, v),
            Predicate::Contains(f, v) => self.equality_ids(f, v),
            Predicate::In(f, vs) => vs.iter().flat_map(|v| self.equality_ids(f, v)).collect(),
            Predicate::NotIn(f, vs) => {
                let excluded: BTreeSet<String> = vs.iter().flat_map(|v| self.equality_ids(f, v)).collect();
                universe.difference(&excluded).cloned().collect()
            }
            Predicate::Gt(f, v) => {
                v.order_key().map(|k| self.range_ids(f, std::ops::Bound::Excluded(&k), false)).unwrap_or_default()
            }
            Predicate::Gte(f, v) => {
                v.order_key().map(|k| self.range_ids(f, std::ops::Bound::Included(&k), false)).unwrap_or_default()
            }
            Predicate::Lt(f, v) => {
                v.order_key().map(|k| self.range_ids(f, std::ops::Bound::Excluded(&k), true)).unwrap_or_default()
            }
            Predicate::Lte(f, v) => {
                v.order_key().map(|k| self.range_ids(f, std::ops::Bound::Included(&k), true)).unwrap_or_default()
            }
            Predicate::And(items) => {
                let mut sets = items.iter().map(|p| self.try_query(p, universe));
                let mut acc = sets.next()??;
                for next in sets {
                    acc = acc.intersection(&next?).cloned().collect();
                }
                acc
            }
            Predicate::Or(items) => {
                let mut acc = BTreeSet::new();
                for item in items {
                    acc.extend(self.try_query(item, universe)?);
                }
                acc
            }
            Predicate::Not(inner) => {
                let inner_ids = self.try_query(inner, universe)?;
                universe.difference(&inner_ids).cloned().collect()
            }
            Predicate::Regex(_, _) => unreachable!("requires_fallback() filters regex above"),
        })
    }

    /// Evaluate `predicate` exactly, falling back to per-record evaluation
    /// via `lookup` for ids not resolvable purely from the index (used when
    /// `try_query` returns `None`).
    pub fn query_with_fallback(
        &self,
        predicate: &Predicate,
        universe: &BTreeSet<String>,
        lookup: impl Fn(&str) -> Option<BTreeMap<String, Value>>,
    ) -> BTreeSet<String> {
        if let Some(ids) = self.try_query(predicate, universe) {
            return ids;
        }
        universe
            .iter()
            .filter(|id| lookup(id).map(|m| filter::evaluate(predicate, &m)).unwrap_or(false))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn equality_query_s1_style() {
        let idx = MetadataIndex::new(100);
        idx.index_noun("a", &md(&[("role", Value::String("developer".into()))]));
        idx.index_noun("b", &md(&[("role", Value::String("designer".into()))]));
        idx.index_noun("c", &md(&[("role", Value::String("Developer".into()))]));
        let universe: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let result = idx.try_query(&Predicate::Eq("role".into(), Value::String("developer".into())), &universe).unwrap();
        assert_eq!(result, ["a", "c"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn range_query_s2_style() {
        let idx = MetadataIndex::new(100);
        for (id, price) in [("p1", 999.0), ("p2", 2499.0), ("p3", 249.0), ("p4", 599.0), ("p5", 899.0)] {
            idx.index_noun(id, &md(&[("price", Value::Number(price))]));
        }
        let universe: BTreeSet<String> = ["p1", "p2", "p3", "p4", "p5"].iter().map(|s| s.to_string()).collect();
        let result = idx.try_query(&Predicate::Gt("price".into(), Value::Number(500.0)), &universe).unwrap();
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn contains_query_over_array_field() {
        let idx = MetadataIndex::new(100);
        idx.index_noun("a", &md(&[("tags", Value::Array(vec![Value::String("urgent".into())]))]));
        let universe: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        let result = idx.try_query(&Predicate::Contains("tags".into(), Value::String("urgent".into())), &universe).unwrap();
        assert_eq!(result, universe);
    }

    #[test]
    fn remove_reverses_index() {
        let idx = MetadataIndex::new(100);
        let m = md(&[("role", Value::String("developer".into()))]);
        idx.index_noun("a", &m);
        idx.remove_noun("a", &m);
        let universe: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        let result = idx.try_query(&Predicate::Eq("role".into(), Value::String("developer".into())), &universe).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn regex_predicate_falls_back() {
        let idx = MetadataIndex::new(100);
        idx.index_noun("a", &md(&[("name", Value::String("hello".into()))]));
        let universe: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        assert!(idx.try_query(&Predicate::Regex("name".into(), "^h".into()), &universe).is_none());
        let result = idx.query_with_fallback(
            &Predicate::Regex("name".into(), "^h".into()),
            &universe,
            |id| if id == "a" { Some(md(&[("name", Value::String("hello".into()))])) } else { None },
        );
        assert_eq!(result, universe);
    }

    #[test]
    fn values_discovery_is_cached_and_invalidated() {
        let idx = MetadataIndex::new(100);
        idx.index_noun("a", &md(&[("role", Value::String("developer".into()))]));
        assert_eq!(idx.values("role"), vec!["developer".to_string()]);
        idx.index_noun("b", &md(&[("role", Value::String("designer".into()))]));
        let mut values = idx.values("role");
        values.sort();
        assert_eq!(values, vec!["designer".to_string(), "developer".to_string()]);
    }

    #[test]
    fn eviction_tracks_capacity_pressure() {
        let idx = MetadataIndex::new(1);
        idx.index_noun("a", &md(&[("f1", Value::String("x".into()))]));
        idx.index_noun("b", &md(&[("f2", Value::String("y".into()))]));
        assert_eq!(idx.evicted_field_paths(), 1);
    }
}
