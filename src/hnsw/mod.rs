//! HNSW vector index (C5): hierarchical navigable small-world graph over
//! 384-dimensional vectors, with insertion, approximate k-NN search, and
//! logical (tombstone) deletion.
//!
//! Nodes live in an arena (`Vec<Node>`); neighbor lists reference arena
//! indices rather than owning pointers, so the graph has no ownership
//! cycles (spec §9 "graph and index cycles").

pub mod distance;

use crate::error::{DbError, Result};
use crate::model::VECTOR_DIM;
use distance::{squared_norm, DistanceMetric};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Tuning parameters for an [`HnswGraph`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

impl HnswParams {
    fn m_max0(&self) -> usize {
        self.m * 2
    }

    fn m_max(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m_max0()
        } else {
            self.m
        }
    }

    fn level_normalizer(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    id: String,
    vector: Vec<f32>,
    norm_sq: f32,
    level: usize,
    /// `connections[layer]` is this node's neighbor list at that layer.
    connections: Vec<Vec<usize>>,
    tombstoned: bool,
    partially_linked: bool,
}

/// A candidate/result entry ordered by ascending distance (for the
/// candidate min-heap) via `Reverse`, or descending (for the bounded result
/// max-heap) directly. Vectors never contain NaN (validated on insert), so
/// `partial_cmp` is safe to unwrap.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapItem {
    dist: f32,
    handle: usize,
}
impl Eq for HeapItem {}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.handle.cmp(&other.handle))
    }
}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Hierarchical navigable small-world graph over fixed-dimension vectors.
pub struct HnswGraph {
    metric: DistanceMetric,
    params: RwLock<HnswParams>,
    entry_point: RwLock<Option<usize>>,
    nodes: RwLock<Vec<Node>>,
    id_to_handle: RwLock<HashMap<String, usize>>,
}

impl HnswGraph {
    /// Create an empty graph with the given metric and parameters.
    pub fn new(metric: DistanceMetric, params: HnswParams) -> Self {
        Self {
            metric,
            params: RwLock::new(params),
            entry_point: RwLock::new(None),
            nodes: RwLock::new(Vec::new()),
            id_to_handle: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live (non-tombstoned) nodes.
    pub fn live_count(&self) -> usize {
        self.nodes.read().iter().filter(|n| !n.tombstoned).count()
    }

    /// Fraction of arena nodes that are tombstoned.
    pub fn tombstone_ratio(&self) -> f64 {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return 0.0;
        }
        let dead = nodes.iter().filter(|n| n.tombstoned).count();
        dead as f64 / nodes.len() as f64
    }

    fn draw_level(&self, m_l: f64) -> usize {
        let mut rng = rand::thread_rng();
        let u: f64 = rng.gen_range(f64::EPSILON..1.0);
        (-u.ln() * m_l).floor() as usize
    }

    fn dist_to(&self, nodes: &[Node], handle: usize, query: &[f32], query_norm: f32) -> f32 {
        let n = &nodes[handle];
        self.metric.distance(query, &n.vector, query_norm, n.norm_sq)
    }

    /// Greedy single-best search at one layer, used while descending from
    /// the entry point to the insertion/query layer (`ef = 1` semantics).
    fn greedy_search_layer(
        &self,
        nodes: &[Node],
        query: &[f32],
        query_norm: f32,
        entry: usize,
        layer: usize,
    ) -> usize {
        let mut current = entry;
        let mut current_dist = self.dist_to(nodes, current, query, query_norm);
        loop {
            let mut improved = false;
            for &neighbor in nodes[current].connections.get(layer).map(Vec::as_slice).unwrap_or(&[]) {
                let d = self.dist_to(nodes, neighbor, query, query_norm);
                if d < current_dist {
                    current = neighbor;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first search at one layer, returning up to `ef` nearest nodes
    /// (ascending distance), including tombstoned nodes so traversal through
    /// them can still reach live neighbors.
    fn search_layer(
        &self,
        nodes: &[Node],
        query: &[f32],
        query_norm: f32,
        entry: usize,
        layer: usize,
        ef: usize,
    ) -> Vec<HeapItem> {
        let mut visited = HashSet::new();
        visited.insert(entry);
        let entry_dist = self.dist_to(nodes, entry, query, query_norm);
        let mut candidates: BinaryHeap<std::cmp::Reverse<HeapItem>> = BinaryHeap::new();
        candidates.push(std::cmp::Reverse(HeapItem { dist: entry_dist, handle: entry }));
        let mut results: BinaryHeap<HeapItem> = BinaryHeap::new();
        results.push(HeapItem { dist: entry_dist, handle: entry });

        while let Some(std::cmp::Reverse(current)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current.dist > worst.dist {
                    break;
                }
            }
            for &neighbor in nodes[current.handle]
                .connections
                .get(layer)
                .map(Vec::as_slice)
                .unwrap_or(&[])
            {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.dist_to(nodes, neighbor, query, query_norm);
                let worse_than_all = results.len() >= ef
                    && results.peek().map(|w| d >= w.dist).unwrap_or(false);
                if !worse_than_all {
                    candidates.push(std::cmp::Reverse(HeapItem { dist: d, handle: neighbor }));
                    results.push(HeapItem { dist: d, handle: neighbor });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        let mut out: Vec<HeapItem> = results.into_vec();
        out.sort();
        out
    }

    /// Diversity-preserving neighbor selection heuristic (spec §4.5): from a
    /// distance-sorted candidate pool, greedily keep `c` only if it is
    /// closer to the inserted node than to every neighbor already selected.
    fn select_neighbors(&self, nodes: &[Node], candidates: &[HeapItem], m: usize) -> Vec<usize> {
        let mut selected: Vec<HeapItem> = Vec::new();
        for &cand in candidates {
            if selected.len() >= m {
                break;
            }
            let query_norm = nodes[cand.handle].norm_sq;
            let query_vec = &nodes[cand.handle].vector;
            let diverse = selected.iter().all(|&s| {
                let d_cs = self.dist_to(nodes, s.handle, query_vec, query_norm);
                cand.dist < d_cs
            });
            if diverse || selected.is_empty() {
                selected.push(cand);
            }
        }
        // Tie-break rule / fallback: if the heuristic under-filled (very
        // clustered candidates), pad with the closest remaining ones so we
        // never connect fewer than available candidates allow.
        if selected.len() < m.min(candidates.len()) {
            for &cand in candidates {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|s| s.handle == cand.handle) {
                    selected.push(cand);
                }
            }
        }
        selected.sort();
        selected.into_iter().map(|c| c.handle).collect()
    }

    fn connect(&self, nodes: &mut [Node], a: usize, b: usize, layer: usize) {
        if !nodes[a].connections[layer].contains(&b) {
            nodes[a].connections[layer].push(b);
        }
        if !nodes[b].connections[layer].contains(&a) {
            nodes[b].connections[layer].push(a);
        }
    }

    fn prune_if_needed(&self, nodes: &mut [Node], handle: usize, layer: usize, m_max: usize) {
        if nodes[handle].connections[layer].len() <= m_max {
            return;
        }
        let query_norm = nodes[handle].norm_sq;
        let query_vec = nodes[handle].vector.clone();
        let mut candidates: Vec<HeapItem> = nodes[handle].connections[layer]
            .iter()
            .map(|&h| HeapItem { dist: self.dist_to(nodes, h, &query_vec, query_norm), handle: h })
            .collect();
        candidates.sort();
        let pruned = self.select_neighbors(nodes, &candidates, m_max);
        nodes[handle].connections[layer] = pruned;
    }

    /// Insert a fresh vector under `id`. The caller is responsible for
    /// dimension/finiteness validation (the noun layer already performs it);
    /// this is re-checked defensively since the index is usable standalone.
    pub fn insert(&self, id: String, vector: Vec<f32>) -> Result<()> {
        if vector.len() != VECTOR_DIM {
            return Err(DbError::DimensionMismatch { expected: VECTOR_DIM, actual: vector.len() });
        }
        let params = *self.params.read();
        let m_l = params.level_normalizer();
        let level = self.draw_level(m_l);
        let norm_sq = squared_norm(&vector);

        let mut nodes = self.nodes.write();
        let mut entry_point = self.entry_point.write();
        let new_handle = nodes.len();
        nodes.push(Node {
            id: id.clone(),
            vector: vector.clone(),
            norm_sq,
            level,
            connections: vec![Vec::new(); level + 1],
            tombstoned: false,
            partially_linked: false,
        });
        self.id_to_handle.write().insert(id, new_handle);

        let Some(ep) = *entry_point else {
            *entry_point = Some(new_handle);
            return Ok(());
        };
        let current_level = nodes[ep].level;
        let mut cursor = ep;

        for lc in ((level + 1)..=current_level).rev() {
            cursor = self.greedy_search_layer(&nodes, &vector, norm_sq, cursor, lc);
        }

        for lc in (0..=level.min(current_level)).rev() {
            let found = self.search_layer(&nodes, &vector, norm_sq, cursor, lc, params.ef_construction);
            if let Some(nearest) = found.first() {
                cursor = nearest.handle;
            }
            let selected = self.select_neighbors(&nodes, &found, params.m);
            for &neighbor in &selected {
                self.connect(&mut nodes, new_handle, neighbor, lc);
            }
            let m_max = params.m_max(lc);
            for &neighbor in &selected {
                self.prune_if_needed(&mut nodes, neighbor, lc, m_max);
            }
        }

        if level > current_level {
            *entry_point = Some(new_handle);
        }
        Ok(())
    }

    /// Replace the vector stored under `id`: tombstones the old node (if
    /// any) and inserts a fresh one under the same external id, so external
    /// references remain valid (spec §4.5 "Update of a vector").
    pub fn update(&self, id: String, vector: Vec<f32>) -> Result<()> {
        self.delete(&id);
        self.insert(id, vector)
    }

    /// Logically delete `id`. Returns `true` if it was live.
    pub fn delete(&self, id: &str) -> bool {
        let handle = match self.id_to_handle.write().remove(id) {
            Some(h) => h,
            None => return false,
        };
        let mut nodes = self.nodes.write();
        if nodes[handle].tombstoned {
            return false;
        }
        nodes[handle].tombstoned = true;
        true
    }

    /// Approximate k-nearest-neighbor search.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != VECTOR_DIM {
            return Err(DbError::DimensionMismatch { expected: VECTOR_DIM, actual: query.len() });
        }
        let nodes = self.nodes.read();
        let entry_point = *self.entry_point.read();
        let Some(ep) = entry_point else {
            return Ok(Vec::new());
        };
        let query_norm = squared_norm(query);
        let mut cursor = ep;
        let top_level = nodes[ep].level;
        for lc in (1..=top_level).rev() {
            cursor = self.greedy_search_layer(&nodes, query, query_norm, cursor, lc);
        }
        let ef_eff = ef.max(k).max(1);
        let found = self.search_layer(&nodes, query, query_norm, cursor, 0, ef_eff);
        let mut out: Vec<(String, f32)> = found
            .into_iter()
            .filter(|item| !nodes[item.handle].tombstoned)
            .map(|item| (nodes[item.handle].id.clone(), item.dist))
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        out.truncate(k);
        Ok(out)
    }

    /// Brute-force distance over an explicit candidate set, used by the
    /// query planner when a metadata/graph arm narrows the corpus below the
    /// configured brute-force threshold (spec §4.7).
    pub fn search_within(&self, query: &[f32], k: usize, candidate_ids: &HashSet<String>) -> Result<Vec<(String, f32)>> {
        if query.len() != VECTOR_DIM {
            return Err(DbError::DimensionMismatch { expected: VECTOR_DIM, actual: query.len() });
        }
        let nodes = self.nodes.read();
        let id_to_handle = self.id_to_handle.read();
        let query_norm = squared_norm(query);
        let mut scored: Vec<(String, f32)> = candidate_ids
            .iter()
            .filter_map(|id| id_to_handle.get(id).copied())
            .filter(|&h| !nodes[h].tombstoned)
            .map(|h| (nodes[h].id.clone(), self.dist_to(&nodes, h, query, query_norm)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    /// Rebuild the whole graph from scratch over its currently-live vectors,
    /// discarding tombstoned arena slots. Used when tombstone density
    /// crosses the configured compaction threshold.
    pub fn compact(&self) -> Result<()> {
        let live: Vec<(String, Vec<f32>)> = {
            let nodes = self.nodes.read();
            nodes
                .iter()
                .filter(|n| !n.tombstoned)
                .map(|n| (n.id.clone(), n.vector.clone()))
                .collect()
        };
        *self.nodes.write() = Vec::new();
        *self.entry_point.write() = None;
        self.id_to_handle.write().clear();
        for (id, vector) in live {
            self.insert(id, vector)?;
        }
        Ok(())
    }

    /// Snapshot the whole graph for persistence.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            metric: self.metric,
            params: *self.params.read(),
            entry_point: *self.entry_point.read(),
            nodes: self.nodes.read().clone(),
        }
    }

    /// Reconstruct a graph from a snapshot (spec §4.5 "Persistence").
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut id_to_handle = HashMap::new();
        for (handle, node) in snapshot.nodes.iter().enumerate() {
            id_to_handle.insert(node.id.clone(), handle);
        }
        Self {
            metric: snapshot.metric,
            params: RwLock::new(snapshot.params),
            entry_point: RwLock::new(snapshot.entry_point),
            nodes: RwLock::new(snapshot.nodes),
            id_to_handle: RwLock::new(id_to_handle),
        }
    }

    /// Nodes left in the "partially linked" state by a failed neighbor
    /// update during insertion; background repair retries their pruning.
    pub fn repair_partial_links(&self) {
        let handles: Vec<usize> = self
            .nodes
            .read()
            .iter()
            .enumerate()
            .filter(|(_, n)| n.partially_linked && !n.tombstoned)
            .map(|(h, _)| h)
            .collect();
        let params = *self.params.read();
        let mut nodes = self.nodes.write();
        for handle in handles {
            for layer in 0..nodes[handle].connections.len() {
                let m_max = params.m_max(layer);
                self.prune_if_needed(&mut nodes, handle, layer, m_max);
            }
            nodes[handle].partially_linked = false;
        }
    }
}

/// Serializable snapshot of an [`HnswGraph`]'s full state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    metric: DistanceMetric,
    params: HnswParams,
    entry_point: Option<usize>,
    nodes: Vec<Node>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(seed: f32) -> Vec<f32> {
        let mut out = vec![0.0f32; VECTOR_DIM];
        out[0] = seed;
        out[1] = 1.0;
        out
    }

    #[test]
    fn search_on_empty_graph_returns_empty() {
        let g = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default());
        assert!(g.search(&v(0.0), 5, 50).unwrap().is_empty());
    }

    #[test]
    fn search_returns_distinct_live_nodes_sorted() {
        let g = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default());
        for i in 0..20 {
            g.insert(format!("n{i}"), v(i as f32)).unwrap();
        }
        let results = g.search(&v(5.0), 5, 50).unwrap();
        assert_eq!(results.len(), 5);
        let mut ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5, "results must be distinct");
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1, "non-decreasing distance");
        }
    }

    #[test]
    fn deterministic_repeat_search() {
        let g = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default());
        for i in 0..30 {
            g.insert(format!("n{i}"), v(i as f32)).unwrap();
        }
        let a = g.search(&v(10.0), 5, 50).unwrap();
        let b = g.search(&v(10.0), 5, 50).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn deleted_node_not_returned() {
        let g = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default());
        for i in 0..10 {
            g.insert(format!("n{i}"), v(i as f32)).unwrap();
        }
        assert!(g.delete("n3"));
        let results = g.search(&v(3.0), 10, 50).unwrap();
        assert!(!results.iter().any(|(id, _)| id == "n3"));
    }

    #[test]
    fn update_preserves_id_across_reinsertion() {
        let g = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default());
        g.insert("a".to_string(), v(0.0)).unwrap();
        g.update("a".to_string(), v(100.0)).unwrap();
        let results = g.search(&v(100.0), 1, 50).unwrap();
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn k_greater_than_n_returns_all_live() {
        let g = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default());
        for i in 0..3 {
            g.insert(format!("n{i}"), v(i as f32)).unwrap();
        }
        assert_eq!(g.search(&v(0.0), 100, 50).unwrap().len(), 3);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let g = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default());
        let err = g.insert("a".to_string(), vec![0.0; 10]).unwrap_err();
        assert!(matches!(err, DbError::DimensionMismatch { .. }));
    }

    #[test]
    fn snapshot_roundtrip_preserves_search_results() {
        let g = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default());
        for i in 0..15 {
            g.insert(format!("n{i}"), v(i as f32)).unwrap();
        }
        let before = g.search(&v(7.0), 4, 50).unwrap();
        let snap = g.snapshot();
        let bytes = bincode::serde::encode_to_vec(&snap, bincode::config::standard()).unwrap();
        let (decoded, _): (GraphSnapshot, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        let reloaded = HnswGraph::from_snapshot(decoded);
        let after = reloaded.search(&v(7.0), 4, 50).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn compact_removes_tombstoned_slots_but_keeps_live_results() {
        let g = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default());
        for i in 0..10 {
            g.insert(format!("n{i}"), v(i as f32)).unwrap();
        }
        g.delete("n0");
        g.delete("n1");
        g.compact().unwrap();
        assert_eq!(g.live_count(), 8);
        assert!(g.search(&v(0.0), 20, 50).unwrap().iter().all(|(id, _)| id != "n0" && id != "n1"));
    }
}
