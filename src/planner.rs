//! Query planner (C7): turns a `find()` request into cost-ordered arm
//! execution over the HNSW index, metadata index, and graph store, then
//! hands per-candidate arm scores to the fusion ranker (C8).

use crate::config::DbConfig;
use crate::error::Result;
use crate::filter::Predicate;
use crate::fusion::{self, ArmScores, Boost, FusedResult, FusionStrategy};
use crate::hnsw::HnswGraph;
use crate::metadata_index::MetadataIndex;
use crate::model::{Noun, NounType, Value};
use crate::noun_store::NounStore;
use crate::storage::StorageBackend;
use crate::verb_store::VerbStore;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Direction of graph traversal for a `connected` constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// A `connected` graph constraint (spec §6.1 `find`).
#[derive(Debug, Clone)]
pub struct GraphConstraint {
    pub from: String,
    pub depth: usize,
    pub direction: Direction,
    pub verb_type: Option<crate::model::VerbType>,
}

/// A `find()` request (spec §4.7).
#[derive(Debug, Clone, Default)]
pub struct FindRequest {
    /// Text to be embedded into `vector` before planning. Resolved by the
    /// database handle, which owns the embedder; the planner itself only
    /// ever sees the resulting `vector`.
    pub query: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub where_: Option<Predicate>,
    pub types: Vec<NounType>,
    pub connected: Option<GraphConstraint>,
    pub limit: usize,
    pub offset: usize,
    pub fusion: Option<FusionStrategy>,
    pub explain: bool,
    pub boost: Option<Boost>,
}

/// Per-arm timing and selection, surfaced when `explain=true`.
#[derive(Debug, Clone, Default)]
pub struct ExplainInfo {
    pub plan: Vec<&'static str>,
    pub arm_timings_micros: BTreeMap<&'static str, u128>,
    pub meta_selectivity: Option<f64>,
    pub graph_selectivity: Option<f64>,
    pub used_brute_force: bool,
}

/// A ranked result from [`QueryPlanner::find`].
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub id: String,
    pub score: f64,
    pub entity: Noun,
    pub arms: ArmScores,
}

/// Cost-ordered planner over the three intelligences (spec §4.7).
pub struct QueryPlanner<S: StorageBackend> {
    noun_store: Arc<NounStore<S>>,
    verb_store: Arc<VerbStore<S>>,
    hnsw: Arc<HnswGraph>,
    metadata_index: Arc<MetadataIndex>,
    config: DbConfig,
}

impl<S: StorageBackend> QueryPlanner<S> {
    pub fn new(
        noun_store: Arc<NounStore<S>>,
        verb_store: Arc<VerbStore<S>>,
        hnsw: Arc<HnswGraph>,
        metadata_index: Arc<MetadataIndex>,
        config: DbConfig,
    ) -> Self {
        Self {
            noun_store,
            verb_store,
            hnsw,
            metadata_index,
            config,
        }
    }

    async fn live_universe(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .noun_store
            .list(|_| true)
            .await?
            .into_iter()
            .map(|n| n.id)
            .collect())
    }

    fn type_predicate_ids(&self, nouns: &[Noun], types: &[NounType]) -> BTreeSet<String> {
        nouns
            .iter()
            .filter(|n| types.contains(&n.r#type))
            .map(|n| n.id.clone())
            .collect()
    }

    /// BFS over the verb store up to `depth`, honoring direction and an
    /// optional verb-type filter. Returns each reached id's shortest hop
    /// distance, excluding the start node itself.
    async fn graph_reachable(&self, constraint: &GraphConstraint) -> Result<HashMap<String, usize>> {
        let mut distances: HashMap<String, usize> = HashMap::new();
        let mut frontier = VecDeque::new();
        frontier.push_back((constraint.from.clone(), 0usize));
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(constraint.from.clone());

        while let Some((current, hop)) = frontier.pop_front() {
            if hop >= constraint.depth {
                continue;
            }
            let mut neighbors = Vec::new();
            if constraint.direction != Direction::Incoming {
                for verb in self.verb_store.list_by_source(&current).await? {
                    if constraint.verb_type.as_ref().map_or(true, |t| *t == verb.r#type) {
                        neighbors.push(verb.to);
                    }
                }
            }
            if constraint.direction != Direction::Outgoing {
                for verb in self.verb_store.list_by_target(&current).await? {
                    if constraint.verb_type.as_ref().map_or(true, |t| *t == verb.r#type) {
                        neighbors.push(verb.from);
                    }
                }
            }
            for next in neighbors {
                if visited.insert(next.clone()) {
                    distances.insert(next.clone(), hop + 1);
                    frontier.push_back((next, hop + 1));
                }
            }
        }
        Ok(distances)
    }

    /// Execute `request` end to end, returning ranked, paginated results.
    pub async fn find(&self, request: &FindRequest) -> Result<(Vec<QueryResult>, ExplainInfo)> {
        let mut explain = ExplainInfo::default();
        if request.limit == 0 {
            return Ok((Vec::new(), explain));
        }

        let universe = self.live_universe().await?;
        if universe.is_empty() {
            return Ok((Vec::new(), explain));
        }
        let all_nouns: Vec<Noun> = self.noun_store.list(|_| true).await?;
        let noun_by_id: HashMap<String, Noun> = all_nouns.iter().map(|n| (n.id.clone(), n.clone())).collect();

        // -- Metadata arm --------------------------------------------------
        let meta_start = std::time::Instant::now();
        let meta_ids: Option<BTreeSet<String>> = if request.where_.is_some() || !request.types.is_empty() {
            explain.plan.push("metadata");
            let mut ids = match &request.where_ {
                Some(predicate) => self.metadata_index.query_with_fallback(predicate, &universe, |id| {
                    noun_by_id.get(id).map(|n| n.metadata.clone())
                }),
                None => universe.clone(),
            };
            if !request.types.is_empty() {
                let type_ids = self.type_predicate_ids(&all_nouns, &request.types);
                ids = ids.intersection(&type_ids).cloned().collect();
            }
            explain.meta_selectivity = Some(ids.len() as f64 / universe.len().max(1) as f64);
            Some(ids)
        } else {
            None
        };
        explain
            .arm_timings_micros
            .insert("metadata", meta_start.elapsed().as_micros());

        // -- Graph arm -------------------------------------------------------
        let graph_start = std::time::Instant::now();
        let graph_hops: Option<HashMap<String, usize>> = if let Some(constraint) = &request.connected {
            explain.plan.push("graph");
            let hops = self.graph_reachable(constraint).await?;
            explain.graph_selectivity = Some(hops.len() as f64 / universe.len().max(1) as f64);
            Some(hops)
        } else {
            None
        };
        explain
            .arm_timings_micros
            .insert("graph", graph_start.elapsed().as_micros());

        // -- Candidate intersection (metadata ∩ graph, if both present) ----
        let narrowing_ids: Option<BTreeSet<String>> = match (&meta_ids, &graph_hops) {
            (Some(m), Some(g)) => Some(m.intersection(&g.keys().cloned().collect()).cloned().collect()),
            (Some(m), None) => Some(m.clone()),
            (None, Some(g)) => Some(g.keys().cloned().collect()),
            (None, None) => None,
        };

        // -- Vector arm ------------------------------------------------------
        let vector_start = std::time::Instant::now();
        let mut vector_scores: BTreeMap<String, f64> = BTreeMap::new();
        let mut vector_rank_order: Vec<String> = Vec::new();
        if let Some(query_vector) = &request.vector {
            explain.plan.push("vector");
            let k = (request.limit + request.offset).max(1);
            let found = match &narrowing_ids {
                Some(ids) if ids.len() <= self.config.metadata_index.brute_force_threshold => {
                    explain.used_brute_force = true;
                    let candidate_set: HashSet<String> = ids.iter().cloned().collect();
                    self.hnsw.search_within(query_vector, k, &candidate_set)?
                }
                Some(ids) => {
                    let ef = (k * 4).max(self.config.hnsw.ef_search);
                    let raw = self.hnsw.search(query_vector, ef.max(k), ef)?;
                    raw.into_iter().filter(|(id, _)| ids.contains(id)).take(k).collect()
                }
                None => self.hnsw.search(query_vector, k, self.config.hnsw.ef_search.max(k))?,
            };
            let max_dist = found.iter().map(|(_, d)| *d).fold(0.0_f32, f32::max).max(f32::EPSILON);
            for (id, dist) in &found {
                vector_rank_order.push(id.clone());
                vector_scores.insert(id.clone(), 1.0 - (*dist as f64 / max_dist as f64));
            }
        }
        explain
            .arm_timings_micros
            .insert("vector", vector_start.elapsed().as_micros());

        // -- Assemble candidate set -------------------------------------------
        let mut candidate_ids: BTreeSet<String> = BTreeSet::new();
        if !vector_scores.is_empty() {
            candidate_ids.extend(vector_scores.keys().cloned());
        }
        if let Some(ids) = &narrowing_ids {
            if vector_scores.is_empty() {
                candidate_ids.extend(ids.iter().cloned());
            }
        }
        if request.vector.is_none() && narrowing_ids.is_none() {
            candidate_ids.extend(universe.iter().cloned());
        }

        let mut arm_scores: BTreeMap<String, ArmScores> = BTreeMap::new();
        let mut field_rank_order: Vec<String> = Vec::new();
        let mut graph_rank_order: Vec<String> = Vec::new();
        for id in &candidate_ids {
            let vector = vector_scores.get(id).copied();
            let field = meta_ids.as_ref().map(|ids| if ids.contains(id) { 1.0 } else { 0.0 });
            let graph = graph_hops.as_ref().and_then(|hops| hops.get(id)).map(|hop| 1.0 / (1.0 + *hop as f64));
            arm_scores.insert(id.clone(), ArmScores { vector, field, graph });
            if field == Some(1.0) {
                field_rank_order.push(id.clone());
            }
            if graph.is_some() {
                graph_rank_order.push(id.clone());
            }
        }

        let strategy = request.fusion.clone().unwrap_or_else(|| self.config.default_fusion_strategy.clone());
        let rank_orders = [vector_rank_order, field_rank_order, graph_rank_order];
        let updated_at: BTreeMap<String, i64> = candidate_ids
            .iter()
            .filter_map(|id| noun_by_id.get(id).map(|n| (id.clone(), n.updated_at)))
            .collect();
        let fused: Vec<FusedResult> = fusion::fuse(
            arm_scores,
            &strategy,
            Some(&rank_orders),
            request.boost,
            crate::model::now_millis(),
            &updated_at,
        );

        let results: Vec<QueryResult> = fused
            .into_iter()
            .filter_map(|f| noun_by_id.get(&f.id).cloned().map(|entity| QueryResult {
                id: f.id,
                score: f.score,
                entity,
                arms: f.arms,
            }))
            .skip(request.offset)
            .take(request.limit)
            .collect();

        Ok((results, explain))
    }
}
