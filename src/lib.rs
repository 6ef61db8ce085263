//! # vectograph
//!
//! An embeddable hybrid vector-plus-graph database core: typed entities
//! (nouns) carrying high-dimensional embeddings, typed directed
//! relationships (verbs) between them, and a single `find` query surface
//! that fuses approximate vector search, metadata predicate filtering, and
//! graph traversal into one ranked result list.
//!
//! ## Modules
//! - [`model`]: the noun/verb/value data model.
//! - [`storage`]: the pluggable blob key-value contract (`StorageBackend`)
//!   and its in-memory / local-filesystem adapters.
//! - [`wal`]: write-ahead log durability and crash recovery.
//! - [`noun_store`] / [`verb_store`]: typed, indexed persistence.
//! - [`hnsw`]: the hierarchical navigable small-world vector index.
//! - [`metadata_index`] / [`filter`]: the inverted metadata index and its
//!   predicate-tree fallback evaluator.
//! - [`planner`] / [`fusion`]: the triple-intelligence query planner and
//!   its fusion ranker.
//! - [`transaction`]: the write-ahead-logged transaction engine.
//! - [`stats`]: per-service statistics.
//! - [`config`]: the `DbConfig` tunable surface.
//! - [`error`]: the error taxonomy shared by every public operation.
//!
//! This crate never installs a `tracing` subscriber or reads environment
//! state on its own: a host binary owns logging setup, configuration file
//! loading, and the embedding model. `Database` is the single entry point
//! the rest of this crate is wired behind.

pub mod config;
pub mod error;
pub mod filter;
pub mod fusion;
pub mod hnsw;
pub mod metadata_index;
pub mod model;
pub mod noun_store;
pub mod planner;
pub mod stats;
pub mod storage;
pub mod transaction;
pub mod verb_store;
pub mod wal;

use async_trait::async_trait;
use config::DbConfig;
use error::{DbError, Result};
use filter::Predicate;
use hnsw::HnswGraph;
use metadata_index::MetadataIndex;
use model::{Noun, NounType, Value, Verb, VerbType};
use noun_store::NounStore;
use planner::{FindRequest, GraphConstraint, QueryPlanner, QueryResult};
use serde::{Deserialize, Serialize};
use stats::{StatsCounters, Statistics};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::StorageBackend;
use transaction::{BoxFuture, Compensation, Operation, Transaction, TransactionEngine};
use verb_store::VerbStore;
use wal::{OpIntent, WalRecord, WriteAheadLog};

/// A pure text-to-vector function. The core treats this as an external
/// collaborator (spec §1): it never loads or manages a model itself.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

impl Default for NounType {
    fn default() -> Self {
        NounType::Thing
    }
}

/// Input to [`Database::add`] (spec §6.1).
#[derive(Debug, Clone, Default)]
pub struct AddRequest {
    pub id: Option<String>,
    pub data: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub r#type: NounType,
    pub metadata: BTreeMap<String, Value>,
    pub service: Option<String>,
}

/// Outcome of [`Database::add_many`].
#[derive(Debug, Clone, Default)]
pub struct AddManyResult {
    pub successful: Vec<String>,
    pub failed: Vec<(usize, String)>,
    pub total: usize,
}

/// Input to [`Database::update`] (spec §6.1). `None` fields are left
/// untouched; `merge` controls whether `metadata` replaces or merges.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub id: String,
    pub data: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub metadata: Option<BTreeMap<String, Value>>,
    pub merge: bool,
}

/// Input to [`Database::relate`].
#[derive(Debug, Clone)]
pub struct RelateRequest {
    pub from: String,
    pub to: String,
    pub r#type: VerbType,
    pub weight: Option<f64>,
    pub metadata: BTreeMap<String, Value>,
}

/// Input to [`Database::get_relations`].
#[derive(Debug, Clone, Default)]
pub struct GetRelationsRequest {
    pub from: Option<String>,
    pub to: Option<String>,
    pub r#type: Option<VerbType>,
}

/// Input to [`Database::similar`].
#[derive(Debug, Clone)]
pub struct SimilarRequest {
    pub to: String,
    pub limit: usize,
    pub threshold: Option<f64>,
}

/// Input to [`Database::clear`].
#[derive(Debug, Clone, Default)]
pub struct ClearRequest {
    pub r#type: Option<NounType>,
    pub r#where: Option<Predicate>,
}

/// Serialization format for [`Database::export`]/[`Database::import`].
#[derive(Debug, Clone, Copy, Default)]
pub enum ExportFormat {
    #[default]
    Json,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportBundle {
    nouns: Vec<Noun>,
    verbs: Vec<Verb>,
}

/// Per-noun-type / per-verb-type histogram plus bare counts (spec §6.1
/// `insights()`, extended per SPEC_FULL §B.1/§B.3).
#[derive(Debug, Clone, Default)]
pub struct InsightsSummary {
    pub entities: i64,
    pub relationships: i64,
    pub noun_types: Vec<(String, i64)>,
    pub verb_types: Vec<(String, i64)>,
    pub evicted_field_paths: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PutNounArgs {
    noun: Noun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeleteNounArgs {
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PutVerbArgs {
    verb: Verb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeleteVerbArgs {
    id: String,
}

/// Write a noun's record, HNSW entry, and metadata index entries, replacing
/// any prior version under the same id (`HnswGraph::update` tombstones+
/// reinserts, which is a no-op tombstone on a brand-new id).
async fn apply_put_noun<S: StorageBackend>(
    noun_store: &NounStore<S>,
    hnsw: &HnswGraph,
    metadata_index: &MetadataIndex,
    noun: &Noun,
) -> Result<()> {
    Noun::validate_vector(&noun.vector)?;
    if let Some(old) = noun_store.get(&noun.id).await? {
        metadata_index.remove_noun(&old.id, &old.metadata);
    }
    noun_store.put(noun).await?;
    hnsw.update(noun.id.clone(), noun.vector.clone())?;
    metadata_index.index_noun(&noun.id, &noun.metadata);
    Ok(())
}

/// Delete a noun (if present), tombstone its HNSW node, drop it from the
/// metadata index, and cascade-delete every verb touching it. Returns the
/// removed noun and verbs so a compensation can fully restore them.
async fn apply_delete_noun<S: StorageBackend>(
    noun_store: &NounStore<S>,
    verb_store: &VerbStore<S>,
    hnsw: &HnswGraph,
    metadata_index: &MetadataIndex,
    id: &str,
) -> Result<(Option<Noun>, Vec<Verb>)> {
    let Some(existing) = noun_store.get(id).await? else {
        return Ok((None, Vec::new()));
    };
    let mut removed_verbs = Vec::new();
    for verb_id in verb_store.verb_ids_touching(id).await {
        if let Some(v) = verb_store.get(&verb_id).await? {
            removed_verbs.push(v);
        }
        verb_store.delete(&verb_id).await?;
    }
    noun_store.delete(id).await?;
    hnsw.delete(id);
    metadata_index.remove_noun(id, &existing.metadata);
    Ok((Some(existing), removed_verbs))
}

async fn apply_put_verb<S: StorageBackend>(verb_store: &VerbStore<S>, verb: &Verb) -> Result<()> {
    verb_store.put(verb).await
}

async fn apply_delete_verb<S: StorageBackend>(verb_store: &VerbStore<S>, id: &str) -> Result<Option<Verb>> {
    let existing = verb_store.get(id).await?;
    verb_store.delete(id).await?;
    Ok(existing)
}

/// The embeddable database handle wiring C1-C11 behind the public API
/// surface named in spec §6.1.
pub struct Database<S: StorageBackend> {
    backend: Arc<S>,
    config: DbConfig,
    noun_store: Arc<NounStore<S>>,
    verb_store: Arc<VerbStore<S>>,
    hnsw: Arc<HnswGraph>,
    metadata_index: Arc<MetadataIndex>,
    stats: Arc<Statistics<S>>,
    wal: Arc<WriteAheadLog<S>>,
    tx_engine: Arc<TransactionEngine<S>>,
    embedder: Option<Arc<dyn Embedder>>,
    read_only: bool,
}

const HNSW_GRAPH_KEY: &str = "index/hnsw/graph";

impl<S: StorageBackend + 'static> Database<S> {
    /// Open a database over `backend`: replay the WAL, then load the HNSW
    /// graph and metadata index (rebuilding either from the noun store if
    /// absent or corrupt) (spec §6.1 `init()`).
    pub async fn open(backend: Arc<S>, config: DbConfig, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        config.validate()?;
        let noun_store = Arc::new(NounStore::new(backend.clone(), config.noun_store.cache_capacity));
        let verb_store = Arc::new(VerbStore::new(backend.clone()));
        verb_store.rebuild_indexes().await?;

        let hnsw = Arc::new(Self::load_or_rebuild_hnsw(&backend, &noun_store, &config).await?);
        let metadata_index = Arc::new(MetadataIndex::new(config.metadata_index.max_index_size));
        Self::rebuild_metadata_index(&noun_store, &metadata_index).await?;

        let stats = Arc::new(Statistics::new(backend.clone(), config.statistics));
        stats.load_all().await?;

        let wal = Arc::new(WriteAheadLog::open(backend.clone(), config.wal_flush_strategy).await?);
        let tx_engine = Arc::new(TransactionEngine::new(wal.clone(), config.transaction));

        let db = Self {
            backend,
            config,
            noun_store,
            verb_store,
            hnsw,
            metadata_index,
            stats,
            wal,
            tx_engine,
            embedder,
            read_only: false,
        };
        db.replay_wal().await?;
        Ok(db)
    }

    /// Open a read-only handle: mutating operations fail with `ReadOnly`.
    pub async fn open_read_only(backend: Arc<S>, config: DbConfig) -> Result<Self> {
        let mut db = Self::open(backend, config, None).await?;
        db.read_only = true;
        Ok(db)
    }

    async fn load_or_rebuild_hnsw(
        backend: &Arc<S>,
        noun_store: &NounStore<S>,
        config: &DbConfig,
    ) -> Result<HnswGraph> {
        match storage::get_decoded::<hnsw::GraphSnapshot, _>(backend.as_ref(), HNSW_GRAPH_KEY).await {
            Ok(Some(snapshot)) => return Ok(HnswGraph::from_snapshot(snapshot)),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "hnsw graph snapshot failed validation, rebuilding"),
        }
        let graph = HnswGraph::new(config.distance_metric, config.hnsw);
        for noun in noun_store.list(|_| true).await? {
            graph.insert(noun.id, noun.vector)?;
        }
        Ok(graph)
    }

    async fn rebuild_metadata_index(noun_store: &NounStore<S>, index: &MetadataIndex) -> Result<()> {
        index.clear();
        for noun in noun_store.list(|_| true).await? {
            index.index_noun(&noun.id, &noun.metadata);
        }
        Ok(())
    }

    /// Re-execute pending transactions found in the WAL (spec §4.2 "Replay
    /// on open"). Aborted transactions need no replay action: by the time a
    /// record is marked aborted, its compensations already ran synchronously
    /// inside the `execute` call that aborted it.
    async fn replay_wal(&self) -> Result<()> {
        let noun_store = self.noun_store.clone();
        let verb_store = self.verb_store.clone();
        let hnsw = self.hnsw.clone();
        let metadata_index = self.metadata_index.clone();

        let reexecute = move |record: WalRecord| {
            let noun_store = noun_store.clone();
            let verb_store = verb_store.clone();
            let hnsw = hnsw.clone();
            let metadata_index = metadata_index.clone();
            async move {
                for intent in record.operations {
                    apply_intent(&noun_store, &verb_store, &hnsw, &metadata_index, &intent).await?;
                }
                Ok(())
            }
        };
        let compensate = move |record: WalRecord| async move {
            tracing::debug!(tx_id = %record.tx_id, "skipping compensation replay for already-rolled-back transaction");
            Ok(())
        };
        let summary = self.wal.replay(reexecute, compensate).await?;
        tracing::info!(
            reexecuted = summary.reexecuted,
            compensated = summary.compensated,
            corrupt = summary.corrupt_segments,
            "wal replay complete"
        );
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DbError::ReadOnly);
        }
        Ok(())
    }

    async fn resolve_vector(&self, data: &Option<String>, vector: &Option<Vec<f32>>) -> Result<Vec<f32>> {
        if let Some(v) = vector {
            return Ok(v.clone());
        }
        if let Some(text) = data {
            let embedder = self
                .embedder
                .as_ref()
                .ok_or_else(|| DbError::InvalidInput("no embedder configured to embed `data`".to_string()))?;
            return embedder.embed(text).await;
        }
        Err(DbError::InvalidInput("add requires `data` or `vector`".to_string()))
    }

    /// Insert a new noun, embedding `data` if no `vector` was supplied.
    pub async fn add(&self, request: AddRequest) -> Result<String> {
        self.require_writable()?;
        let id = request.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let vector = self.resolve_vector(&request.data, &request.vector).await?;
        Noun::validate_vector(&vector)?;
        let now = model::now_millis();
        let noun = Noun {
            id: id.clone(),
            r#type: request.r#type,
            vector,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            service: request.service,
        };
        self.run_put_noun(noun).await?;
        Ok(id)
    }

    /// Insert many nouns. When `continue_on_error` is false, the first
    /// failure stops the batch; each item is its own transaction, so earlier
    /// successes are not rolled back by a later failure.
    pub async fn add_many(&self, items: Vec<AddRequest>, continue_on_error: bool) -> Result<AddManyResult> {
        let total = items.len();
        let mut result = AddManyResult {
            total,
            ..Default::default()
        };
        for (idx, item) in items.into_iter().enumerate() {
            match self.add(item).await {
                Ok(id) => result.successful.push(id),
                Err(err) => {
                    result.failed.push((idx, err.to_string()));
                    if !continue_on_error {
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    /// Fetch a noun by id.
    pub async fn get(&self, id: &str) -> Result<Option<Noun>> {
        self.noun_store.get(id).await
    }

    /// Partially update a noun (spec §6.1 `update`). Preserves the existing
    /// vector unless `vector` is supplied or `data` changes (spec §9 Open
    /// Question 2).
    pub async fn update(&self, request: UpdateRequest) -> Result<bool> {
        self.require_writable()?;
        let Some(mut noun) = self.noun_store.get(&request.id).await? else {
            return Ok(false);
        };
        if let Some(vector) = request.vector {
            Noun::validate_vector(&vector)?;
            noun.vector = vector;
        } else if let Some(text) = &request.data {
            let vector = self.resolve_vector(&Some(text.clone()), &None).await?;
            Noun::validate_vector(&vector)?;
            noun.vector = vector;
        }
        if let Some(metadata) = request.metadata {
            if request.merge {
                for (k, v) in metadata {
                    noun.metadata.insert(k, v);
                }
            } else {
                noun.metadata = metadata;
            }
        }
        noun.updated_at = model::now_millis().max(noun.updated_at);
        self.run_put_noun(noun).await?;
        Ok(true)
    }

    async fn run_put_noun(&self, noun: Noun) -> Result<()> {
        let noun_store = self.noun_store.clone();
        let hnsw = self.hnsw.clone();
        let metadata_index = self.metadata_index.clone();
        let stats = self.stats.clone();
        let noun_for_exec = noun.clone();
        let noun_for_comp = noun.clone();

        let args = serde_json::to_value(PutNounArgs { noun: noun.clone() })
            .map_err(|e| DbError::InvalidInput(e.to_string()))?;
        let op = Operation::new("put_noun", args, move || -> BoxFuture<'static, Result<Compensation>> {
            Box::pin(async move {
                let previous = noun_store.get(&noun_for_exec.id).await?;
                apply_put_noun(&noun_store, &hnsw, &metadata_index, &noun_for_exec).await?;
                let service = noun_for_exec.service.as_deref();
                match &previous {
                    Some(old) => {
                        let delta = noun_for_exec.metadata.len() as i64 - old.metadata.len() as i64;
                        stats.record_metadata_delta(service, delta);
                    }
                    None => {
                        stats.record_noun_added(service, &noun_for_exec.r#type.to_string());
                        stats.record_metadata_delta(service, noun_for_exec.metadata.len() as i64);
                        stats.record_hnsw_delta(service, 1);
                    }
                }
                let noun_store_c = noun_store.clone();
                let hnsw_c = hnsw.clone();
                let metadata_index_c = metadata_index.clone();
                let id = noun_for_comp.id.clone();
                let comp: Compensation = Arc::new(move || {
                    let noun_store = noun_store_c.clone();
                    let hnsw = hnsw_c.clone();
                    let metadata_index = metadata_index_c.clone();
                    let previous = previous.clone();
                    let id = id.clone();
                    Box::pin(async move {
                        match previous {
                            Some(old) => apply_put_noun(&noun_store, &hnsw, &metadata_index, &old).await,
                            None => {
                                if let Some(existing) = noun_store.get(&id).await? {
                                    metadata_index.remove_noun(&id, &existing.metadata);
                                }
                                noun_store.delete(&id).await?;
                                hnsw.delete(&id);
                                Ok(())
                            }
                        }
                    })
                });
                Ok(comp)
            })
        });

        let mut tx = Transaction::new(uuid::Uuid::new_v4().to_string());
        tx.add_operation(op)?;
        self.tx_engine.execute(&mut tx, None, None).await?;
        self.stats.maybe_flush().await?;
        Ok(())
    }

    /// Delete a noun, cascading to every verb that touches it.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.require_writable()?;
        if self.noun_store.get(id).await?.is_none() {
            return Ok(false);
        }

        let noun_store = self.noun_store.clone();
        let verb_store = self.verb_store.clone();
        let hnsw = self.hnsw.clone();
        let metadata_index = self.metadata_index.clone();
        let stats = self.stats.clone();
        let id_owned = id.to_string();

        let args = serde_json::to_value(DeleteNounArgs { id: id_owned.clone() })
            .map_err(|e| DbError::InvalidInput(e.to_string()))?;
        let op = Operation::new("delete_noun", args, move || -> BoxFuture<'static, Result<Compensation>> {
            Box::pin(async move {
                let (removed, removed_verbs) =
                    apply_delete_noun(&noun_store, &verb_store, &hnsw, &metadata_index, &id_owned).await?;
                if let Some(n) = &removed {
                    let service = n.service.as_deref();
                    stats.record_noun_removed(service, &n.r#type.to_string());
                    stats.record_metadata_delta(service, -(n.metadata.len() as i64));
                    stats.record_hnsw_delta(service, -1);
                    for v in &removed_verbs {
                        stats.record_verb_removed(service, &v.r#type.to_string());
                    }
                }
                let noun_store_c = noun_store.clone();
                let verb_store_c = verb_store.clone();
                let hnsw_c = hnsw.clone();
                let metadata_index_c = metadata_index.clone();
                let comp: Compensation = Arc::new(move || {
                    let noun_store = noun_store_c.clone();
                    let verb_store = verb_store_c.clone();
                    let hnsw = hnsw_c.clone();
                    let metadata_index = metadata_index_c.clone();
                    let removed = removed.clone();
                    let removed_verbs = removed_verbs.clone();
                    Box::pin(async move {
                        if let Some(n) = removed {
                            apply_put_noun(&noun_store, &hnsw, &metadata_index, &n).await?;
                        }
                        for v in removed_verbs {
                            verb_store.put(&v).await?;
                        }
                        Ok(())
                    })
                });
                Ok(comp)
            })
        });

        let mut tx = Transaction::new(uuid::Uuid::new_v4().to_string());
        tx.add_operation(op)?;
        self.tx_engine.execute(&mut tx, None, None).await?;
        self.stats.maybe_flush().await?;
        Ok(true)
    }

    /// Create a directed, typed relationship between two existing nouns
    /// (spec §3 invariant 2; dangling endpoints rejected unless configured
    /// otherwise).
    pub async fn relate(&self, request: RelateRequest) -> Result<String> {
        self.require_writable()?;
        let source = self.noun_store.get(&request.from).await?;
        if self.config.dangling_verbs == config::DanglingVerbPolicy::Reject {
            if source.is_none() {
                return Err(DbError::NotFound(request.from));
            }
            if self.noun_store.get(&request.to).await?.is_none() {
                return Err(DbError::NotFound(request.to));
            }
        }
        let weight = request.weight.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&weight) || !weight.is_finite() {
            return Err(DbError::InvalidInput("verb weight must be finite and within [0,1]".to_string()));
        }
        let now = model::now_millis();
        let verb = Verb {
            id: uuid::Uuid::new_v4().to_string(),
            from: request.from,
            to: request.to,
            r#type: request.r#type,
            weight,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };

        let verb_store = self.verb_store.clone();
        let stats = self.stats.clone();
        let verb_for_exec = verb.clone();
        let owner_service = source.and_then(|n| n.service);
        let args = serde_json::to_value(PutVerbArgs { verb: verb.clone() })
            .map_err(|e| DbError::InvalidInput(e.to_string()))?;
        let op = Operation::new("put_verb", args, move || -> BoxFuture<'static, Result<Compensation>> {
            Box::pin(async move {
                apply_put_verb(&verb_store, &verb_for_exec).await?;
                stats.record_verb_added(owner_service.as_deref(), &verb_for_exec.r#type.to_string());
                let verb_store_c = verb_store.clone();
                let id = verb_for_exec.id.clone();
                let comp: Compensation = Arc::new(move || {
                    let verb_store = verb_store_c.clone();
                    let id = id.clone();
                    Box::pin(async move {
                        verb_store.delete(&id).await?;
                        Ok(())
                    })
                });
                Ok(comp)
            })
        });

        let mut tx = Transaction::new(uuid::Uuid::new_v4().to_string());
        tx.add_operation(op)?;
        self.tx_engine.execute(&mut tx, None, None).await?;
        self.stats.maybe_flush().await?;
        Ok(verb.id)
    }

    /// Remove a verb by id.
    pub async fn unrelate(&self, verb_id: &str) -> Result<bool> {
        self.require_writable()?;
        let Some(existing) = self.verb_store.get(verb_id).await? else {
            return Ok(false);
        };
        let verb_store = self.verb_store.clone();
        let stats = self.stats.clone();
        let id_owned = verb_id.to_string();
        let owner_service = self.noun_store.get(&existing.from).await?.and_then(|n| n.service);
        let args = serde_json::to_value(DeleteVerbArgs { id: id_owned.clone() })
            .map_err(|e| DbError::InvalidInput(e.to_string()))?;
        let op = Operation::new("delete_verb", args, move || -> BoxFuture<'static, Result<Compensation>> {
            Box::pin(async move {
                let removed = apply_delete_verb(&verb_store, &id_owned).await?;
                if let Some(v) = &removed {
                    stats.record_verb_removed(owner_service.as_deref(), &v.r#type.to_string());
                }
                let verb_store_c = verb_store.clone();
                let comp: Compensation = Arc::new(move || {
                    let verb_store = verb_store_c.clone();
                    let removed = removed.clone();
                    Box::pin(async move {
                        if let Some(v) = removed {
                            verb_store.put(&v).await?;
                        }
                        Ok(())
                    })
                });
                Ok(comp)
            })
        });

        let mut tx = Transaction::new(uuid::Uuid::new_v4().to_string());
        tx.add_operation(op)?;
        self.tx_engine.execute(&mut tx, None, None).await?;
        self.stats.maybe_flush().await?;
        Ok(true)
    }

    /// List verbs matching every supplied constraint among `from`/`to`/`type`.
    pub async fn get_relations(&self, request: GetRelationsRequest) -> Result<Vec<Verb>> {
        let mut sets: Vec<Vec<Verb>> = Vec::new();
        if let Some(from) = &request.from {
            sets.push(self.verb_store.list_by_source(from).await?);
        }
        if let Some(to) = &request.to {
            sets.push(self.verb_store.list_by_target(to).await?);
        }
        if let Some(t) = &request.r#type {
            sets.push(self.verb_store.list_by_type(t).await?);
        }
        let Some(mut result) = sets.pop() else {
            return Ok(Vec::new());
        };
        for set in sets {
            let ids: std::collections::BTreeSet<&str> = set.iter().map(|v| v.id.as_str()).collect();
            result.retain(|v| ids.contains(v.id.as_str()));
        }
        Ok(result)
    }

    /// Run the triple-intelligence query planner (spec §4.7/§4.8).
    pub async fn find(&self, request: FindRequest) -> Result<Vec<QueryResult>> {
        let (results, _explain) = self.find_explained(request).await?;
        Ok(results)
    }

    /// As [`Self::find`], but also returns per-arm explain data (spec §4.7
    /// "Explain").
    pub async fn find_explained(&self, mut request: FindRequest) -> Result<(Vec<QueryResult>, planner::ExplainInfo)> {
        if request.vector.is_none() {
            if let Some(text) = request.query.take() {
                request.vector = Some(self.resolve_vector(&Some(text), &None).await?);
            }
        }
        let planner = QueryPlanner::new(
            self.noun_store.clone(),
            self.verb_store.clone(),
            self.hnsw.clone(),
            self.metadata_index.clone(),
            self.config.clone(),
        );
        planner.find(&request).await
    }

    /// Nearest neighbors to an existing noun's vector (spec §6.1 `similar`).
    pub async fn similar(&self, request: SimilarRequest) -> Result<Vec<QueryResult>> {
        let source = self
            .noun_store
            .get(&request.to)
            .await?
            .ok_or_else(|| DbError::NotFound(request.to.clone()))?;
        let k = if self.config.similar.include_source {
            request.limit
        } else {
            request.limit + 1
        };
        let found = self.hnsw.search(&source.vector, k.max(1), self.config.hnsw.ef_search.max(k))?;
        let max_dist = found.iter().map(|(_, d)| *d).fold(0.0_f32, f32::max).max(f32::EPSILON);
        let mut out = Vec::new();
        for (id, dist) in found {
            if !self.config.similar.include_source && id == request.to {
                continue;
            }
            let score = 1.0 - (dist as f64 / max_dist as f64);
            if let Some(threshold) = request.threshold {
                if score < threshold {
                    continue;
                }
            }
            if let Some(entity) = self.noun_store.get(&id).await? {
                out.push(QueryResult {
                    id,
                    score,
                    entity,
                    arms: fusion::ArmScores { vector: Some(score), field: None, graph: None },
                });
            }
            if out.len() >= request.limit {
                break;
            }
        }
        Ok(out)
    }

    /// Point-in-time counters for `service`, or the aggregate over every
    /// tracked service if `None` (spec §6.1 `getStatistics`).
    pub fn get_statistics(&self, service: Option<&str>) -> StatsCounters {
        match service {
            Some(s) => self.stats.get(Some(s)),
            None => self.stats.get_all(),
        }
    }

    /// Entity/relationship counts and per-type histograms (spec §6.1
    /// `insights`, extended per SPEC_FULL §B.1/§B.3).
    pub async fn insights(&self) -> Result<InsightsSummary> {
        let totals = self.stats.get_all();
        let (noun_types, verb_types) = self.stats.type_histograms();
        Ok(InsightsSummary {
            entities: totals.noun_count,
            relationships: totals.verb_count,
            noun_types,
            verb_types,
            evicted_field_paths: self.metadata_index.evicted_field_paths(),
        })
    }

    /// Serialize every noun and verb (export/import round-trips preserve
    /// all observable state, spec §6.3).
    pub async fn export(&self, _format: ExportFormat) -> Result<Vec<u8>> {
        let nouns = self.noun_store.list(|_| true).await?;
        let mut verbs = Vec::new();
        for noun in &nouns {
            verbs.extend(self.verb_store.list_by_source(&noun.id).await?);
        }
        let bundle = ExportBundle { nouns, verbs };
        serde_json::to_vec(&bundle).map_err(|e| DbError::InvalidInput(e.to_string()))
    }

    /// Restore state from a blob produced by [`Self::export`] into this
    /// handle, writing directly through the stores and indexes (a bulk
    /// reload, not a transaction).
    pub async fn import(&self, bytes: &[u8]) -> Result<()> {
        self.require_writable()?;
        let bundle: ExportBundle = serde_json::from_slice(bytes).map_err(|e| DbError::InvalidInput(e.to_string()))?;
        for noun in bundle.nouns {
            apply_put_noun(&self.noun_store, &self.hnsw, &self.metadata_index, &noun).await?;
            let service = noun.service.as_deref();
            self.stats.record_noun_added(service, &noun.r#type.to_string());
            self.stats.record_metadata_delta(service, noun.metadata.len() as i64);
            self.stats.record_hnsw_delta(service, 1);
        }
        for verb in bundle.verbs {
            let owner_service = self.noun_store.get(&verb.from).await?.and_then(|n| n.service);
            apply_put_verb(&self.verb_store, &verb).await?;
            self.stats.record_verb_added(owner_service.as_deref(), &verb.r#type.to_string());
        }
        self.stats.flush().await
    }

    /// Remove every noun matching `type` and/or `where` (and their touching
    /// verbs). With neither filter, clears the entire database.
    pub async fn clear(&self, request: ClearRequest) -> Result<()> {
        self.require_writable()?;
        let candidates = self
            .noun_store
            .list(|n| {
                let type_ok = request.r#type.as_ref().is_none_or_match(&n.r#type);
                let where_ok = match &request.r#where {
                    Some(pred) => filter::evaluate(pred, &n.metadata),
                    None => true,
                };
                type_ok && where_ok
            })
            .await?;
        for noun in candidates {
            self.delete(&noun.id).await?;
        }
        Ok(())
    }

    /// Flush the WAL, persist the HNSW graph, and flush pending statistics.
    pub async fn close(&self) -> Result<()> {
        self.wal.flush().await?;
        let snapshot = self.hnsw.snapshot();
        storage::put_encoded(self.backend.as_ref(), HNSW_GRAPH_KEY, &snapshot).await?;
        self.stats.flush().await?;
        Ok(())
    }
}

trait OptionTypeMatch {
    fn is_none_or_match(&self, other: &NounType) -> bool;
}

impl OptionTypeMatch for Option<&NounType> {
    fn is_none_or_match(&self, other: &NounType) -> bool {
        match self {
            Some(t) => *t == other,
            None => true,
        }
    }
}

/// Replay dispatcher: maps a WAL-persisted `(op, args)` intent back onto the
/// low-level mutation it represents, independent of the closures used
/// during normal execution (which are not themselves serializable). Spec §9
/// Open Question 3: operations are deterministic given their recorded
/// arguments, so replay re-runs them rather than diffing state.
async fn apply_intent<S: StorageBackend>(
    noun_store: &NounStore<S>,
    verb_store: &VerbStore<S>,
    hnsw: &HnswGraph,
    metadata_index: &MetadataIndex,
    intent: &OpIntent,
) -> Result<()> {
    match intent.op.as_str() {
        "put_noun" => {
            let args: PutNounArgs =
                serde_json::from_value(intent.args.clone()).map_err(|e| DbError::Corruption(e.to_string()))?;
            apply_put_noun(noun_store, hnsw, metadata_index, &args.noun).await
        }
        "delete_noun" => {
            let args: DeleteNounArgs =
                serde_json::from_value(intent.args.clone()).map_err(|e| DbError::Corruption(e.to_string()))?;
            apply_delete_noun(noun_store, verb_store, hnsw, metadata_index, &args.id).await.map(|_| ())
        }
        "put_verb" => {
            let args: PutVerbArgs =
                serde_json::from_value(intent.args.clone()).map_err(|e| DbError::Corruption(e.to_string()))?;
            apply_put_verb(verb_store, &args.verb).await
        }
        "delete_verb" => {
            let args: DeleteVerbArgs =
                serde_json::from_value(intent.args.clone()).map_err(|e| DbError::Corruption(e.to_string()))?;
            apply_delete_verb(verb_store, &args.id).await.map(|_| ())
        }
        other => Err(DbError::Corruption(format!("unknown WAL op {other}"))),
    }
}

#[cfg(test)]
mod scenarios {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use planner::Direction;

    fn noun_request(role: &str, kind: NounType) -> AddRequest {
        let mut metadata = BTreeMap::new();
        metadata.insert("role".to_string(), Value::String(role.to_string()));
        AddRequest {
            vector: Some(vec![0.0; model::VECTOR_DIM]),
            r#type: kind,
            metadata,
            ..Default::default()
        }
    }

    async fn open_db() -> Database<MemoryBackend> {
        Database::open(Arc::new(MemoryBackend::new()), DbConfig::default(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn s1_role_filter_finds_exact_developers() {
        let db = open_db().await;
        db.add(noun_request("developer", NounType::Person)).await.unwrap();
        db.add(noun_request("designer", NounType::Person)).await.unwrap();
        db.add(noun_request("developer", NounType::Person)).await.unwrap();

        let results = db
            .find(FindRequest {
                where_: Some(Predicate::Eq("role".into(), Value::String("developer".into()))),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn s3_cascade_delete_removes_touching_verbs() {
        let db = open_db().await;
        let a = db.add(noun_request("a", NounType::Thing)).await.unwrap();
        let b = db.add(noun_request("b", NounType::Thing)).await.unwrap();
        let c = db.add(noun_request("c", NounType::Thing)).await.unwrap();
        db.relate(RelateRequest {
            from: a.clone(),
            to: b.clone(),
            r#type: VerbType::WorksWith,
            weight: None,
            metadata: BTreeMap::new(),
        })
        .await
        .unwrap();
        db.relate(RelateRequest {
            from: a.clone(),
            to: c.clone(),
            r#type: VerbType::Modifies,
            weight: None,
            metadata: BTreeMap::new(),
        })
        .await
        .unwrap();

        let relations = db
            .get_relations(GetRelationsRequest { from: Some(a.clone()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(relations.len(), 2);

        assert!(db.delete(&a).await.unwrap());
        let relations_after = db
            .get_relations(GetRelationsRequest { from: Some(a.clone()), ..Default::default() })
            .await
            .unwrap();
        assert!(relations_after.is_empty());
        assert!(db.get(&b).await.unwrap().is_some());
        assert!(db.get(&c).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn s5_failed_transaction_leaves_no_trace() {
        let db = open_db().await;
        let before = db.get_statistics(None).noun_count;
        let bad = AddRequest {
            vector: Some(vec![0.0; 10]), // wrong dimension
            r#type: NounType::Thing,
            ..Default::default()
        };
        let err = db.add(bad).await.unwrap_err();
        assert!(matches!(err, DbError::DimensionMismatch { .. }));
        assert_eq!(db.get_statistics(None).noun_count, before);
    }

    #[tokio::test]
    async fn s6_reopen_after_deletes_preserves_surviving_count() {
        let backend = Arc::new(MemoryBackend::new());
        let ids: Vec<String> = {
            let db = Database::open(backend.clone(), DbConfig::default(), None).await.unwrap();
            let mut ids = Vec::new();
            for i in 0..10 {
                ids.push(db.add(noun_request(&format!("r{i}"), NounType::Thing)).await.unwrap());
            }
            for id in ids.iter().take(4) {
                db.delete(id).await.unwrap();
            }
            db.close().await.unwrap();
            ids
        };
        let reopened = Database::open(backend, DbConfig::default(), None).await.unwrap();
        assert_eq!(reopened.get_statistics(None).noun_count, 6);
        for id in ids.iter().skip(4) {
            assert!(reopened.get(id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn empty_database_find_returns_nothing() {
        let db = open_db().await;
        let results = db.find(FindRequest { limit: 10, ..Default::default() }).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn similar_excludes_source_by_default() {
        let db = open_db().await;
        let a = db.add(noun_request("a", NounType::Thing)).await.unwrap();
        db.add(noun_request("b", NounType::Thing)).await.unwrap();
        let results = db.similar(SimilarRequest { to: a.clone(), limit: 5, threshold: None }).await.unwrap();
        assert!(results.iter().all(|r| r.id != a));
    }

    #[tokio::test]
    async fn export_import_round_trips_noun_count() {
        let db = open_db().await;
        db.add(noun_request("a", NounType::Thing)).await.unwrap();
        db.add(noun_request("b", NounType::Thing)).await.unwrap();
        let bytes = db.export(ExportFormat::Json).await.unwrap();

        let fresh = open_db().await;
        fresh.import(&bytes).await.unwrap();
        assert_eq!(fresh.get_statistics(None).noun_count, 2);
    }

    #[tokio::test]
    async fn graph_find_reaches_connected_nodes() {
        let db = open_db().await;
        let a = db.add(noun_request("a", NounType::Thing)).await.unwrap();
        let b = db.add(noun_request("b", NounType::Thing)).await.unwrap();
        db.relate(RelateRequest {
            from: a.clone(),
            to: b.clone(),
            r#type: VerbType::WorksWith,
            weight: None,
            metadata: BTreeMap::new(),
        })
        .await
        .unwrap();
        let results = db
            .find(FindRequest {
                connected: Some(GraphConstraint {
                    from: a.clone(),
                    depth: 1,
                    direction: Direction::Outgoing,
                    verb_type: None,
                }),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, b);
    }

    #[tokio::test]
    async fn read_only_handle_rejects_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let db = Database::open_read_only(backend, DbConfig::default()).await.unwrap();
        let err = db.add(noun_request("a", NounType::Thing)).await.unwrap_err();
        assert!(matches!(err, DbError::ReadOnly));
    }

    #[tokio::test]
    async fn relate_rejects_dangling_endpoint_by_default() {
        let db = open_db().await;
        let a = db.add(noun_request("a", NounType::Thing)).await.unwrap();
        let err = db
            .relate(RelateRequest {
                from: a,
                to: "missing".to_string(),
                r#type: VerbType::WorksWith,
                weight: None,
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    /// Deterministic stand-in for a real embedding model: hashes the text
    /// and expands it into a fixed-length vector via a simple LCG, so the
    /// same text always embeds to the same vector across calls and opens.
    struct HashEmbedder;

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            let mut state = hasher.finish();
            let mut out = Vec::with_capacity(model::VECTOR_DIM);
            for _ in 0..model::VECTOR_DIM {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                out.push(((state >> 11) as f64 / u64::MAX as f64) as f32);
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn s4_text_query_returns_distinct_live_ids_deterministically() {
        let db = Database::open(
            Arc::new(MemoryBackend::new()),
            DbConfig::default(),
            Some(Arc::new(HashEmbedder)),
        )
        .await
        .unwrap();
        for i in 0..500 {
            db.add(AddRequest {
                data: Some(format!("document body {i}")),
                r#type: NounType::Thing,
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let run = || {
            let db = &db;
            async move {
                db.find(FindRequest {
                    query: Some("performance test".to_string()),
                    limit: 10,
                    ..Default::default()
                })
                .await
                .unwrap()
            }
        };
        let first = run().await;
        let second = run().await;

        assert_eq!(first.len(), 10);
        let ids: std::collections::BTreeSet<&str> = first.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 10);
        let second_ids: Vec<&str> = second.iter().map(|r| r.id.as_str()).collect();
        let first_ids: Vec<&str> = first.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }
}
