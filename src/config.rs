//! Runtime configuration for a [`crate::Database`] handle.
//!
//! Every tunable named across spec §3/§4 lives here as a single,
//! `serde`-serializable struct with the documented defaults. Loading this
//! struct from a file or environment — and the CLI/REPL surface that would
//! drive that — is out of core scope (spec §1); the core only defines and
//! validates the struct itself.

use crate::filter::Predicate;
use crate::fusion::FusionStrategy;
use crate::hnsw::distance::DistanceMetric;
use crate::hnsw::HnswParams;
use crate::transaction::TransactionConfig;
use crate::wal::FlushStrategy;
use std::time::Duration;

/// How a [`crate::hnsw::HnswGraph`]'s tombstone backlog is compacted.
#[derive(Debug, Clone, Copy)]
pub struct CompactionPolicy {
    /// Fraction of tombstoned arena slots (0.0-1.0) that triggers a
    /// background rebuild. Default `0.2` (spec §4.5).
    pub tombstone_threshold: f64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            tombstone_threshold: 0.2,
        }
    }
}

/// Metadata index tunables (spec §4.6).
#[derive(Debug, Clone)]
pub struct MetadataIndexConfig {
    /// Ceiling on distinct field paths tracked before the least-used one is
    /// evicted and falls back to the filter evaluator. Default `10_000`.
    pub max_index_size: usize,
    /// Field paths never indexed. Default excludes `id` (spec §3 invariant 4).
    pub excluded_fields: Vec<String>,
    /// Below this candidate-set size, the query planner brute-forces vector
    /// distance instead of enlarging `ef` and post-filtering (spec §4.7).
    pub brute_force_threshold: usize,
}

impl Default for MetadataIndexConfig {
    fn default() -> Self {
        Self {
            max_index_size: 10_000,
            excluded_fields: vec!["id".to_string()],
            brute_force_threshold: 1_000,
        }
    }
}

/// Noun store tunables (spec §4.3).
#[derive(Debug, Clone, Copy)]
pub struct NounStoreConfig {
    /// Hot-cache capacity, in number of nouns. Default `10_000`.
    pub cache_capacity: usize,
}

impl Default for NounStoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
        }
    }
}

/// Statistics tunables (spec §4.10).
#[derive(Debug, Clone, Copy)]
pub struct StatisticsConfig {
    /// Flush pending counter deltas after this many updates accumulate.
    pub flush_every_updates: usize,
    /// Flush pending counter deltas after this much time elapses.
    pub flush_interval: Duration,
    /// Maximum storage-retry attempts on `StorageFail`/`Throttled` before
    /// surfacing the error, with exponential backoff between attempts.
    pub max_retry_attempts: usize,
    pub retry_base_delay: Duration,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            flush_every_updates: 100,
            flush_interval: Duration::from_secs(5),
            max_retry_attempts: 5,
            retry_base_delay: Duration::from_millis(50),
        }
    }
}

/// Default behavior for `similar({to})` (spec §9 Open Question 1).
#[derive(Debug, Clone, Copy)]
pub struct SimilarOptions {
    /// Whether the source noun's own id may appear in the result set.
    pub include_source: bool,
}

impl Default for SimilarOptions {
    fn default() -> Self {
        Self {
            include_source: false,
        }
    }
}

/// Whether a `relate()` call is allowed to reference a noun id that does
/// not (yet) exist in the noun store (spec §3 invariant 2 "dangling mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DanglingVerbPolicy {
    Reject,
    Allow,
}

impl Default for DanglingVerbPolicy {
    fn default() -> Self {
        DanglingVerbPolicy::Reject
    }
}

/// Top-level configuration for a [`crate::Database`] handle.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub hnsw: HnswParams,
    pub distance_metric: DistanceMetric,
    pub compaction: CompactionPolicy,
    pub wal_flush_strategy: FlushStrategy,
    pub noun_store: NounStoreConfig,
    pub metadata_index: MetadataIndexConfig,
    pub transaction: TransactionConfig,
    pub statistics: StatisticsConfig,
    pub similar: SimilarOptions,
    pub dangling_verbs: DanglingVerbPolicy,
    pub default_fusion_strategy: FusionStrategy,
    /// Graph-arm traversal depth when `connected.depth` is not supplied.
    pub default_connected_depth: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            hnsw: HnswParams::default(),
            distance_metric: DistanceMetric::Cosine,
            compaction: CompactionPolicy::default(),
            wal_flush_strategy: FlushStrategy::PerOperation,
            noun_store: NounStoreConfig::default(),
            metadata_index: MetadataIndexConfig::default(),
            transaction: TransactionConfig::default(),
            statistics: StatisticsConfig::default(),
            similar: SimilarOptions::default(),
            dangling_verbs: DanglingVerbPolicy::default(),
            default_fusion_strategy: FusionStrategy::default(),
            default_connected_depth: 1,
        }
    }
}

impl DbConfig {
    /// Fields outside the core's control that configuration attempts to
    /// override are silently ignored: the vector dimension is a hard
    /// invariant of the core (spec §6.4) and is not exposed here as a knob.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.hnsw.m == 0 {
            return Err(crate::error::DbError::InvalidInput(
                "hnsw.m must be greater than zero".to_string(),
            ));
        }
        if self.metadata_index.max_index_size == 0 {
            return Err(crate::error::DbError::InvalidInput(
                "metadata_index.max_index_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A compiled `where` predicate plus the raw field paths it touches, handed
/// to the query planner (spec §6.2).
#[derive(Debug, Clone)]
pub struct WhereClause(pub Predicate);
