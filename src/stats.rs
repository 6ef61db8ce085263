//! Statistics (C10): per-service counters for nouns, verbs, metadata
//! entries, and HNSW index size, persisted through [`StorageBackend`] with
//! date-partitioned keys so a busy service never hot-spots a single key
//! (spec §4.10 "Scale discipline").

use crate::error::{DbError, Result};
use crate::storage::{get_decoded, put_encoded, StorageBackend};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The default tag used for nouns/verbs that don't specify a `service`.
pub const DEFAULT_SERVICE: &str = "_default";

/// Point-in-time counters for one service.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct StatsCounters {
    pub noun_count: i64,
    pub verb_count: i64,
    pub metadata_count: i64,
    pub hnsw_index_size: i64,
}

/// A persisted snapshot, keyed `stats/<service>/<yyyy-mm-dd>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    service: String,
    date: String,
    counters: StatsCounters,
}

/// Pre-partitioning "legacy" flat counters this core migrates on first
/// write, rather than erroring on an unrecognized shape (spec §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacySnapshot {
    noun_count: i64,
    verb_count: i64,
}

/// Type + kind histogram entry for [`Statistics::insights`] (SPEC_FULL §B.1).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct TypeCount(i64);

/// Per-service, per-type counters and batched persistence.
pub struct Statistics<S: StorageBackend> {
    backend: Arc<S>,
    config: crate::config::StatisticsConfig,
    counters: DashMap<String, StatsCounters>,
    noun_type_counts: DashMap<(String, String), TypeCount>,
    verb_type_counts: DashMap<(String, String), TypeCount>,
    evicted_field_paths: AtomicU64,
    pending_updates: AtomicUsize,
    last_flush: Mutex<std::time::Instant>,
}

impl<S: StorageBackend> Statistics<S> {
    pub fn new(backend: Arc<S>, config: crate::config::StatisticsConfig) -> Self {
        Self {
            backend,
            config,
            counters: DashMap::new(),
            noun_type_counts: DashMap::new(),
            verb_type_counts: DashMap::new(),
            evicted_field_paths: AtomicU64::new(0),
            pending_updates: AtomicUsize::new(0),
            last_flush: Mutex::new(std::time::Instant::now()),
        }
    }

    fn service_key(service: Option<&str>) -> String {
        service.unwrap_or(DEFAULT_SERVICE).to_string()
    }

    fn date_key() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    fn storage_key(service: &str, date: &str) -> String {
        format!("stats/{service}/{date}")
    }

    /// Load (and, if shaped as a legacy flat counter, migrate) persisted
    /// counters for `service` as of today.
    pub async fn load(&self, service: Option<&str>) -> Result<()> {
        let svc = Self::service_key(service);
        let key = Self::storage_key(&svc, &Self::date_key());
        if let Some(snapshot) = with_backoff(&self.config, || {
            get_decoded::<Snapshot, _>(self.backend.as_ref(), &key)
        })
        .await?
        {
            self.counters.insert(svc, snapshot.counters);
            return Ok(());
        }
        if let Some(legacy) = with_backoff(&self.config, || {
            get_decoded::<LegacySnapshot, _>(self.backend.as_ref(), &key)
        })
        .await?
        {
            tracing::info!(service = %svc, "migrating legacy flat stats counter");
            self.counters.insert(
                svc,
                StatsCounters {
                    noun_count: legacy.noun_count,
                    verb_count: legacy.verb_count,
                    ..Default::default()
                },
            );
        }
        Ok(())
    }

    /// Restore persisted counters for every service with data under
    /// `stats/`, not just the default service. Invariant 7 (spec §8) must
    /// hold for every service tag after a reopen, not only the unnamed one.
    pub async fn load_all(&self) -> Result<()> {
        let keys = with_backoff(&self.config, || self.backend.list("stats/")).await?;
        let mut services: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        services.insert(DEFAULT_SERVICE.to_string());
        for key in &keys {
            if let Some(rest) = key.strip_prefix("stats/") {
                if let Some((service, _date)) = rest.split_once('/') {
                    services.insert(service.to_string());
                }
            }
        }
        for service in services {
            self.load(Some(&service)).await?;
        }
        Ok(())
    }

    fn bump(&self, service: Option<&str>, f: impl FnOnce(&mut StatsCounters)) {
        let svc = Self::service_key(service);
        let mut entry = self.counters.entry(svc).or_default();
        f(&mut entry);
        self.pending_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_noun_added(&self, service: Option<&str>, noun_type: &str) {
        self.bump(service, |c| c.noun_count += 1);
        self.noun_type_counts
            .entry((Self::service_key(service), noun_type.to_string()))
            .or_default()
            .0 += 1;
    }

    pub fn record_noun_removed(&self, service: Option<&str>, noun_type: &str) {
        self.bump(service, |c| c.noun_count -= 1);
        if let Some(mut entry) = self
            .noun_type_counts
            .get_mut(&(Self::service_key(service), noun_type.to_string()))
        {
            entry.0 -= 1;
        }
    }

    pub fn record_verb_added(&self, service: Option<&str>, verb_type: &str) {
        self.bump(service, |c| c.verb_count += 1);
        self.verb_type_counts
            .entry((Self::service_key(service), verb_type.to_string()))
            .or_default()
            .0 += 1;
    }

    pub fn record_verb_removed(&self, service: Option<&str>, verb_type: &str) {
        self.bump(service, |c| c.verb_count -= 1);
        if let Some(mut entry) = self
            .verb_type_counts
            .get_mut(&(Self::service_key(service), verb_type.to_string()))
        {
            entry.0 -= 1;
        }
    }

    pub fn record_metadata_delta(&self, service: Option<&str>, delta: i64) {
        self.bump(service, |c| c.metadata_count += delta);
    }

    pub fn record_hnsw_delta(&self, service: Option<&str>, delta: i64) {
        self.bump(service, |c| c.hnsw_index_size += delta);
    }

    /// Count a metadata-index field-path eviction (SPEC_FULL §B.3 telemetry).
    pub fn record_field_eviction(&self) {
        self.evicted_field_paths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted_field_paths(&self) -> u64 {
        self.evicted_field_paths.load(Ordering::Relaxed)
    }

    /// Flush pending counters to storage if either batching threshold has
    /// been crossed since the last flush.
    pub async fn maybe_flush(&self) -> Result<()> {
        let pending = self.pending_updates.load(Ordering::Relaxed);
        let elapsed = self.last_flush.lock().await.elapsed();
        if pending >= self.config.flush_every_updates || elapsed >= self.config.flush_interval {
            self.flush().await?;
        }
        Ok(())
    }

    /// Unconditionally persist current counters for every known service.
    pub async fn flush(&self) -> Result<()> {
        let date = Self::date_key();
        for entry in self.counters.iter() {
            let snapshot = Snapshot {
                service: entry.key().clone(),
                date: date.clone(),
                counters: *entry.value(),
            };
            let key = Self::storage_key(entry.key(), &date);
            with_backoff(&self.config, || put_encoded(self.backend.as_ref(), &key, &snapshot)).await?;
        }
        self.pending_updates.store(0, Ordering::Relaxed);
        *self.last_flush.lock().await = std::time::Instant::now();
        Ok(())
    }

    /// Point-in-time snapshot for `service`, or the default service if
    /// `None`. A quiescent read (spec §8 invariant 7) reflects all flushed
    /// and pending updates, since counters live in memory between flushes.
    pub fn get(&self, service: Option<&str>) -> StatsCounters {
        self.counters
            .get(&Self::service_key(service))
            .map(|c| *c)
            .unwrap_or_default()
    }

    /// Aggregate counters across every tracked service.
    pub fn get_all(&self) -> StatsCounters {
        let mut total = StatsCounters::default();
        for entry in self.counters.iter() {
            total.noun_count += entry.noun_count;
            total.verb_count += entry.verb_count;
            total.metadata_count += entry.metadata_count;
            total.hnsw_index_size += entry.hnsw_index_size;
        }
        total
    }

    /// Per-noun-type and per-verb-type histograms across all services
    /// (SPEC_FULL §B.1 `insights()` breakdown).
    pub fn type_histograms(&self) -> (Vec<(String, i64)>, Vec<(String, i64)>) {
        let mut nouns: std::collections::BTreeMap<String, i64> = std::collections::BTreeMap::new();
        for entry in self.noun_type_counts.iter() {
            *nouns.entry(entry.key().1.clone()).or_insert(0) += entry.value().0;
        }
        let mut verbs: std::collections::BTreeMap<String, i64> = std::collections::BTreeMap::new();
        for entry in self.verb_type_counts.iter() {
            *verbs.entry(entry.key().1.clone()).or_insert(0) += entry.value().0;
        }
        (nouns.into_iter().collect(), verbs.into_iter().collect())
    }
}

/// Retry a storage operation with exponential backoff on retriable errors
/// (`StorageFail`/`Throttled`, which covers HTTP 429 and equivalents at the
/// adapter layer).
async fn with_backoff<T, F, Fut>(config: &crate::config::StatisticsConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if err.is_retriable() && attempt < config.max_retry_attempts => {
                let delay = config.retry_base_delay * 2u32.pow(attempt as u32);
                tracing::warn!(attempt, ?delay, error = %err, "retrying storage op after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(map_terminal(err)),
        }
    }
}

fn map_terminal(err: DbError) -> DbError {
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    fn stats() -> Statistics<MemoryBackend> {
        Statistics::new(Arc::new(MemoryBackend::new()), crate::config::StatisticsConfig::default())
    }

    #[tokio::test]
    async fn counts_reflect_add_and_remove() {
        let s = stats();
        s.record_noun_added(Some("svc"), "Person");
        s.record_noun_added(Some("svc"), "Person");
        s.record_noun_removed(Some("svc"), "Person");
        assert_eq!(s.get(Some("svc")).noun_count, 1);
    }

    #[tokio::test]
    async fn delete_then_add_restores_prior_count() {
        let s = stats();
        let before = s.get(Some("svc")).noun_count;
        s.record_noun_added(Some("svc"), "Thing");
        s.record_noun_removed(Some("svc"), "Thing");
        assert_eq!(s.get(Some("svc")).noun_count, before);
    }

    #[tokio::test]
    async fn flush_and_reload_round_trips() {
        let backend = Arc::new(MemoryBackend::new());
        let s1 = Statistics::new(backend.clone(), crate::config::StatisticsConfig::default());
        s1.record_noun_added(Some("svc"), "Person");
        s1.flush().await.unwrap();

        let s2 = Statistics::new(backend, crate::config::StatisticsConfig::default());
        s2.load(Some("svc")).await.unwrap();
        assert_eq!(s2.get(Some("svc")).noun_count, 1);
    }

    #[tokio::test]
    async fn load_all_restores_every_persisted_service() {
        let backend = Arc::new(MemoryBackend::new());
        let s1 = Statistics::new(backend.clone(), crate::config::StatisticsConfig::default());
        s1.record_noun_added(Some("svc-a"), "Person");
        s1.record_noun_added(Some("svc-b"), "Document");
        s1.flush().await.unwrap();

        let s2 = Statistics::new(backend, crate::config::StatisticsConfig::default());
        s2.load_all().await.unwrap();
        assert_eq!(s2.get(Some("svc-a")).noun_count, 1);
        assert_eq!(s2.get(Some("svc-b")).noun_count, 1);
    }

    #[tokio::test]
    async fn aggregate_across_services() {
        let s = stats();
        s.record_noun_added(Some("a"), "Person");
        s.record_noun_added(Some("b"), "Person");
        assert_eq!(s.get_all().noun_count, 2);
    }

    #[tokio::test]
    async fn type_histograms_report_live_counts() {
        let s = stats();
        s.record_noun_added(Some("svc"), "Person");
        s.record_noun_added(Some("svc"), "Person");
        s.record_noun_added(Some("svc"), "Document");
        let (nouns, _verbs) = s.type_histograms();
        assert_eq!(
            nouns,
            vec![("Document".to_string(), 1), ("Person".to_string(), 2)]
        );
    }
}
