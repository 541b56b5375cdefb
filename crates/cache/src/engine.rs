// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The engine ties the registry, the provider, transaction bookkeeping and notifications together.
//! It is always held in an `Arc`; transactions keep a reference back to it.

use crate::config::EngineConfig;
use crate::error::Error;
use crate::notify::{
    CachedList, NotificationManager, NotificationTransport, PredicateKey, ProcessId, SourceFilter,
};
use crate::provider::Provider;
use crate::record::{AsOf, PrimaryKey, VersionedRecord};
use crate::registry::{EntityCache, EntityDef, EntityName, Registry};
use crate::tx::{CommitClock, KeyLockTable, Transaction, TxId, TxOptions, TxState};
use parking_lot::Mutex;
use rand::Rng;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempora_common::util::{CachePadded, PerfCounter};
use tracing::{debug, info, warn};

pub struct EngineCounters {
    pub commit_check: PerfCounter,
    pub commit_apply: PerfCounter,
}

impl EngineCounters {
    fn new() -> Self {
        Self {
            commit_check: PerfCounter::new("commit_check"),
            commit_apply: PerfCounter::new("commit_apply"),
        }
    }

    pub fn all_counters(&self) -> [&PerfCounter; 2] {
        [&self.commit_check, &self.commit_apply]
    }
}

/// Progress of a chunked delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkedOutcome {
    pub rows: usize,
    pub chunks: usize,
}

/// A chunked delete stopped partway. Everything in `completed` is committed; nothing of the failing
/// chunk is.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "chunked delete failed after {} chunk(s) ({} rows): {error}",
    completed.chunks,
    completed.rows
)]
pub struct ChunkedFailure {
    pub completed: ChunkedOutcome,
    #[source]
    pub error: Error,
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<Registry>,
    provider: Arc<dyn Provider>,
    notifications: NotificationManager,
    key_locks: KeyLockTable,
    clock: CommitClock,
    next_tx: CachePadded<AtomicU64>,
    /// Serializes the check and apply phases of write commits.
    commit_lock: Mutex<()>,
    counters: EngineCounters,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<Registry>,
        provider: Arc<dyn Provider>,
        transport: Arc<dyn NotificationTransport>,
    ) -> Arc<Self> {
        let process = ProcessId::generate();
        let notifications =
            NotificationManager::new(process, registry.clone(), transport, config.dedup_window);
        info!(%process, entities = registry.names().len(), "Engine started");
        Arc::new(Self {
            config,
            registry,
            provider,
            notifications,
            key_locks: KeyLockTable::new(),
            clock: CommitClock::new(),
            next_tx: CachePadded::new(AtomicU64::new(1)),
            commit_lock: Mutex::new(()),
            counters: EngineCounters::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }

    pub fn key_locks(&self) -> &KeyLockTable {
        &self.key_locks
    }

    pub fn clock(&self) -> &CommitClock {
        &self.clock
    }

    pub(crate) fn commit_lock(&self) -> &Mutex<()> {
        &self.commit_lock
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn process(&self) -> ProcessId {
        self.notifications.process()
    }

    pub fn register_entity(&self, def: EntityDef) -> Result<Arc<EntityCache>, Error> {
        self.registry.register(def)
    }

    pub fn begin(self: &Arc<Self>, options: TxOptions) -> Transaction {
        self.begin_with_priority(options, None)
    }

    pub(crate) fn allocate_tx_id(&self) -> TxId {
        TxId(self.next_tx.fetch_add(1, Ordering::Relaxed))
    }

    fn begin_with_priority(
        self: &Arc<Self>,
        options: TxOptions,
        priority: Option<TxId>,
    ) -> Transaction {
        let id = self.allocate_tx_id();
        Transaction::new(self.clone(), id, priority.unwrap_or(id), options)
    }

    /// Run `body` in a transaction and commit it. With `retry_on_conflict`, retryable failures
    /// re-run the body from the start in a fresh transaction, after a jittered backoff.
    ///
    /// The body may run several times, so anything it does outside the transaction must be safe
    /// to repeat.
    pub fn execute<T>(
        self: &Arc<Self>,
        options: TxOptions,
        mut body: impl FnMut(&mut Transaction) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let mut priority = None;
        let mut attempt = 0;
        loop {
            let mut tx = self.begin_with_priority(options.clone(), priority);
            priority.get_or_insert(tx.priority());
            let id = tx.id();
            let result = match body(&mut tx) {
                Ok(value) => tx.commit().map(|_| value),
                Err(e) => {
                    tx.rollback();
                    Err(e)
                }
            };
            let e = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !options.retry_on_conflict || !e.is_retryable() {
                return Err(e);
            }
            if attempt >= max_retries {
                warn!(
                    tx = %id,
                    attempts = attempt + 1,
                    error = %e,
                    "Giving up after repeated conflicts"
                );
                return Err(e);
            }
            attempt += 1;
            let backoff = self.backoff(attempt);
            debug!(tx = %id, state = %TxState::Retrying, attempt, ?backoff, error = %e,
                "Retrying transaction");
            std::thread::sleep(backoff);
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let base = self.config.retry_backoff;
        let jitter_micros = base.as_micros().min(u64::MAX as u128) as u64;
        let jitter = if jitter_micros == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_micros)
        };
        base.saturating_mul(attempt as u32) + Duration::from_micros(jitter)
    }

    /// A one-off read outside any transaction. Nothing is validated later.
    pub fn find(
        self: &Arc<Self>,
        entity: &EntityName,
        key: &PrimaryKey,
        as_of: AsOf,
    ) -> Result<Option<Arc<VersionedRecord>>, Error> {
        let options = TxOptions::default().with_isolation(entity, crate::tx::Isolation::NoLocking);
        let mut tx = self.begin(options);
        let found = tx.find(entity, key, as_of);
        tx.rollback();
        found
    }

    /// Make every row the provider holds for `entity` resident. Keys already resident are left
    /// alone. Returns the number of rows added.
    pub fn load_all(&self, entity: &EntityName) -> Result<usize, Error> {
        let cache = self.registry.get(entity)?;
        let rows = self
            .provider
            .load_by_range(entity, Bound::Unbounded, Bound::Unbounded)?;
        let mut index = cache.index().write();
        let fresh: Vec<VersionedRecord> = rows
            .into_iter()
            .filter(|r| !index.contains_key(&r.primary_key))
            .collect();
        let added = fresh.len();
        for row in fresh {
            index.put_semi_unique(row);
        }
        for overlap in index.collect_milestoning_overlaps() {
            warn!(%entity, key = %overlap.key, rows = overlap.records.len(),
                "Overlapping rows loaded from provider");
        }
        debug!(%entity, added, "Loaded entity");
        Ok(added)
    }

    /// Replace the resident copies of `keys` with what the provider holds now.
    pub fn refresh(&self, entity: &EntityName, keys: &[PrimaryKey]) -> Result<usize, Error> {
        let cache = self.registry.get(entity)?;
        let mut loaded = Vec::with_capacity(keys.len());
        for key in keys {
            loaded.push((key, self.provider.load_by_key(entity, key)?));
        }
        let mut index = cache.index().write();
        let mut rows = 0;
        for (key, records) in loaded {
            index.remove_key(key);
            rows += records.len();
            for record in records {
                index.put_semi_unique(record);
            }
        }
        for overlap in index.collect_milestoning_overlaps() {
            warn!(%entity, key = %overlap.key, rows = overlap.records.len(),
                "Overlapping rows refreshed from provider");
        }
        drop(index);
        cache.bump_update_count();
        debug!(%entity, keys = keys.len(), rows, "Refreshed keys");
        Ok(rows)
    }

    /// Keys of `entity` whose current provider rows satisfy `filter`, in key order.
    fn matching_keys(
        &self,
        entity: &EntityName,
        filter: impl Fn(&VersionedRecord) -> bool,
    ) -> Result<Vec<PrimaryKey>, Error> {
        let rows = self
            .provider
            .load_by_range(entity, Bound::Unbounded, Bound::Unbounded)?;
        let mut keys: Vec<PrimaryKey> = rows
            .iter()
            .filter(|r| r.is_processing_current() && filter(r))
            .map(|r| r.primary_key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Delete every row matching `filter`, committing `chunk_size` keys per transaction. Each
    /// chunk gets its own deadline, so large deletes are not bound by a single transaction
    /// timeout.
    pub fn delete_all_in_batches(
        self: &Arc<Self>,
        entity: &EntityName,
        filter: impl Fn(&VersionedRecord) -> bool,
        chunk_size: usize,
        options: TxOptions,
    ) -> Result<ChunkedOutcome, ChunkedFailure> {
        let mut completed = ChunkedOutcome::default();
        let keys = self
            .matching_keys(entity, filter)
            .map_err(|error| ChunkedFailure { completed, error })?;
        for chunk in keys.chunks(chunk_size.max(1)) {
            let deleted = self.execute(options.clone(), |tx| {
                for key in chunk {
                    tx.delete(entity, key)?;
                }
                Ok(chunk.len())
            });
            match deleted {
                Ok(rows) => {
                    completed.rows += rows;
                    completed.chunks += 1;
                    debug!(%entity, chunk = completed.chunks, total = completed.rows,
                        "Committed delete chunk");
                }
                Err(error) => {
                    warn!(%entity, chunks = completed.chunks, rows = completed.rows, %error,
                        "Chunked delete stopped");
                    return Err(ChunkedFailure { completed, error });
                }
            }
        }
        info!(%entity, rows = completed.rows, chunks = completed.chunks, "Chunked delete complete");
        Ok(completed)
    }

    /// Delete everything matching `filter` in one transaction, announced to subscribers as a
    /// single mass delete for `predicate`.
    pub fn mass_delete(
        self: &Arc<Self>,
        entity: &EntityName,
        predicate: PredicateKey,
        filter: impl Fn(&VersionedRecord) -> bool,
    ) -> Result<usize, Error> {
        let keys = self.matching_keys(entity, filter)?;
        self.execute(TxOptions::retrying(), |tx| {
            for key in &keys {
                tx.delete(entity, key)?;
            }
            tx.mark_mass_delete(entity, predicate.clone());
            Ok(keys.len())
        })
    }

    /// The cached result of a query over `entity`, recomputed when it has gone stale. New lists
    /// are subscribed to the entity's change events.
    pub fn cached_query(
        &self,
        entity: &EntityName,
        predicate: &PredicateKey,
        as_of: AsOf,
        filter: impl Fn(&VersionedRecord) -> bool,
    ) -> Result<Arc<CachedList>, Error> {
        let cache = self.registry.get(entity)?;
        let as_of = cache.shape().normalize(as_of);
        let (list, created) =
            cache
                .queries()
                .get_or_compute(entity, predicate, cache.update_count(), || {
                    self.load_all(entity)?;
                    let index = cache.index().read();
                    Ok(index
                        .keys()
                        .filter_map(|key| index.get(key, as_of))
                        .filter(|r| filter(r))
                        .collect())
                })?;
        if created {
            self.notifications.register_list(&list, None)?;
        }
        Ok(list)
    }

    /// A fixed list of records, kept until one of its members changes.
    pub fn cached_list(
        &self,
        entity: &EntityName,
        records: Vec<Arc<VersionedRecord>>,
        filter: Option<SourceFilter>,
    ) -> Result<Arc<CachedList>, Error> {
        let list = Arc::new(CachedList::simple(entity.clone(), records));
        self.notifications.register_list(&list, filter)?;
        Ok(list)
    }

    pub fn shutdown(&self) {
        info!(process = %self.process(), "Engine shutting down");
        self.notifications.shutdown();
    }
}
