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

use crate::engine::Engine;
use crate::error::Error;
use crate::index::TemporalIndex;
use crate::lock::Upgrade;
use crate::notify::PredicateKey;
use crate::record::{
    AsOf, Payload, PrimaryKey, TemporalShape, TimeRange, Timestamp, Value, VersionToken,
    VersionedRecord,
};
use crate::registry::{EntityCache, EntityName};
use crate::tx::milestone::{self, Refusal};
use crate::tx::write_buffer::{PendingWrite, WriteBuffer};
use crate::tx::{Isolation, TxId, TxOptions, TxState};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// What a successful commit did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub tx: TxId,
    /// None for read-only transactions, which never reach the provider.
    pub commit_time: Option<Timestamp>,
    pub mutations: usize,
    pub events: usize,
}

/// A unit of work against the engine. Owned by the thread that began it.
///
/// Reads record the version they observed; writes are buffered per key and only reach the index
/// at commit. Dropping an uncommitted transaction rolls it back.
pub struct Transaction {
    pub(super) id: TxId,
    /// Wait-die age. Retries keep the id of the first attempt so they are not starved.
    pub(super) priority: TxId,
    pub(super) engine: Arc<Engine>,
    pub(super) options: TxOptions,
    pub(super) state: TxState,
    pub(super) started: minstant::Instant,
    pub(super) deadline: Option<Instant>,
    pub(super) reads: AHashMap<(EntityName, PrimaryKey), Option<VersionToken>>,
    pub(super) writes: WriteBuffer,
    pub(super) held_keys: AHashSet<(EntityName, PrimaryKey)>,
    pub(super) provider_touched: bool,
    pub(super) mass_delete: Option<(EntityName, PredicateKey)>,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<Engine>, id: TxId, priority: TxId, options: TxOptions) -> Self {
        let timeout = options.timeout.or(engine.config().transaction_timeout);
        Self {
            id,
            priority,
            engine,
            options,
            state: TxState::Active,
            started: minstant::Instant::now(),
            deadline: timeout.map(|t| Instant::now() + t),
            reads: AHashMap::new(),
            writes: WriteBuffer::default(),
            held_keys: AHashSet::new(),
            provider_touched: false,
            mass_delete: None,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// Wait-die age; equals `id` unless this is a retry.
    pub fn priority(&self) -> TxId {
        self.priority
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn options(&self) -> &TxOptions {
        &self.options
    }

    /// Number of keys with buffered writes.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn pending(&self, entity: &EntityName, key: &PrimaryKey) -> Option<&PendingWrite> {
        self.writes.get(entity, key)
    }

    pub fn isolation(&self, cache: &EntityCache) -> Isolation {
        self.options
            .isolation
            .get(cache.name())
            .copied()
            .or(cache.def().isolation)
            .unwrap_or(self.engine.config().default_isolation)
    }

    pub(super) fn check_deadline(&self) -> Result<(), Error> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout(self.id)),
            _ => Ok(()),
        }
    }

    fn check_active(&mut self) -> Result<(), Error> {
        if self.state != TxState::Active {
            return Err(Error::InvalidState(format!("{} is {}", self.id, self.state)));
        }
        if let Err(e) = self.check_deadline() {
            self.abort();
            return Err(e);
        }
        Ok(())
    }

    /// Abort, then hand back `e`. Used for errors that poison the transaction.
    fn fail(&mut self, e: Error) -> Error {
        self.abort();
        e
    }

    pub(super) fn abort(&mut self) {
        if matches!(self.state, TxState::Committed | TxState::Aborted) {
            return;
        }
        debug!(tx = %self.id, from = %self.state, "Aborting transaction");
        if self.provider_touched {
            self.engine.provider().rollback(self.id);
        }
        self.writes.clear();
        self.release_locks();
        self.state = TxState::Aborted;
    }

    pub(super) fn release_locks(&mut self) {
        if self.held_keys.is_empty() {
            return;
        }
        let keys: Vec<_> = self.held_keys.drain().collect();
        self.engine.key_locks().release_all(self.priority, &keys);
    }

    fn cache(&self, entity: &EntityName) -> Result<Arc<EntityCache>, Error> {
        self.engine.registry().get(entity)
    }

    fn lock_key(
        &mut self,
        cache: &EntityCache,
        key: &PrimaryKey,
        isolation: Isolation,
    ) -> Result<(), Error> {
        if isolation != Isolation::FullParticipation {
            return Ok(());
        }
        let lock_key = (cache.name().clone(), key.clone());
        if self.held_keys.contains(&lock_key) {
            return Ok(());
        }
        match self
            .engine
            .key_locks()
            .acquire(self.priority, cache.name(), key, self.deadline)
        {
            Ok(()) => {
                self.held_keys.insert(lock_key);
                Ok(())
            }
            Err(Error::Timeout(_)) => Err(self.fail(Error::Timeout(self.id))),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn record_read(
        &mut self,
        entity: &EntityName,
        key: &PrimaryKey,
        version: Option<VersionToken>,
        isolation: Isolation,
    ) {
        if isolation == Isolation::NoLocking {
            return;
        }
        self.reads
            .entry((entity.clone(), key.clone()))
            .or_insert(version);
    }

    /// Run `f` against the index with `key` resident, loading it from the provider on a miss.
    fn with_resident<R>(
        &mut self,
        cache: &EntityCache,
        key: &PrimaryKey,
        f: impl Fn(&TemporalIndex) -> R,
    ) -> Result<R, Error> {
        let Some(guard) = cache.index().read_until(self.deadline) else {
            return Err(self.fail(Error::Timeout(self.id)));
        };
        if guard.contains_key(key) {
            return Ok(f(&guard));
        }

        let loaded = match self.engine.provider().load_by_key(cache.name(), key) {
            Ok(loaded) => loaded,
            Err(e) => {
                drop(guard);
                return Err(e);
            }
        };
        let Some((mut writer, how)) = guard.upgrade_until(self.deadline) else {
            return Err(self.fail(Error::Timeout(self.id)));
        };
        if how == Upgrade::Reacquired && writer.contains_key(key) {
            trace!(entity = %cache.name(), %key, "Key loaded while upgrading");
        } else {
            trace!(entity = %cache.name(), %key, rows = loaded.len(), "Loaded key from provider");
            for record in loaded {
                writer.put_semi_unique(record);
            }
            for overlap in writer.collect_milestoning_overlaps() {
                warn!(entity = %cache.name(), key = %overlap.key, rows = overlap.records.len(),
                    "Overlapping rows loaded from provider");
            }
        }
        let reader = writer.downgrade();
        Ok(f(&reader))
    }

    /// The record of `key` as of `as_of`, seeing this transaction's own writes.
    pub fn find(
        &mut self,
        entity: &EntityName,
        key: &PrimaryKey,
        as_of: AsOf,
    ) -> Result<Option<Arc<VersionedRecord>>, Error> {
        self.check_active()?;
        let cache = self.cache(entity)?;
        let as_of = cache.shape().normalize(as_of);
        if as_of.system.is_infinity()
            && let Some(pending) = self.writes.get(entity, key)
        {
            return Ok(pending.find(as_of).map(Arc::new));
        }

        let isolation = self.isolation(&cache);
        self.lock_key(&cache, key, isolation)?;
        let (record, version) = self.with_resident(&cache, key, |index| {
            (index.get(key, as_of), index.key_version(key))
        })?;
        self.record_read(entity, key, version, isolation);
        Ok(record)
    }

    /// Latest business state as currently known.
    pub fn find_current(
        &mut self,
        entity: &EntityName,
        key: &PrimaryKey,
    ) -> Result<Option<Arc<VersionedRecord>>, Error> {
        self.find(entity, key, AsOf::current())
    }

    pub fn find_all(
        &mut self,
        entity: &EntityName,
        keys: &[PrimaryKey],
        as_of: AsOf,
    ) -> Result<Vec<Arc<VersionedRecord>>, Error> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.find(entity, key, as_of)? {
                found.push(record);
            }
        }
        Ok(found)
    }

    /// Add a record obtained outside this transaction to the read set, at the version it carries.
    pub fn observe(&mut self, entity: &EntityName, record: &VersionedRecord) -> Result<(), Error> {
        self.check_active()?;
        let cache = self.cache(entity)?;
        let isolation = self.isolation(&cache);
        let key = &record.primary_key;
        self.lock_key(&cache, key, isolation)?;
        self.with_resident(&cache, key, |_| ())?;
        self.record_read(entity, key, Some(record.version), isolation);
        Ok(())
    }

    /// The pending write for `key`, creating it from the key's current records on first touch.
    fn pending_mut(
        &mut self,
        cache: &EntityCache,
        key: &PrimaryKey,
    ) -> Result<&mut PendingWrite, Error> {
        let entity = cache.name();
        if !self.writes.contains(entity, key) {
            let isolation = self.isolation(cache);
            self.lock_key(cache, key, isolation)?;
            let (original, version) = self.with_resident(cache, key, |index| {
                (index.current_versions(key), index.key_version(key))
            })?;
            self.record_read(entity, key, version, isolation);
            self.writes.insert(PendingWrite::new(
                entity.clone(),
                key.clone(),
                cache.shape(),
                cache.def().versioning,
                original,
                version,
            ));
        }
        self.writes
            .get_mut(entity, key)
            .ok_or_else(|| Error::InvalidState(format!("pending write for {entity}{key} vanished")))
    }

    fn mutate(
        &mut self,
        entity: &EntityName,
        key: &PrimaryKey,
        op: impl FnOnce(TemporalShape, &mut PendingWrite) -> Result<(), Refusal>,
    ) -> Result<(), Error> {
        self.check_active()?;
        let cache = self.cache(entity)?;
        let shape = cache.shape();
        let pending = self.pending_mut(&cache, key)?;
        match op(shape, pending) {
            Ok(()) => {
                pending.touch(Timestamp::now());
                Ok(())
            }
            Err(Refusal::Duplicate) => Err(Error::Duplicate {
                entity: entity.clone(),
                key: key.clone(),
            }),
            Err(Refusal::NotFound) => Err(Error::NotFound {
                entity: entity.clone(),
                key: key.clone(),
            }),
        }
    }

    fn check_business_date(&self, entity: &EntityName, at: Timestamp) -> Result<(), Error> {
        if at.is_infinity() {
            return Err(Error::InvalidState(format!(
                "{entity}: business date must be finite"
            )));
        }
        Ok(())
    }

    /// Buffer a new record for `key`, alive from `business_from` on.
    pub fn insert(
        &mut self,
        entity: &EntityName,
        key: &PrimaryKey,
        business_from: Timestamp,
        payload: Payload,
    ) -> Result<(), Error> {
        self.check_business_date(entity, business_from)?;
        self.mutate(entity, key, |shape, pending| {
            let business = if shape.tracks_business() {
                TimeRange::open(business_from)
            } else {
                TimeRange::all()
            };
            let record = VersionedRecord::new(
                key.clone(),
                business,
                pending.provisional_system(),
                payload,
                pending.version.unwrap_or(VersionToken::Counter(0)),
            );
            milestone::insert(shape, &mut pending.current, record)
        })
    }

    /// Overlay `changes` on the payload from `business_from` until infinity.
    pub fn update(
        &mut self,
        entity: &EntityName,
        key: &PrimaryKey,
        business_from: Timestamp,
        changes: Payload,
    ) -> Result<(), Error> {
        self.check_business_date(entity, business_from)?;
        self.mutate(entity, key, |shape, pending| {
            milestone::update_from(shape, &mut pending.current, business_from, |p| {
                p.merge(&changes)
            })
        })
    }

    pub fn set_attribute(
        &mut self,
        entity: &EntityName,
        key: &PrimaryKey,
        business_from: Timestamp,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Result<(), Error> {
        self.update(
            entity,
            key,
            business_from,
            Payload::new().with(attribute, value),
        )
    }

    /// End the business life of `key` at `at`. Entities without a business axis lose the row.
    pub fn terminate(
        &mut self,
        entity: &EntityName,
        key: &PrimaryKey,
        at: Timestamp,
    ) -> Result<(), Error> {
        self.mutate(entity, key, |shape, pending| {
            milestone::terminate_at(shape, &mut pending.current, at)
        })
    }

    /// Remove the key's current state. Dated history stays; see [`purge`](Self::purge).
    pub fn delete(&mut self, entity: &EntityName, key: &PrimaryKey) -> Result<(), Error> {
        self.mutate(entity, key, |_, pending| milestone::clear(&mut pending.current))
    }

    /// Physically remove every version of `key`, history included.
    pub fn purge(&mut self, entity: &EntityName, key: &PrimaryKey) -> Result<(), Error> {
        self.mutate(entity, key, |_, pending| {
            pending.current.clear();
            pending.purged = true;
            Ok(())
        })
    }

    /// Report deletes of `entity` as a single mass-delete event for `predicate` instead of one
    /// event per row.
    pub fn mark_mass_delete(&mut self, entity: &EntityName, predicate: PredicateKey) {
        self.mass_delete = Some((entity.clone(), predicate));
    }

    /// Hand buffered writes to the provider now. Later changes in this transaction bump versions
    /// again.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.check_active()?;
        let at = self.engine.clock().tick();
        let mut mutations = vec![];
        for pending in self.writes.iter_mut().filter(|p| p.needs_write()) {
            let entity = pending.entity.clone();
            mutations.extend(pending.materialize(at).into_iter().map(|m| (entity.clone(), m)));
        }
        if mutations.is_empty() {
            return Ok(());
        }
        debug!(tx = %self.id, count = mutations.len(), "Flushing writes to provider");
        self.provider_touched = true;
        if let Err(e) = self.engine.provider().write(self.id, &mutations) {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Validate and apply. On any error the transaction is rolled back.
    pub fn commit(mut self) -> Result<CommitOutcome, Error> {
        self.check_active()?;
        self.state = TxState::Committing;
        let result = self.commit_inner();
        match &result {
            Ok(outcome) => {
                trace!(tx = %self.id, mutations = outcome.mutations, "Committed");
                self.state = TxState::Committed;
                self.release_locks();
            }
            Err(e) => {
                if e.conflict_info().is_some() {
                    self.state = TxState::ConflictDetected;
                }
                debug!(tx = %self.id, error = %e, "Commit failed");
                self.abort();
            }
        }
        result
    }

    pub fn rollback(mut self) {
        self.abort();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort();
    }
}
