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

//! The persistence seam. The engine writes through to a [`Provider`] before it touches the index,
//! and falls back to it on cache misses.

use crate::error::Error;
use crate::record::{PrimaryKey, Timestamp, VersionedRecord};
use crate::registry::EntityName;
use crate::tx::TxId;
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// One physical change to the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Insert(VersionedRecord),
    /// Close the system range of an existing row. The row itself stays, as history.
    Inactivate {
        key: PrimaryKey,
        business_from: Timestamp,
        system_from: Timestamp,
        at: Timestamp,
    },
    /// Physically remove one row.
    Delete {
        key: PrimaryKey,
        business_from: Timestamp,
        system_from: Timestamp,
    },
    /// Physically remove every row of a key.
    Purge { key: PrimaryKey },
}

impl Mutation {
    pub fn key(&self) -> &PrimaryKey {
        match self {
            Mutation::Insert(r) => &r.primary_key,
            Mutation::Inactivate { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Purge { key } => key,
        }
    }
}

pub trait Provider: Send + Sync {
    /// Every stored version of `key`, historical ones included.
    fn load_by_key(&self, entity: &EntityName, key: &PrimaryKey)
    -> Result<Vec<VersionedRecord>, Error>;

    /// Every stored version of every key within the bounds.
    fn load_by_range(
        &self,
        entity: &EntityName,
        from: Bound<&PrimaryKey>,
        to: Bound<&PrimaryKey>,
    ) -> Result<Vec<VersionedRecord>, Error>;

    /// Stage mutations for `tx`. May be called several times before `commit` (flushes).
    fn write(&self, tx: TxId, mutations: &[(EntityName, Mutation)]) -> Result<(), Error>;

    /// Make everything staged for `tx` durable and visible.
    fn commit(&self, tx: TxId) -> Result<(), Error>;

    /// Discard everything staged for `tx`. Unknown transactions are ignored.
    fn rollback(&self, tx: TxId);
}

type Slot = (PrimaryKey, Timestamp, Timestamp);
type Table = BTreeMap<Slot, VersionedRecord>;

/// A provider that keeps tables in memory, with hooks to inject latency and failures.
#[derive(Default)]
pub struct MemoryProvider {
    tables: RwLock<AHashMap<EntityName, Table>>,
    staged: Mutex<AHashMap<TxId, Vec<(EntityName, Mutation)>>>,
    commit_delay: Option<Duration>,
    /// Zero-based index of the commit call that should fail, if any.
    fail_commit_at: Mutex<Option<usize>>,
    commits: AtomicUsize,
    loads: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every commit sleeps for `delay` first.
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    /// Make the `n`th commit from now (zero-based, counting all commits so far) fail.
    pub fn fail_commit_at(&self, n: usize) {
        *self.fail_commit_at.lock() = Some(n);
    }

    /// Seed rows directly, bypassing transactions.
    pub fn seed(&self, entity: &EntityName, records: impl IntoIterator<Item = VersionedRecord>) {
        let mut tables = self.tables.write();
        let table = tables.entry(entity.clone()).or_default();
        for r in records {
            table.insert(slot_of(&r), r);
        }
    }

    /// Every row of an entity, ordered by slot.
    pub fn rows(&self, entity: &EntityName) -> Vec<VersionedRecord> {
        self.tables
            .read()
            .get(entity)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Rows whose system range is still open.
    pub fn current_rows(&self, entity: &EntityName) -> Vec<VersionedRecord> {
        let mut rows = self.rows(entity);
        rows.retain(|r| r.is_processing_current());
        rows
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn staged_transactions(&self) -> usize {
        self.staged.lock().len()
    }

    fn apply(table: &mut Table, mutation: Mutation) -> Result<(), Error> {
        match mutation {
            Mutation::Insert(r) => {
                table.insert(slot_of(&r), r);
            }
            Mutation::Inactivate {
                key,
                business_from,
                system_from,
                at,
            } => {
                let row = table
                    .get_mut(&(key.clone(), business_from, system_from))
                    .ok_or_else(|| {
                        Error::Provider(format!("no row {key} at {business_from}/{system_from}"))
                    })?;
                // Closing twice would rewrite history someone else already milestoned.
                if row.is_processing_current() {
                    row.system = row.system.closed_at(at);
                }
            }
            Mutation::Delete {
                key,
                business_from,
                system_from,
            } => {
                table.remove(&(key, business_from, system_from));
            }
            Mutation::Purge { key } => {
                table.retain(|(k, _, _), _| *k != key);
            }
        }
        Ok(())
    }
}

fn slot_of(r: &VersionedRecord) -> Slot {
    (r.primary_key.clone(), r.business.from, r.system.from)
}

impl Provider for MemoryProvider {
    fn load_by_key(
        &self,
        entity: &EntityName,
        key: &PrimaryKey,
    ) -> Result<Vec<VersionedRecord>, Error> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read();
        let Some(table) = tables.get(entity) else {
            return Ok(vec![]);
        };
        let lo = (key.clone(), Timestamp::MIN, Timestamp::MIN);
        let hi = (key.clone(), Timestamp::INFINITY, Timestamp::INFINITY);
        Ok(table.range(lo..=hi).map(|(_, r)| r.clone()).collect())
    }

    fn load_by_range(
        &self,
        entity: &EntityName,
        from: Bound<&PrimaryKey>,
        to: Bound<&PrimaryKey>,
    ) -> Result<Vec<VersionedRecord>, Error> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read();
        let Some(table) = tables.get(entity) else {
            return Ok(vec![]);
        };
        let bounds = (from, to);
        Ok(table
            .values()
            .filter(|r| bounds.contains(&r.primary_key))
            .cloned()
            .collect())
    }

    fn write(&self, tx: TxId, mutations: &[(EntityName, Mutation)]) -> Result<(), Error> {
        debug!(%tx, count = mutations.len(), "Staging mutations");
        self.staged
            .lock()
            .entry(tx)
            .or_default()
            .extend(mutations.iter().cloned());
        Ok(())
    }

    fn commit(&self, tx: TxId) -> Result<(), Error> {
        if let Some(delay) = self.commit_delay {
            std::thread::sleep(delay);
        }
        let n = self.commits.fetch_add(1, Ordering::AcqRel);
        let staged = self.staged.lock().remove(&tx).unwrap_or_default();
        if *self.fail_commit_at.lock() == Some(n) {
            warn!(%tx, "Injected commit failure");
            return Err(Error::Provider(format!("injected failure on commit #{n}")));
        }
        // Validate everything against a scratch copy first so a bad mutation leaves no trace.
        let mut tables = self.tables.write();
        let mut scratch = tables.clone();
        for (entity, mutation) in staged {
            Self::apply(scratch.entry(entity).or_default(), mutation)?;
        }
        *tables = scratch;
        Ok(())
    }

    fn rollback(&self, tx: TxId) {
        self.staged.lock().remove(&tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Payload, TimeRange, VersionToken};

    fn row(key: i64, system_from: i64) -> VersionedRecord {
        VersionedRecord::new(
            PrimaryKey::from(key),
            TimeRange::all(),
            TimeRange::open(Timestamp(system_from)),
            Payload::new(),
            VersionToken::Counter(1),
        )
    }

    #[test]
    fn test_staged_writes_invisible_until_commit() {
        let p = MemoryProvider::new();
        let e = EntityName::from("e");
        p.write(TxId(1), &[(e.clone(), Mutation::Insert(row(1, 0)))])
            .unwrap();
        assert!(p.load_by_key(&e, &PrimaryKey::from(1)).unwrap().is_empty());
        p.commit(TxId(1)).unwrap();
        assert_eq!(p.load_by_key(&e, &PrimaryKey::from(1)).unwrap().len(), 1);

        p.write(TxId(2), &[(e.clone(), Mutation::Purge { key: PrimaryKey::from(1) })])
            .unwrap();
        p.rollback(TxId(2));
        assert_eq!(p.staged_transactions(), 0);
        assert_eq!(p.rows(&e).len(), 1);
    }

    #[test]
    fn test_inactivate_and_range_load() {
        let p = MemoryProvider::new();
        let e = EntityName::from("e");
        p.seed(&e, (1..=5).map(|k| row(k, 0)));
        p.write(
            TxId(1),
            &[(
                e.clone(),
                Mutation::Inactivate {
                    key: PrimaryKey::from(2),
                    business_from: Timestamp::MIN,
                    system_from: Timestamp(0),
                    at: Timestamp(10),
                },
            )],
        )
        .unwrap();
        p.commit(TxId(1)).unwrap();
        assert_eq!(p.current_rows(&e).len(), 4);

        let from = PrimaryKey::from(2);
        let to = PrimaryKey::from(4);
        let loaded = p
            .load_by_range(&e, Bound::Included(&from), Bound::Excluded(&to))
            .unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_failed_commit_applies_nothing() {
        let p = MemoryProvider::new();
        let e = EntityName::from("e");
        p.fail_commit_at(0);
        p.write(TxId(1), &[(e.clone(), Mutation::Insert(row(1, 0)))])
            .unwrap();
        assert!(p.commit(TxId(1)).is_err());
        assert!(p.rows(&e).is_empty());

        // A mutation against a missing row aborts the whole commit.
        p.write(
            TxId(2),
            &[
                (e.clone(), Mutation::Insert(row(1, 0))),
                (
                    e.clone(),
                    Mutation::Inactivate {
                        key: PrimaryKey::from(9),
                        business_from: Timestamp::MIN,
                        system_from: Timestamp(0),
                        at: Timestamp(1),
                    },
                ),
            ],
        )
        .unwrap();
        assert!(p.commit(TxId(2)).is_err());
        assert!(p.rows(&e).is_empty());
    }
}
