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

//! Cached query results and the rules for when a change makes them stale.

use crate::error::Error;
use crate::notify::{ChangeEvent, EventKind, PredicateKey};
use crate::record::{PrimaryKey, VersionedRecord};
use crate::registry::EntityName;
use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListKind {
    /// A fixed set of records. Inserts can never make it stale.
    Simple,
    /// The result of a query; any insert might belong to it.
    OperationBased,
}

#[derive(Default)]
struct Contents {
    records: Vec<Arc<VersionedRecord>>,
    keys: AHashSet<PrimaryKey>,
}

impl Contents {
    fn new(records: Vec<Arc<VersionedRecord>>) -> Self {
        let keys = records.iter().map(|r| r.primary_key.clone()).collect();
        Self { records, keys }
    }
}

pub struct CachedList {
    entity: EntityName,
    predicate: Option<PredicateKey>,
    kind: ListKind,
    contents: RwLock<Contents>,
    stale: AtomicBool,
    /// The entity's update count when the contents were computed.
    computed_at: AtomicU64,
}

impl CachedList {
    pub fn simple(entity: EntityName, records: Vec<Arc<VersionedRecord>>) -> Self {
        Self {
            entity,
            predicate: None,
            kind: ListKind::Simple,
            contents: RwLock::new(Contents::new(records)),
            stale: AtomicBool::new(false),
            computed_at: AtomicU64::new(0),
        }
    }

    pub fn operation_based(
        entity: EntityName,
        predicate: PredicateKey,
        records: Vec<Arc<VersionedRecord>>,
        update_count: u64,
    ) -> Self {
        Self {
            entity,
            predicate: Some(predicate),
            kind: ListKind::OperationBased,
            contents: RwLock::new(Contents::new(records)),
            stale: AtomicBool::new(false),
            computed_at: AtomicU64::new(update_count),
        }
    }

    pub fn entity(&self) -> &EntityName {
        &self.entity
    }

    pub fn predicate(&self) -> Option<&PredicateKey> {
        self.predicate.as_ref()
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn members(&self) -> Vec<Arc<VersionedRecord>> {
        self.contents.read().records.clone()
    }

    pub fn len(&self) -> usize {
        self.contents.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_any(&self, keys: &[PrimaryKey]) -> bool {
        let contents = self.contents.read();
        keys.iter().any(|k| contents.keys.contains(k))
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Stale by notification, or, for query results, because the entity changed since the
    /// contents were computed (covers commits whose events are still queued).
    pub fn is_stale_at(&self, update_count: u64) -> bool {
        self.is_stale()
            || (self.kind == ListKind::OperationBased
                && self.computed_at.load(Ordering::Acquire) != update_count)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub(crate) fn refresh(&self, records: Vec<Arc<VersionedRecord>>, update_count: u64) {
        *self.contents.write() = Contents::new(records);
        self.computed_at.store(update_count, Ordering::Release);
        self.stale.store(false, Ordering::Release);
    }

    /// Whether `event` can change what this list should contain.
    pub fn is_affected_by(&self, event: &ChangeEvent) -> bool {
        match event.kind {
            EventKind::Insert => self.kind == ListKind::OperationBased,
            EventKind::Update | EventKind::Delete => self.contains_any(&event.keys),
            EventKind::MassDelete => true,
        }
    }
}

/// An entity's cached query results, keyed by predicate.
#[derive(Default)]
pub struct QueryCache {
    lists: Mutex<AHashMap<PredicateKey, Arc<CachedList>>>,
}

impl QueryCache {
    pub fn get(&self, predicate: &PredicateKey) -> Option<Arc<CachedList>> {
        self.lists.lock().get(predicate).cloned()
    }

    /// The list for `predicate`, (re)computing it if absent or stale. The flag is true when the
    /// list was newly created and still needs a subscription.
    pub fn get_or_compute(
        &self,
        entity: &EntityName,
        predicate: &PredicateKey,
        update_count: u64,
        compute: impl FnOnce() -> Result<Vec<Arc<VersionedRecord>>, Error>,
    ) -> Result<(Arc<CachedList>, bool), Error> {
        match self.get(predicate) {
            Some(list) if !list.is_stale_at(update_count) => Ok((list, false)),
            Some(list) => {
                list.refresh(compute()?, update_count);
                Ok((list, false))
            }
            None => {
                let list = Arc::new(CachedList::operation_based(
                    entity.clone(),
                    predicate.clone(),
                    compute()?,
                    update_count,
                ));
                self.lists.lock().insert(predicate.clone(), list.clone());
                Ok((list, true))
            }
        }
    }

    pub fn remove(&self, predicate: &PredicateKey) -> Option<Arc<CachedList>> {
        self.lists.lock().remove(predicate)
    }

    pub fn len(&self) -> usize {
        self.lists.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
