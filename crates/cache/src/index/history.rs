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

use crate::offheap::{BlockHandle, BlockStore, ReadPin};
use crate::record::{AsOf, PrimaryKey, TimeRange, Timestamp, VersionToken, VersionedRecord};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::warn;

/// A superseded version whose body was moved into a [`BlockStore`] block. Only its rectangle stays
/// on the heap, so lookups can skip it without decoding.
#[derive(Debug, Clone)]
struct Archived {
    business: TimeRange,
    system: TimeRange,
    handle: BlockHandle,
}

impl Archived {
    fn slot(&self) -> (Timestamp, Timestamp) {
        (self.business.from, self.system.from)
    }

    fn thaw(&self, pin: &ReadPin) -> Option<Arc<VersionedRecord>> {
        match self.handle.read(pin) {
            Ok(record) => Some(Arc::new(record)),
            Err(e) => {
                warn!(block = ?self.handle.id(), error = %e, "Unreadable archived version");
                None
            }
        }
    }
}

/// The resident versions of one primary key, kept sorted by (business.from, system.from).
///
/// Histories are short, so lookups are a linear scan. Versions closed on the processing axis may
/// live off-heap in `archived`; processing-current versions are always in `records`.
#[derive(Debug, Clone, Default)]
pub struct KeyHistory {
    records: SmallVec<[Arc<VersionedRecord>; 4]>,
    archived: SmallVec<[Archived; 2]>,
}

impl KeyHistory {
    pub fn len(&self) -> usize {
        self.records.len() + self.archived.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.archived.is_empty()
    }

    pub fn archived_len(&self) -> usize {
        self.archived.len()
    }

    /// Every version in slot order. Archived versions are decoded under `pin`.
    pub fn all(&self, pin: Option<&ReadPin>) -> Vec<Arc<VersionedRecord>> {
        let mut all: Vec<_> = self.records.iter().cloned().collect();
        if let Some(pin) = pin {
            all.extend(self.archived.iter().filter_map(|a| a.thaw(pin)));
        }
        all.sort_by_key(|r| r.slot());
        all
    }

    /// Records not yet superseded on the processing axis.
    pub fn current(&self) -> impl Iterator<Item = &Arc<VersionedRecord>> {
        self.records.iter().filter(|r| r.is_processing_current())
    }

    /// The record containing `as_of`. When bad data leaves more than one candidate, the one with
    /// the latest slot wins.
    pub fn find(&self, as_of: AsOf, pin: Option<&ReadPin>) -> Option<Arc<VersionedRecord>> {
        let heap = self.records.iter().rev().find(|r| r.contains(as_of));
        let archived = self.archived.iter().rev().find(|a| {
            a.business.contains(as_of.business) && a.system.contains(as_of.system)
        });
        match (heap, archived, pin) {
            (Some(h), Some(a), Some(pin)) if a.slot() > h.slot() => a.thaw(pin),
            (Some(h), _, _) => Some(h.clone()),
            (None, Some(a), Some(pin)) => a.thaw(pin),
            _ => None,
        }
    }

    /// The key's version: the newest token among its current records.
    pub fn version(&self) -> Option<VersionToken> {
        self.current().map(|r| r.version).max()
    }

    /// Insert keeping sort order. A record in the same slot is replaced and returned. With a block
    /// store, a version closed on the processing axis is moved off-heap.
    pub(crate) fn insert(
        &mut self,
        record: Arc<VersionedRecord>,
        blocks: Option<&BlockStore>,
        pin: Option<&ReadPin>,
    ) -> Option<Arc<VersionedRecord>> {
        let replaced = self.remove_slot(record.slot(), pin);
        let handle = match blocks {
            Some(store) if !record.is_processing_current() => match store.store(&record) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(key = %record.primary_key, error = %e, "Keeping version on heap");
                    None
                }
            },
            _ => None,
        };
        match handle {
            Some(handle) => {
                let archived = Archived {
                    business: record.business,
                    system: record.system,
                    handle,
                };
                let slot = archived.slot();
                let i = self.archived.partition_point(|a| a.slot() < slot);
                self.archived.insert(i, archived);
            }
            None => {
                let slot = record.slot();
                let i = self.records.partition_point(|r| r.slot() < slot);
                self.records.insert(i, record);
            }
        }
        replaced
    }

    /// Remove the version in `slot`. An archived one is decoded under `pin` before its handle is
    /// dropped; it is removed either way.
    pub(crate) fn remove_slot(
        &mut self,
        slot: (Timestamp, Timestamp),
        pin: Option<&ReadPin>,
    ) -> Option<Arc<VersionedRecord>> {
        if let Ok(i) = self.records.binary_search_by_key(&slot, |r| r.slot()) {
            return Some(self.records.remove(i));
        }
        let i = self
            .archived
            .binary_search_by_key(&slot, |a| a.slot())
            .ok()?;
        let archived = self.archived.remove(i);
        archived.thaw(pin?)
    }

    /// Whether `record` would overlap a current record occupying a different slot.
    pub fn conflicts_with(&self, record: &VersionedRecord) -> bool {
        let slot = record.slot();
        self.current().any(|r| r.slot() != slot && r.overlaps(record))
    }

    /// Every record that takes part in at least one overlapping pair.
    pub fn overlapping(&self, pin: Option<&ReadPin>) -> Vec<Arc<VersionedRecord>> {
        let rects: Vec<(TimeRange, TimeRange)> = self
            .records
            .iter()
            .map(|r| (r.business, r.system))
            .chain(self.archived.iter().map(|a| (a.business, a.system)))
            .collect();
        let mut hit = vec![false; rects.len()];
        for i in 0..rects.len() {
            for j in (i + 1)..rects.len() {
                if rects[i].0.overlaps(&rects[j].0) && rects[i].1.overlaps(&rects[j].1) {
                    hit[i] = true;
                    hit[j] = true;
                }
            }
        }
        let split = self.records.len();
        let mut found: Vec<_> = self
            .records
            .iter()
            .zip(&hit[..split])
            .filter_map(|(r, h)| h.then(|| r.clone()))
            .collect();
        if let Some(pin) = pin {
            found.extend(
                self.archived
                    .iter()
                    .zip(&hit[split..])
                    .filter(|(_, h)| **h)
                    .filter_map(|(a, _)| a.thaw(pin)),
            );
        }
        found.sort_by_key(|r| r.slot());
        found
    }
}

/// A data-quality finding: records of one key whose rectangles intersect.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapSet {
    pub key: PrimaryKey,
    pub records: Vec<Arc<VersionedRecord>>,
}
