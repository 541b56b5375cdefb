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

//! Per-entity temporal index: primary key → short sorted history of versioned records.

mod history;

pub use history::{KeyHistory, OverlapSet};

use crate::error::Error;
use crate::offheap::{BlockStore, ReadPin};
use crate::record::{AsOf, PrimaryKey, TemporalShape, Timestamp, VersionToken, VersionedRecord};
use crate::registry::EntityName;
use imbl::{OrdMap, OrdSet};
use std::sync::Arc;

/// The resident records of one entity type.
///
/// Backed by persistent maps, so [`fork`](Self::fork) is a constant-time snapshot. A fork shares
/// the off-heap blocks of archived versions, which stay allocated until neither side refers to
/// them.
#[derive(Debug, Clone)]
pub struct TemporalIndex {
    entity: EntityName,
    shape: TemporalShape,
    entries: OrdMap<PrimaryKey, KeyHistory>,
    /// Where versions closed on the processing axis are archived, if anywhere.
    blocks: Option<Arc<BlockStore>>,
    /// Keys touched by `put_semi_unique` since the last milestoning scan.
    pending_validation: OrdSet<PrimaryKey>,
    record_count: usize,
}

impl TemporalIndex {
    pub fn new(entity: EntityName, shape: TemporalShape) -> Self {
        Self {
            entity,
            shape,
            entries: OrdMap::new(),
            blocks: None,
            pending_validation: OrdSet::new(),
            record_count: 0,
        }
    }

    /// An index that moves superseded versions into `blocks`.
    pub fn with_block_store(
        entity: EntityName,
        shape: TemporalShape,
        blocks: Arc<BlockStore>,
    ) -> Self {
        Self {
            blocks: Some(blocks),
            ..Self::new(entity, shape)
        }
    }

    pub fn block_store(&self) -> Option<&Arc<BlockStore>> {
        self.blocks.as_ref()
    }

    fn pin(&self) -> Option<ReadPin> {
        self.blocks.as_ref().map(|b| b.pin())
    }

    pub fn entity(&self) -> &EntityName {
        &self.entity
    }

    pub fn shape(&self) -> TemporalShape {
        self.shape
    }

    pub fn get(&self, key: &PrimaryKey, as_of: AsOf) -> Option<Arc<VersionedRecord>> {
        let as_of = self.shape.normalize(as_of);
        let pin = self.pin();
        self.entries.get(key)?.find(as_of, pin.as_ref())
    }

    pub fn get_current(
        &self,
        key: &PrimaryKey,
        business: Timestamp,
    ) -> Option<Arc<VersionedRecord>> {
        self.get(key, AsOf::at(business))
    }

    pub fn contains_key(&self, key: &PrimaryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn history(&self, key: &PrimaryKey) -> Vec<Arc<VersionedRecord>> {
        let pin = self.pin();
        self.entries
            .get(key)
            .map(|h| h.all(pin.as_ref()))
            .unwrap_or_default()
    }

    /// Versions of the whole index currently held off-heap.
    pub fn archived_count(&self) -> usize {
        self.entries.values().map(|h| h.archived_len()).sum()
    }

    /// The processing-current records of a key, in business order.
    pub fn current_versions(&self, key: &PrimaryKey) -> Vec<Arc<VersionedRecord>> {
        self.entries
            .get(key)
            .map(|h| h.current().cloned().collect())
            .unwrap_or_default()
    }

    /// The version token a reader of this key observes right now.
    pub fn key_version(&self, key: &PrimaryKey) -> Option<VersionToken> {
        self.entries.get(key)?.version()
    }

    /// Insert a record. A record in the same slot is replaced and returned. A current record
    /// overlapping another current record of the same key is refused.
    pub fn put(&mut self, record: VersionedRecord) -> Result<Option<Arc<VersionedRecord>>, Error> {
        self.put_arc(Arc::new(record))
    }

    pub fn put_arc(
        &mut self,
        record: Arc<VersionedRecord>,
    ) -> Result<Option<Arc<VersionedRecord>>, Error> {
        if record.is_processing_current()
            && let Some(history) = self.entries.get(&record.primary_key)
            && history.conflicts_with(&record)
        {
            return Err(Error::Overlap {
                entity: self.entity.clone(),
                key: record.primary_key.clone(),
            });
        }
        Ok(self.insert_unchecked(record))
    }

    /// Insert without the overlap check, deferring validation of the key to
    /// [`collect_milestoning_overlaps`](Self::collect_milestoning_overlaps).
    pub fn put_semi_unique(&mut self, record: VersionedRecord) -> Option<Arc<VersionedRecord>> {
        self.pending_validation.insert(record.primary_key.clone());
        self.insert_unchecked(Arc::new(record))
    }

    fn insert_unchecked(&mut self, record: Arc<VersionedRecord>) -> Option<Arc<VersionedRecord>> {
        let pin = self.pin();
        let blocks = self.blocks.as_deref();
        let history = self
            .entries
            .entry(record.primary_key.clone())
            .or_insert_with(KeyHistory::default);
        let before = history.len();
        let replaced = history.insert(record, blocks, pin.as_ref());
        self.record_count = self.record_count + history.len() - before;
        replaced
    }

    /// Physically remove the record occupying `record`'s slot.
    pub fn remove(&mut self, record: &VersionedRecord) -> Option<Arc<VersionedRecord>> {
        let pin = self.pin();
        let history = self.entries.get_mut(&record.primary_key)?;
        let before = history.len();
        let removed = history.remove_slot(record.slot(), pin.as_ref());
        self.record_count -= before - history.len();
        if history.is_empty() {
            self.entries.remove(&record.primary_key);
        }
        removed
    }

    /// Physically remove every version of `key`.
    pub fn remove_key(&mut self, key: &PrimaryKey) -> Vec<Arc<VersionedRecord>> {
        self.pending_validation.remove(key);
        let Some(history) = self.entries.remove(key) else {
            return vec![];
        };
        self.record_count -= history.len();
        let pin = self.pin();
        history.all(pin.as_ref())
    }

    /// Drop everything resident. Subsequent lookups fall through to the provider.
    pub fn clear(&mut self) {
        self.entries = OrdMap::new();
        self.pending_validation = OrdSet::new();
        self.record_count = 0;
    }

    /// Full data-quality scan.
    pub fn collect_overlaps(&self) -> Vec<OverlapSet> {
        let pin = self.pin();
        self.entries
            .iter()
            .filter_map(|(key, history)| overlap_set(key, history, pin.as_ref()))
            .collect()
    }

    /// Scan only the keys loaded through `put_semi_unique` since the previous call.
    pub fn collect_milestoning_overlaps(&mut self) -> Vec<OverlapSet> {
        let pending = std::mem::take(&mut self.pending_validation);
        let pin = self.pin();
        pending
            .iter()
            .filter_map(|key| overlap_set(key, self.entries.get(key)?, pin.as_ref()))
            .collect()
    }

    pub fn pending_validation_count(&self) -> usize {
        self.pending_validation.len()
    }

    /// Number of resident records, across all keys.
    pub fn len(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PrimaryKey> {
        self.entries.keys()
    }

    pub fn iter_current(&self) -> impl Iterator<Item = &Arc<VersionedRecord>> {
        self.entries.values().flat_map(|h| h.current())
    }

    pub fn fork(&self) -> Self {
        self.clone()
    }
}

fn overlap_set(
    key: &PrimaryKey,
    history: &KeyHistory,
    pin: Option<&ReadPin>,
) -> Option<OverlapSet> {
    let records = history.overlapping(pin);
    (!records.is_empty()).then(|| OverlapSet {
        key: key.clone(),
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Axis, Payload, TimeRange, Value};

    fn ts(ms: i64) -> Timestamp {
        Timestamp(ms)
    }

    fn rec(key: i64, business: TimeRange, system: TimeRange, qty: i64) -> VersionedRecord {
        VersionedRecord::new(
            PrimaryKey::from(key),
            business,
            system,
            Payload::new().with("qty", qty),
            VersionToken::Counter(1),
        )
    }

    fn bitemporal() -> TemporalIndex {
        TemporalIndex::new(EntityName::from("position"), TemporalShape::Bitemporal)
    }

    #[test]
    fn test_point_lookup_across_history() {
        let mut index = bitemporal();
        // Known [0, 100) in system time, then corrected from 100 on.
        index
            .put(rec(1, TimeRange::open(ts(0)), TimeRange::new(ts(0), ts(100)), 10))
            .unwrap();
        index
            .put(rec(1, TimeRange::open(ts(0)), TimeRange::open(ts(100)), 20))
            .unwrap();

        let as_known_at_50 = index.get(&PrimaryKey::from(1), AsOf::bitemporal(ts(10), ts(50)));
        assert_eq!(as_known_at_50.unwrap().payload.get("qty"), Some(&Value::Int(10)));
        let current = index.get_current(&PrimaryKey::from(1), ts(10)).unwrap();
        assert_eq!(current.payload.get("qty"), Some(&Value::Int(20)));
        assert_eq!(index.history(&PrimaryKey::from(1)).len(), 2);
        assert_eq!(index.current_versions(&PrimaryKey::from(1)).len(), 1);
        assert!(index.get(&PrimaryKey::from(2), AsOf::current()).is_none());
    }

    #[test]
    fn test_put_rejects_current_overlap() {
        let mut index = bitemporal();
        index
            .put(rec(1, TimeRange::new(ts(0), ts(50)), TimeRange::open(ts(0)), 1))
            .unwrap();
        // Adjacent business range is fine.
        index
            .put(rec(1, TimeRange::open(ts(50)), TimeRange::open(ts(0)), 2))
            .unwrap();
        let err = index
            .put(rec(1, TimeRange::open(ts(25)), TimeRange::open(ts(5)), 3))
            .unwrap_err();
        assert!(matches!(err, Error::Overlap { .. }));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_put_same_slot_replaces() {
        let mut index = bitemporal();
        index
            .put(rec(1, TimeRange::open(ts(0)), TimeRange::open(ts(0)), 1))
            .unwrap();
        let replaced = index
            .put(rec(1, TimeRange::open(ts(0)), TimeRange::new(ts(0), ts(9)), 1))
            .unwrap();
        assert!(replaced.unwrap().is_processing_current());
        assert_eq!(index.len(), 1);
        assert!(index.key_version(&PrimaryKey::from(1)).is_none());
    }

    #[test]
    fn test_semi_unique_defers_validation() {
        let mut index = bitemporal();
        index.put_semi_unique(rec(1, TimeRange::open(ts(0)), TimeRange::open(ts(0)), 1));
        index.put_semi_unique(rec(1, TimeRange::open(ts(10)), TimeRange::open(ts(0)), 2));
        index.put_semi_unique(rec(2, TimeRange::open(ts(0)), TimeRange::open(ts(0)), 3));
        assert_eq!(index.pending_validation_count(), 2);

        let overlaps = index.collect_milestoning_overlaps();
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].key, PrimaryKey::from(1));
        assert_eq!(overlaps[0].records.len(), 2);

        // The pending set is consumed; the full scan still sees the bad key.
        assert!(index.collect_milestoning_overlaps().is_empty());
        assert_eq!(index.collect_overlaps().len(), 1);
    }

    #[test]
    fn test_remove_and_fork() {
        let mut index = bitemporal();
        let r = rec(1, TimeRange::open(ts(0)), TimeRange::open(ts(0)), 1);
        index.put(r.clone()).unwrap();
        index
            .put(rec(2, TimeRange::open(ts(0)), TimeRange::open(ts(0)), 1))
            .unwrap();

        let snapshot = index.fork();
        assert!(index.remove(&r).is_some());
        assert_eq!(index.remove_key(&PrimaryKey::from(2)).len(), 1);
        assert!(index.is_empty());
        assert_eq!(index.key_count(), 0);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.keys().count(), 2);
        assert_eq!(snapshot.iter_current().count(), 2);
    }

    #[test]
    fn test_untracked_axes_ignored() {
        let mut index = TemporalIndex::new(
            EntityName::from("audit"),
            TemporalShape::UniDated(Axis::Processing),
        );
        index
            .put(rec(1, TimeRange::all(), TimeRange::new(ts(0), ts(10)), 1))
            .unwrap();
        index
            .put(rec(1, TimeRange::all(), TimeRange::open(ts(10)), 2))
            .unwrap();
        // Any business date is accepted and ignored.
        let old = index.get(&PrimaryKey::from(1), AsOf::bitemporal(ts(-5), ts(3))).unwrap();
        assert_eq!(old.payload.get("qty"), Some(&Value::Int(1)));
        let now = index.get(&PrimaryKey::from(1), AsOf::at(ts(12345))).unwrap();
        assert_eq!(now.payload.get("qty"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_block_store_archives_closed_versions() {
        let blocks = Arc::new(BlockStore::new().unwrap());
        let mut index = TemporalIndex::with_block_store(
            EntityName::from("position"),
            TemporalShape::Bitemporal,
            blocks.clone(),
        );
        let key = PrimaryKey::from(1);
        index
            .put(rec(1, TimeRange::open(ts(0)), TimeRange::open(ts(0)), 10))
            .unwrap();
        // Closing the row in place moves it off-heap.
        index
            .put(rec(1, TimeRange::open(ts(0)), TimeRange::new(ts(0), ts(100)), 10))
            .unwrap();
        index
            .put(rec(1, TimeRange::open(ts(0)), TimeRange::open(ts(100)), 20))
            .unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.archived_count(), 1);
        assert_eq!(blocks.live_blocks(), 1);

        let old = index.get(&key, AsOf::bitemporal(ts(10), ts(50))).unwrap();
        assert_eq!(old.payload.get("qty"), Some(&Value::Int(10)));
        assert_eq!(old.system, TimeRange::new(ts(0), ts(100)));
        assert_eq!(index.current_versions(&key).len(), 1);

        let removed = index.remove_key(&key);
        assert_eq!(removed.len(), 2);
        assert!(index.is_empty());
        blocks.sync();
        assert_eq!(blocks.live_blocks(), 0);
    }
}
