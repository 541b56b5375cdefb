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

use crate::provider::Mutation;
use crate::record::{
    AsOf, PrimaryKey, TemporalShape, TimeRange, Timestamp, VersionToken, VersionedRecord,
    VersioningStrategy,
};
use crate::registry::EntityName;
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Everything a transaction has done to one key, coalesced.
///
/// `current` is the transaction's private view of the key's processing-current records. Each
/// write to the provider (a flush or the commit) closes whatever the previous write left open and
/// installs `current` afresh; `written` keeps the rows handed over so far so the commit can
/// reproduce the same history in the index.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub(crate) entity: EntityName,
    pub(crate) key: PrimaryKey,
    pub(crate) shape: TemporalShape,
    versioning: VersioningStrategy,
    /// Current records when the transaction first touched the key.
    pub(crate) original: Vec<Arc<VersionedRecord>>,
    pub(crate) original_version: Option<VersionToken>,
    pub(crate) current: Vec<VersionedRecord>,
    pub(crate) version: Option<VersionToken>,
    /// Changed since the last provider write.
    dirty: bool,
    pub(crate) purged: bool,
    pub(crate) purge_written: bool,
    pub(crate) written: Vec<VersionedRecord>,
    pub(crate) first_write_at: Option<Timestamp>,
    /// Rows another transaction committed after this one's first write; the next write closes them.
    superseded: Vec<VersionedRecord>,
    /// Rows this transaction did not write that its writes left open, being unchanged.
    pub(crate) kept: Vec<VersionedRecord>,
    /// Slots of rows it did not write that it closed, with the processing time they were closed at.
    closed: Vec<((Timestamp, Timestamp), Timestamp)>,
}

impl PendingWrite {
    pub(crate) fn new(
        entity: EntityName,
        key: PrimaryKey,
        shape: TemporalShape,
        versioning: VersioningStrategy,
        original: Vec<Arc<VersionedRecord>>,
        original_version: Option<VersionToken>,
    ) -> Self {
        let current = original.iter().map(|r| VersionedRecord::clone(r)).collect();
        Self {
            entity,
            key,
            shape,
            versioning,
            original,
            original_version,
            current,
            version: original_version,
            dirty: false,
            purged: false,
            purge_written: false,
            written: vec![],
            first_write_at: None,
            superseded: vec![],
            kept: vec![],
            closed: vec![],
        }
    }

    pub fn entity(&self) -> &EntityName {
        &self.entity
    }

    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }

    /// The version later statements of the transaction see.
    pub fn version(&self) -> Option<VersionToken> {
        self.version
    }

    pub fn current(&self) -> &[VersionedRecord] {
        &self.current
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn needs_write(&self) -> bool {
        self.dirty || (self.purged && !self.purge_written)
    }

    /// Placeholder system range for rows that do not exist outside the transaction yet.
    pub(crate) fn provisional_system(&self) -> TimeRange {
        if self.shape.tracks_processing() {
            TimeRange::open(Timestamp::now())
        } else {
            TimeRange::all()
        }
    }

    /// Record that a mutation happened. Only the first change after a provider write bumps the
    /// version, so repeated changes collapse into one bump.
    pub(crate) fn touch(&mut self, now: Timestamp) {
        if !self.dirty {
            self.version = Some(match self.version {
                None => VersionToken::initial(self.versioning, now),
                Some(v) => v.next(now),
            });
            self.dirty = true;
        }
        if let Some(v) = self.version {
            self.current.iter_mut().for_each(|r| r.version = v);
        }
    }

    /// Under last-writer-wins, write on top of whatever is live now: `live_rows` are the key's
    /// current records in the index and `live` their version. Before any provider write they
    /// replace `original`; after one, the rows this transaction never saw are queued for closing.
    pub(crate) fn rebase(
        &mut self,
        live_rows: &[Arc<VersionedRecord>],
        live: Option<VersionToken>,
        now: Timestamp,
    ) {
        if live == self.original_version {
            return;
        }
        if self.first_write_at.is_none() {
            self.original = live_rows.to_vec();
        } else {
            let seen: Vec<_> = self.original.iter().map(|r| r.slot()).collect();
            self.superseded = live_rows
                .iter()
                .filter(|r| !seen.contains(&r.slot()))
                .map(|r| VersionedRecord::clone(r))
                .collect();
            self.dirty = true;
        }
        self.original_version = live;
        let next = match live {
            None => VersionToken::initial(self.versioning, now),
            Some(v) => v.next(now),
        };
        let version = self.version.map_or(next, |v| v.max(next));
        self.version = Some(version);
        self.current.iter_mut().for_each(|r| r.version = version);
    }

    pub(crate) fn find(&self, as_of: AsOf) -> Option<VersionedRecord> {
        self.current
            .iter()
            .find(|r| r.business.contains(as_of.business))
            .cloned()
    }

    /// Produce the provider mutations that bring the store from the last written state to
    /// `current`, stamped with processing time `at`. Rows whose business range and payload did
    /// not change are left open rather than closed and written again.
    pub(crate) fn materialize(&mut self, at: Timestamp) -> Vec<Mutation> {
        let processing = self.shape.tracks_processing();
        let mut mutations = Vec::new();

        // Open rows this transaction did not write, and open rows it did.
        let mut foreign: Vec<VersionedRecord> = if self.first_write_at.is_some() {
            std::mem::take(&mut self.kept)
        } else {
            self.original.iter().map(|r| VersionedRecord::clone(r)).collect()
        };
        foreign.append(&mut self.superseded);
        let mut own: Vec<usize> = (0..self.written.len())
            .filter(|&i| self.written[i].is_processing_current())
            .collect();

        if self.purged && !self.purge_written {
            mutations.push(Mutation::Purge {
                key: self.key.clone(),
            });
            self.purge_written = true;
            self.written.clear();
            foreign.clear();
            own.clear();
        }

        let mut kept = vec![];
        let mut fresh = vec![];
        for c in &self.current {
            let same = |r: &VersionedRecord| r.business == c.business && r.payload == c.payload;
            if let Some(i) = foreign.iter().position(same) {
                kept.push(foreign.swap_remove(i));
            } else if let Some(i) = own.iter().position(|&w| same(&self.written[w])) {
                own.swap_remove(i);
            } else {
                fresh.push(c.clone());
            }
        }

        let stale = foreign.iter().chain(own.iter().map(|&w| &self.written[w]));
        for r in stale {
            mutations.push(if processing {
                Mutation::Inactivate {
                    key: self.key.clone(),
                    business_from: r.business.from,
                    system_from: r.system.from,
                    at,
                }
            } else {
                Mutation::Delete {
                    key: self.key.clone(),
                    business_from: r.business.from,
                    system_from: r.system.from,
                }
            });
        }
        self.closed.extend(foreign.iter().map(|r| (r.slot(), at)));
        if processing {
            for &w in &own {
                self.written[w].system = self.written[w].system.closed_at(at);
            }
        } else {
            let mut w = 0;
            self.written.retain(|_| {
                let keep = !own.contains(&w);
                w += 1;
                keep
            });
        }

        for mut row in fresh {
            row.system = if processing {
                TimeRange::open(at)
            } else {
                TimeRange::all()
            };
            mutations.push(Mutation::Insert(row.clone()));
            self.written.push(row);
        }

        self.kept = kept;
        if !mutations.is_empty() {
            self.first_write_at.get_or_insert(at);
        }
        self.dirty = false;
        mutations
    }

    /// Whether the row in `slot` was left open by this transaction's writes.
    pub(crate) fn keeps(&self, slot: (Timestamp, Timestamp)) -> bool {
        self.kept.iter().any(|r| r.slot() == slot)
    }

    /// When this transaction closed the row in `slot`, if it did.
    pub(crate) fn closed_at(&self, slot: (Timestamp, Timestamp)) -> Option<Timestamp> {
        self.closed.iter().find(|(s, _)| *s == slot).map(|(_, at)| *at)
    }

    /// Open rows after the last provider write: what this transaction wrote and what it kept.
    pub(crate) fn final_rows(&self) -> Vec<VersionedRecord> {
        let mut rows: Vec<_> = self
            .written
            .iter()
            .filter(|r| r.is_processing_current())
            .chain(&self.kept)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.slot());
        rows
    }
}

/// Pending writes keyed by (entity, key), in first-touch order.
#[derive(Default)]
pub(crate) struct WriteBuffer {
    writes: IndexMap<(EntityName, PrimaryKey), PendingWrite, ahash::RandomState>,
}

impl WriteBuffer {
    pub(crate) fn get(&self, entity: &EntityName, key: &PrimaryKey) -> Option<&PendingWrite> {
        self.writes.get(&(entity.clone(), key.clone()))
    }

    pub(crate) fn get_mut(
        &mut self,
        entity: &EntityName,
        key: &PrimaryKey,
    ) -> Option<&mut PendingWrite> {
        self.writes.get_mut(&(entity.clone(), key.clone()))
    }

    pub(crate) fn contains(&self, entity: &EntityName, key: &PrimaryKey) -> bool {
        self.writes.contains_key(&(entity.clone(), key.clone()))
    }

    pub(crate) fn insert(&mut self, pending: PendingWrite) {
        self.writes
            .insert((pending.entity.clone(), pending.key.clone()), pending);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PendingWrite> {
        self.writes.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingWrite> {
        self.writes.values_mut()
    }

    pub(crate) fn entities(&self) -> BTreeSet<EntityName> {
        self.writes.keys().map(|(e, _)| e.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.writes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Payload;

    fn ts(ms: i64) -> Timestamp {
        Timestamp(ms)
    }

    fn existing() -> Arc<VersionedRecord> {
        Arc::new(VersionedRecord::new(
            PrimaryKey::from(1),
            TimeRange::open(ts(0)),
            TimeRange::open(ts(10)),
            Payload::new().with("qty", 1),
            VersionToken::Counter(1),
        ))
    }

    fn pending(shape: TemporalShape) -> PendingWrite {
        PendingWrite::new(
            EntityName::from("pos"),
            PrimaryKey::from(1),
            shape,
            VersioningStrategy::Counter,
            vec![existing()],
            Some(VersionToken::Counter(1)),
        )
    }

    #[test]
    fn test_repeated_touches_bump_once() {
        let mut pw = pending(TemporalShape::Bitemporal);
        pw.touch(ts(20));
        pw.touch(ts(21));
        assert_eq!(pw.version(), Some(VersionToken::Counter(2)));
        pw.materialize(ts(30));
        pw.touch(ts(31));
        assert_eq!(pw.version(), Some(VersionToken::Counter(3)));
    }

    #[test]
    fn test_materialize_closes_previous_write() {
        let mut pw = pending(TemporalShape::Bitemporal);
        pw.current[0].payload.set("qty", 2);
        pw.touch(ts(20));
        let first = pw.materialize(ts(30));
        assert_eq!(first.len(), 2);
        assert!(matches!(
            first[0],
            Mutation::Inactivate { system_from, at, .. } if system_from == ts(10) && at == ts(30)
        ));

        pw.current[0].payload.set("qty", 3);
        pw.touch(ts(40));
        let second = pw.materialize(ts(50));
        // Closes the row written at 30, not the original.
        assert!(matches!(
            second[0],
            Mutation::Inactivate { system_from, at, .. } if system_from == ts(30) && at == ts(50)
        ));
        assert_eq!(pw.written.len(), 2);
        assert_eq!(pw.written[0].system, TimeRange::new(ts(30), ts(50)));
        assert_eq!(pw.final_rows().len(), 1);
        assert_eq!(pw.first_write_at, Some(ts(30)));
    }

    #[test]
    fn test_unchanged_segment_stays_open() {
        let segment = |from: i64, to: Option<i64>, n: i64| {
            let business = match to {
                Some(to) => TimeRange::new(ts(from), ts(to)),
                None => TimeRange::open(ts(from)),
            };
            Arc::new(VersionedRecord::new(
                PrimaryKey::from(1),
                business,
                TimeRange::open(ts(10)),
                Payload::new().with("qty", n),
                VersionToken::Counter(1),
            ))
        };
        let mut pw = PendingWrite::new(
            EntityName::from("pos"),
            PrimaryKey::from(1),
            TemporalShape::Bitemporal,
            VersioningStrategy::Counter,
            vec![segment(0, Some(50), 1), segment(50, None, 2)],
            Some(VersionToken::Counter(1)),
        );
        pw.current[1].payload.set("qty", 3);
        pw.touch(ts(20));
        let mutations = pw.materialize(ts(30));
        assert_eq!(mutations.len(), 2);
        assert!(matches!(
            mutations[0],
            Mutation::Inactivate { business_from, .. } if business_from == ts(50)
        ));
        assert!(pw.keeps((ts(0), ts(10))));
        assert_eq!(pw.closed_at((ts(50), ts(10))), Some(ts(30)));
        assert_eq!(pw.final_rows().len(), 2);

        // Nothing changed since: nothing to write.
        pw.touch(ts(40));
        assert!(pw.materialize(ts(50)).is_empty());
        assert_eq!(pw.first_write_at, Some(ts(30)));
        assert!(pw.keeps((ts(0), ts(10))));
    }

    #[test]
    fn test_nondated_materialize_replaces_row() {
        let original = Arc::new(VersionedRecord::new(
            PrimaryKey::from(1),
            TimeRange::all(),
            TimeRange::all(),
            Payload::new(),
            VersionToken::Counter(1),
        ));
        let mut pw = PendingWrite::new(
            EntityName::from("ref"),
            PrimaryKey::from(1),
            TemporalShape::NonDated,
            VersioningStrategy::Counter,
            vec![original],
            Some(VersionToken::Counter(1)),
        );
        pw.current.clear();
        pw.touch(ts(5));
        let mutations = pw.materialize(ts(6));
        assert_eq!(mutations.len(), 1);
        assert!(matches!(mutations[0], Mutation::Delete { .. }));
        assert!(pw.final_rows().is_empty());
    }

    #[test]
    fn test_buffer_keeps_first_touch_order() {
        let mut buffer = WriteBuffer::default();
        for k in [3, 1, 2] {
            buffer.insert(PendingWrite::new(
                EntityName::from("e"),
                PrimaryKey::from(k),
                TemporalShape::NonDated,
                VersioningStrategy::Counter,
                vec![],
                None,
            ));
        }
        buffer.insert(PendingWrite::new(
            EntityName::from("e"),
            PrimaryKey::from(3),
            TemporalShape::NonDated,
            VersioningStrategy::Counter,
            vec![],
            None,
        ));
        let keys: Vec<_> = buffer.iter().map(|p| p.key().clone()).collect();
        assert_eq!(
            keys,
            vec![PrimaryKey::from(3), PrimaryKey::from(1), PrimaryKey::from(2)]
        );
        assert!(buffer.contains(&EntityName::from("e"), &PrimaryKey::from(2)));
        assert_eq!(buffer.len(), 3);
    }
}
