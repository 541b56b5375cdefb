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

//! The commit pipeline: check phase (validate read sets under read locks, then upgrade), provider
//! write-through, then the apply phase (milestone the index, bump counters, publish events).

use crate::error::{ConflictInfo, ConflictType, Error};
use crate::index::TemporalIndex;
use crate::lock::Upgrade;
use crate::notify::{ChangeEvent, EventKind};
use crate::record::Timestamp;
use crate::registry::{EntityCache, EntityName};
use crate::tx::transaction::{CommitOutcome, Transaction};
use crate::tx::write_buffer::PendingWrite;
use crate::tx::{Isolation, TxId};
use std::collections::BTreeSet;
use tempora_common::util::PerfTimerGuard;
use tracing::{error, warn};

impl Transaction {
    pub(super) fn commit_inner(&mut self) -> Result<CommitOutcome, Error> {
        if self.writes.is_empty() && !self.provider_touched {
            // Nothing to write, but what was read must still hold at commit.
            self.validate_reads()?;
            return Ok(CommitOutcome {
                tx: self.id,
                commit_time: None,
                mutations: 0,
                events: 0,
            });
        }

        let engine = self.engine.clone();
        let _serialized = engine.commit_lock().lock();
        let commit_started = minstant::Instant::now();
        let check_timer = PerfTimerGuard::new(&engine.counters().commit_check);

        // Sorted, so every committer takes index locks in the same order.
        let mut names: BTreeSet<EntityName> = self.writes.entities();
        names.extend(self.reads.keys().map(|(entity, _)| entity.clone()));
        let caches = names
            .iter()
            .map(|name| engine.registry().get(name))
            .collect::<Result<Vec<_>, _>>()?;
        let isolations: Vec<Isolation> = caches.iter().map(|c| self.isolation(c)).collect();

        let mut readers = Vec::with_capacity(caches.len());
        for cache in &caches {
            let reader = cache
                .index()
                .read_until(self.deadline)
                .ok_or(Error::Timeout(self.id))?;
            self.validate(cache, &reader)?;
            readers.push(reader);
        }
        let mut writers = Vec::with_capacity(caches.len());
        for (cache, reader) in caches.iter().zip(readers) {
            let (writer, how) = reader
                .upgrade_until(self.deadline)
                .ok_or(Error::Timeout(self.id))?;
            if how == Upgrade::Reacquired {
                self.validate(cache, &writer)?;
            }
            writers.push(writer);
        }

        let now = Timestamp::now();
        for pending in self.writes.iter_mut() {
            let Some(slot) = names.iter().position(|n| *n == pending.entity) else {
                continue;
            };
            if isolations[slot] == Isolation::NoLocking {
                let index = &writers[slot];
                pending.rebase(
                    &index.current_versions(&pending.key),
                    index.key_version(&pending.key),
                    now,
                );
            }
        }

        // Last chance to give up cleanly: past this point the provider has the data.
        self.check_deadline()?;
        let commit_time = engine.clock().tick();
        let mut mutations = vec![];
        for pending in self.writes.iter_mut().filter(|p| p.needs_write()) {
            let entity = pending.entity.clone();
            mutations.extend(
                pending
                    .materialize(commit_time)
                    .into_iter()
                    .map(|m| (entity.clone(), m)),
            );
        }
        if !mutations.is_empty() {
            self.provider_touched = true;
            engine.provider().write(self.id, &mutations)?;
        }
        engine.provider().commit(self.id)?;
        drop(check_timer);

        let apply_timer = PerfTimerGuard::new(&engine.counters().commit_apply);
        let mut events = Vec::new();
        let mut touched = vec![false; caches.len()];
        for pending in self.writes.iter() {
            let Some(slot) = names.iter().position(|n| *n == pending.entity) else {
                continue;
            };
            touched[slot] = true;
            let index = &mut *writers[slot];
            if let Err(e) = apply_to_index(index, pending, commit_time) {
                // The provider is authoritative; the next read reloads the key.
                error!(tx = %self.id, entity = %pending.entity, key = %pending.key, error = %e,
                    "Index diverged from provider; evicting key");
                index.remove_key(&pending.key);
            }
            if let Some(event) = describe(&caches[slot], pending, self.id) {
                events.push(event);
            }
        }
        for (cache, touched) in caches.iter().zip(&touched) {
            if *touched {
                cache.bump_update_count();
            }
        }
        drop(writers);
        drop(apply_timer);

        if let Some((entity, predicate)) = self.mass_delete.take() {
            events.retain(|e| e.entity != entity);
            events.push(
                ChangeEvent::new(entity, EventKind::MassDelete, self.id).with_predicate(predicate),
            );
        }

        let elapsed = commit_started.elapsed();
        if elapsed > engine.config().slow_commit_threshold {
            warn!(tx = %self.id, keys = self.writes.len(), mutations = mutations.len(),
                "Slow commit: {:.3}s", elapsed.as_secs_f64());
        }

        let outcome = CommitOutcome {
            tx: self.id,
            commit_time: Some(commit_time),
            mutations: mutations.len(),
            events: events.len(),
        };
        engine.notifications().publish(events);
        Ok(outcome)
    }

    /// Validate the whole read set, one entity at a time under its read lock.
    fn validate_reads(&self) -> Result<(), Error> {
        let names: BTreeSet<EntityName> =
            self.reads.keys().map(|(entity, _)| entity.clone()).collect();
        for name in &names {
            let cache = self.engine.registry().get(name)?;
            let reader = cache
                .index()
                .read_until(self.deadline)
                .ok_or(Error::Timeout(self.id))?;
            self.validate(&cache, &reader)?;
        }
        Ok(())
    }

    /// Compare every version observed for this entity with what the index holds now.
    fn validate(&self, cache: &EntityCache, index: &TemporalIndex) -> Result<(), Error> {
        for ((entity, key), observed) in &self.reads {
            if entity != cache.name() {
                continue;
            }
            let current = index.key_version(key);
            if current == *observed {
                continue;
            }
            let conflict_type = match (observed, current) {
                (None, Some(_)) => ConflictType::ConcurrentInsert,
                (Some(_), None) => ConflictType::ConcurrentDelete,
                _ => ConflictType::StaleRead,
            };
            return Err(Error::Conflict(ConflictInfo {
                entity: entity.clone(),
                key: key.clone(),
                conflict_type,
                observed: *observed,
                current,
            }));
        }
        Ok(())
    }
}

/// Close (or, without a processing axis, drop) the key's live records the transaction replaced
/// and install what it wrote.
fn apply_to_index(
    index: &mut TemporalIndex,
    pending: &PendingWrite,
    commit_time: Timestamp,
) -> Result<(), Error> {
    if pending.first_write_at.is_none() {
        return Ok(());
    }
    if pending.purge_written {
        index.remove_key(&pending.key);
    } else {
        for live in index.current_versions(&pending.key) {
            if pending.keeps(live.slot()) {
                continue;
            }
            if pending.shape.tracks_processing() {
                let at = pending.closed_at(live.slot()).unwrap_or(commit_time);
                index.put(live.with_system_closed(at))?;
            } else {
                index.remove(&live);
            }
        }
    }
    for row in &pending.written {
        index.put(row.clone())?;
    }
    Ok(())
}

fn describe(cache: &EntityCache, pending: &PendingWrite, origin: TxId) -> Option<ChangeEvent> {
    pending.first_write_at?;
    let finals = pending.final_rows();
    let kind = match (pending.original.is_empty(), finals.is_empty()) {
        // Inserted and deleted again: nothing anyone else could have seen.
        (true, true) if !pending.purge_written => return None,
        (true, true) => EventKind::Delete,
        (true, false) => EventKind::Insert,
        (false, true) => EventKind::Delete,
        (false, false) => EventKind::Update,
    };
    let snapshots = if kind == EventKind::Delete {
        pending.original.iter().map(|r| (**r).clone()).collect()
    } else {
        finals
    };
    let source = cache
        .def()
        .source_attribute
        .as_deref()
        .and_then(|attr| snapshots.first()?.payload.get(attr).cloned());
    Some(
        ChangeEvent::new(pending.entity.clone(), kind, origin)
            .with_keys(vec![pending.key.clone()])
            .with_snapshots(snapshots)
            .with_source(source),
    )
}
