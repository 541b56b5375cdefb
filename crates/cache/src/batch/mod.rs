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

//! Large mutation batches spread over a fixed pool of worker threads. Each worker owns a disjoint
//! partition of the key space, so units in different partitions never contend for the same key.

mod executor;
mod partitioner;

pub use executor::PartitionedExecutor;
pub use partitioner::Partitioner;

use crate::error::Error;
use crate::index::OverlapSet;
use crate::record::{PrimaryKey, Timestamp, VersionedRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Insert(VersionedRecord),
    /// Replace the payload of `old` with that of `new`, failing if `old` is no longer current.
    Update {
        old: VersionedRecord,
        new: VersionedRecord,
    },
    Terminate {
        record: VersionedRecord,
        at: Timestamp,
    },
}

impl BatchOp {
    /// The key that decides the owning partition.
    pub fn key(&self) -> &PrimaryKey {
        match self {
            BatchOp::Insert(r) => &r.primary_key,
            BatchOp::Update { old, .. } => &old.primary_key,
            BatchOp::Terminate { record, .. } => &record.primary_key,
        }
    }
}

/// What to do with a unit whose transaction failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub enum ErrorAction {
    /// Run the unit again as is.
    Requeue,
    /// Reload the unit's keys from the provider, re-read the records being updated, then run again.
    RefreshAndRequeue,
    /// Record the failure; `wait_until_finished` reports it.
    Fail,
    /// Drop the unit and carry on.
    Skip,
}

pub trait BatchErrorHandler: Send + Sync {
    /// `attempt` counts from 1.
    fn on_error(
        &self,
        partition: usize,
        attempt: usize,
        ops: &[BatchOp],
        error: &Error,
    ) -> ErrorAction;
}

/// Requeues retryable failures up to `max_attempts` tries, fails everything else.
pub struct DefaultErrorHandler {
    max_attempts: usize,
}

impl DefaultErrorHandler {
    pub fn new(max_attempts: usize) -> Self {
        Self { max_attempts }
    }
}

impl BatchErrorHandler for DefaultErrorHandler {
    fn on_error(
        &self,
        _partition: usize,
        attempt: usize,
        _ops: &[BatchOp],
        error: &Error,
    ) -> ErrorAction {
        if error.is_retryable() && attempt < self.max_attempts {
            ErrorAction::Requeue
        } else {
            ErrorAction::Fail
        }
    }
}

/// Like [`DefaultErrorHandler`], but refreshes stale records before each retry. Suits update
/// batches built from records read long before they are applied.
pub struct RefreshingErrorHandler {
    max_attempts: usize,
}

impl RefreshingErrorHandler {
    pub fn new(max_attempts: usize) -> Self {
        Self { max_attempts }
    }
}

impl BatchErrorHandler for RefreshingErrorHandler {
    fn on_error(
        &self,
        _partition: usize,
        attempt: usize,
        _ops: &[BatchOp],
        error: &Error,
    ) -> ErrorAction {
        if error.is_retryable() && attempt < self.max_attempts {
            ErrorAction::RefreshAndRequeue
        } else {
            ErrorAction::Fail
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub inserted: usize,
    pub updated: usize,
    pub terminated: usize,
    /// Units committed, bulk chunks included.
    pub units: usize,
    /// Extra attempts caused by errors the handler requeued.
    pub retries: usize,
    /// Operations in units the handler chose to skip.
    pub skipped: usize,
    /// Overlaps found while bulk inserting. The rows stay resident.
    pub overlaps: Vec<OverlapSet>,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.terminated += other.terminated;
        self.units += other.units;
        self.retries += other.retries;
        self.skipped += other.skipped;
        self.overlaps.extend(other.overlaps);
    }

    fn count(&mut self, ops: &[BatchOp]) {
        for op in ops {
            match op {
                BatchOp::Insert(_) => self.inserted += 1,
                BatchOp::Update { .. } => self.updated += 1,
                BatchOp::Terminate { .. } => self.terminated += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConflictInfo, ConflictType};
    use crate::registry::EntityName;

    #[test]
    fn test_default_handler_requeues_conflicts_until_exhausted() {
        let conflict = Error::Conflict(ConflictInfo {
            entity: EntityName::from("e"),
            key: PrimaryKey::from(1),
            conflict_type: ConflictType::StaleRead,
            observed: None,
            current: None,
        });
        let handler = DefaultErrorHandler::new(3);
        assert_eq!(handler.on_error(0, 1, &[], &conflict), ErrorAction::Requeue);
        assert_eq!(handler.on_error(0, 3, &[], &conflict), ErrorAction::Fail);
        assert_eq!(
            handler.on_error(0, 1, &[], &Error::Provider("down".into())),
            ErrorAction::Fail
        );
        let refreshing = RefreshingErrorHandler::new(3);
        assert_eq!(refreshing.on_error(0, 2, &[], &conflict), ErrorAction::RefreshAndRequeue);
    }
}
