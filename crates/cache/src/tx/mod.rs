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

//! Transactions: per-transaction read sets and coalescing write buffers, validated and applied to
//! the temporal index at commit.

mod commit;
mod key_locks;
mod milestone;
mod transaction;
mod write_buffer;

pub use key_locks::KeyLockTable;
pub use transaction::{CommitOutcome, Transaction};
pub use write_buffer::PendingWrite;

use crate::record::Timestamp;
use crate::registry::EntityName;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tempora_common::util::CachePadded;

/// Transaction identity. Allocated in increasing order, so a smaller id is an older transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl Display for TxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// How a transaction participates in concurrency control for an entity type.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
pub enum Isolation {
    /// No read-set validation. Last committer wins.
    NoLocking,
    /// Record versions read; validate at commit.
    #[default]
    OptimisticReadCache,
    /// Optimistic validation plus an exclusive per-key lock held from first access to the end.
    FullParticipation,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub enum TxState {
    Active,
    Committing,
    ConflictDetected,
    Retrying,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    /// Re-run the body from scratch on a retryable conflict. Only honored by `Engine::execute`.
    pub retry_on_conflict: bool,
    /// Overrides `EngineConfig::max_retries`.
    pub max_retries: Option<usize>,
    /// Overrides `EngineConfig::transaction_timeout`.
    pub timeout: Option<Duration>,
    /// Per-entity isolation overrides.
    pub isolation: AHashMap<EntityName, Isolation>,
}

impl TxOptions {
    pub fn retrying() -> Self {
        Self {
            retry_on_conflict: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_isolation(mut self, entity: &EntityName, isolation: Isolation) -> Self {
        self.isolation.insert(entity.clone(), isolation);
        self
    }
}

/// Hands out strictly increasing processing timestamps, tracking wall-clock time where it can.
#[derive(Default)]
pub struct CommitClock {
    last: CachePadded<AtomicI64>,
}

impl CommitClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> Timestamp {
        let now = Timestamp::now().0;
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        Timestamp(now.max(prev + 1))
    }

    pub fn last(&self) -> Timestamp {
        Timestamp(self.last.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_strictly_increases() {
        let clock = CommitClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let t = clock.tick();
            assert!(t > prev);
            prev = t;
        }
        assert_eq!(clock.last(), prev);
    }
}
