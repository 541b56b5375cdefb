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

//! Exclusive per-key locks for `Isolation::FullParticipation`.
//!
//! Deadlocks are avoided with wait-die: a transaction may only wait for a lock held by a younger
//! transaction. A younger requester dies immediately with a retryable conflict.

use crate::error::{ConflictInfo, ConflictType, Error};
use crate::record::PrimaryKey;
use crate::registry::EntityName;
use crate::tx::TxId;
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use std::time::Instant;
use tracing::trace;

type LockKey = (EntityName, PrimaryKey);

#[derive(Default)]
pub struct KeyLockTable {
    /// Holder of each locked key, identified by its priority (the id of its first attempt).
    owners: Mutex<AHashMap<LockKey, TxId>>,
    released: Condvar,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock on `(entity, key)` for the transaction with priority `owner`. Re-entrant.
    pub fn acquire(
        &self,
        owner: TxId,
        entity: &EntityName,
        key: &PrimaryKey,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        let lock_key = (entity.clone(), key.clone());
        let mut owners = self.owners.lock();
        loop {
            let holder = match owners.get(&lock_key) {
                None => {
                    owners.insert(lock_key, owner);
                    return Ok(());
                }
                Some(holder) if *holder == owner => return Ok(()),
                Some(holder) => *holder,
            };
            if owner > holder {
                trace!(%owner, %holder, %entity, %key, "Younger transaction dies");
                return Err(Error::Conflict(ConflictInfo {
                    entity: entity.clone(),
                    key: key.clone(),
                    conflict_type: ConflictType::LockWaitDie,
                    observed: None,
                    current: None,
                }));
            }
            match deadline {
                None => self.released.wait(&mut owners),
                Some(deadline) => {
                    if self.released.wait_until(&mut owners, deadline).timed_out()
                        && owners.contains_key(&lock_key)
                    {
                        return Err(Error::Timeout(owner));
                    }
                }
            }
        }
    }

    pub fn release_all(&self, owner: TxId, keys: &[LockKey]) {
        if keys.is_empty() {
            return;
        }
        let mut owners = self.owners.lock();
        for k in keys {
            if owners.get(k) == Some(&owner) {
                owners.remove(k);
            }
        }
        self.released.notify_all();
    }

    pub fn holder(&self, entity: &EntityName, key: &PrimaryKey) -> Option<TxId> {
        self.owners
            .lock()
            .get(&(entity.clone(), key.clone()))
            .copied()
    }

    pub fn locked_count(&self) -> usize {
        self.owners.lock().len()
    }
}
