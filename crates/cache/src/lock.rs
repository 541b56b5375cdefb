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

//! A reader-preferring read-write lock whose read guards can be upgraded to write guards without
//! first releasing them.
//!
//! Only one upgrade proceeds at a time. The first upgrader keeps its read hold and waits for the
//! remaining readers to leave; any concurrent second upgrader surrenders its read hold, queues
//! behind the first, and reports [`Upgrade::Reacquired`] so the caller knows whatever it read
//! before may have changed.
//!
//! Waiting plain writers do not hold off new readers, so a steady stream of readers can starve a
//! writer. A pending upgrade does hold off new readers.
//!
//! The lock is not reentrant: taking a second read guard on the same thread while an upgrade is
//! pending deadlocks.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::time::Instant;
use tempora_common::util::CachePadded;

/// How an upgrade was obtained.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Upgrade {
    /// The read hold was kept throughout; what was read is still valid.
    Immediate,
    /// The read hold was surrendered and re-acquired as a write; re-validate.
    Reacquired,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
    upgrading: bool,
    queued_upgraders: usize,
}

impl LockState {
    fn blocks_readers(&self) -> bool {
        self.writer || self.upgrading || self.queued_upgraders > 0
    }

    fn blocks_writers(&self) -> bool {
        self.blocks_readers() || self.readers > 0
    }
}

pub struct UpgradeableRwLock<T> {
    state: CachePadded<Mutex<LockState>>,
    changed: Condvar,
    data: UnsafeCell<T>,
}

// Access to `data` is mediated by the guards, which follow the usual RwLock discipline.
unsafe impl<T: Send> Send for UpgradeableRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for UpgradeableRwLock<T> {}

impl<T> UpgradeableRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: CachePadded::new(Mutex::new(LockState::default())),
            changed: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Waits on the condition variable. Returns false once the deadline has passed.
    fn wait(&self, state: &mut MutexGuard<'_, LockState>, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.changed.wait(state);
                true
            }
            Some(deadline) => !self.changed.wait_until(state, deadline).timed_out(),
        }
    }

    fn acquire_read(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while state.blocks_readers() {
            if !self.wait(&mut state, deadline) && state.blocks_readers() {
                return false;
            }
        }
        state.readers += 1;
        true
    }

    fn acquire_write(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while state.blocks_writers() {
            if !self.wait(&mut state, deadline) && state.blocks_writers() {
                return false;
            }
        }
        state.writer = true;
        true
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        self.acquire_read(None);
        ReadGuard { lock: self }
    }

    /// Like [`read`](Self::read), giving up at `deadline`.
    pub fn read_until(&self, deadline: Option<Instant>) -> Option<ReadGuard<'_, T>> {
        self.acquire_read(deadline).then(|| ReadGuard { lock: self })
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        self.acquire_write(None);
        WriteGuard { lock: self }
    }

    pub fn write_until(&self, deadline: Option<Instant>) -> Option<WriteGuard<'_, T>> {
        self.acquire_write(deadline).then(|| WriteGuard { lock: self })
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.state.lock().writer
    }

    pub fn has_pending_upgrade(&self) -> bool {
        let state = self.state.lock();
        state.upgrading || state.queued_upgraders > 0
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers <= 1 {
            self.changed.notify_all();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        self.changed.notify_all();
    }

    fn upgrade(&self, deadline: Option<Instant>) -> Option<Upgrade> {
        let mut state = self.state.lock();
        if !state.upgrading {
            state.upgrading = true;
            while state.readers > 1 {
                if !self.wait(&mut state, deadline) && state.readers > 1 {
                    state.upgrading = false;
                    state.readers -= 1;
                    self.changed.notify_all();
                    return None;
                }
            }
            state.upgrading = false;
            state.readers = 0;
            state.writer = true;
            return Some(Upgrade::Immediate);
        }

        // Someone else is already upgrading: step aside so they can finish.
        state.readers -= 1;
        state.queued_upgraders += 1;
        self.changed.notify_all();
        while state.writer || state.upgrading || state.readers > 0 {
            if !self.wait(&mut state, deadline)
                && (state.writer || state.upgrading || state.readers > 0)
            {
                state.queued_upgraders -= 1;
                self.changed.notify_all();
                return None;
            }
        }
        state.queued_upgraders -= 1;
        state.writer = true;
        Some(Upgrade::Reacquired)
    }
}

impl<T: Default> Default for UpgradeableRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[must_use = "dropping the guard releases the read hold"]
pub struct ReadGuard<'a, T> {
    lock: &'a UpgradeableRwLock<T>,
}

impl<'a, T> ReadGuard<'a, T> {
    pub fn upgrade(self) -> (WriteGuard<'a, T>, Upgrade) {
        let lock = self.lock;
        std::mem::forget(self);
        // Without a deadline the upgrade cannot fail.
        let how = lock.upgrade(None).unwrap_or(Upgrade::Reacquired);
        (WriteGuard { lock }, how)
    }

    /// Upgrade, giving up at `deadline`. On timeout the read hold is released.
    pub fn upgrade_until(self, deadline: Option<Instant>) -> Option<(WriteGuard<'a, T>, Upgrade)> {
        let lock = self.lock;
        std::mem::forget(self);
        let how = lock.upgrade(deadline)?;
        Some((WriteGuard { lock }, how))
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

#[must_use = "dropping the guard releases the write hold"]
pub struct WriteGuard<'a, T> {
    lock: &'a UpgradeableRwLock<T>,
}

impl<'a, T> WriteGuard<'a, T> {
    /// Atomically trade the write hold for a read hold.
    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);
        let mut state = lock.state.lock();
        state.writer = false;
        state.readers += 1;
        lock.changed.notify_all();
        ReadGuard { lock }
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
