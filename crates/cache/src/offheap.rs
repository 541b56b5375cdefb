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

//! Encoded records kept in a slab of reference-counted blocks, outside the index's own memory.
//!
//! Dropping the last [`BlockHandle`] retires its block, but the block is only freed by the
//! reclaimer thread once every [`ReadPin`] taken before the retirement is gone. A pinned reader may
//! therefore keep reading a block by id after its last handle was dropped.

use crate::error::Error;
use crate::record::VersionedRecord;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const RECLAIM_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    data: Option<Box<[u8]>>,
    refs: AtomicUsize,
}

enum ReclaimMsg {
    Retire { id: BlockId, epoch: u64 },
    /// A pin went away; pending blocks may now be free-able.
    Unpinned,
    Sync(oneshot::Sender<()>),
}

struct Inner {
    slots: RwLock<Vec<Slot>>,
    free_list: Mutex<Vec<u32>>,
    epoch: AtomicU64,
    /// Live pins: pin id → epoch at which it was taken.
    pins: Mutex<BTreeMap<u64, u64>>,
    next_pin: AtomicU64,
    live: AtomicUsize,
    freed: AtomicUsize,
}

impl Inner {
    fn min_pinned_epoch(&self) -> Option<u64> {
        self.pins.lock().values().copied().min()
    }

    fn free(&self, id: BlockId) {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation || slot.data.is_none() {
            return;
        }
        slot.data = None;
        slot.generation = slot.generation.wrapping_add(1);
        drop(slots);
        self.free_list.lock().push(id.index);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.freed.fetch_add(1, Ordering::AcqRel);
    }
}

pub struct BlockStore {
    inner: Arc<Inner>,
    sender: Sender<ReclaimMsg>,
    kill_switch: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BlockStore {
    pub fn new() -> Result<Self, Error> {
        let inner = Arc::new(Inner {
            slots: RwLock::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(1),
            pins: Mutex::new(BTreeMap::new()),
            next_pin: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        });
        let kill_switch = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = flume::unbounded();
        let reclaimer_inner = inner.clone();
        let ks = kill_switch.clone();
        let join_handle = std::thread::Builder::new()
            .name("tempora-reclaim".to_string())
            .spawn(move || Self::reclaim_loop(reclaimer_inner, receiver, ks))
            .map_err(|e| Error::InvalidState(format!("failed to spawn reclaimer: {e}")))?;
        Ok(Self {
            inner,
            sender,
            kill_switch,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    fn reclaim_loop(
        inner: Arc<Inner>,
        receiver: Receiver<ReclaimMsg>,
        kill_switch: Arc<AtomicBool>,
    ) {
        let mut retired: Vec<(BlockId, u64)> = vec![];
        loop {
            if kill_switch.load(Ordering::Relaxed) {
                break;
            }
            let mut sync_reply = None;
            match receiver.recv_timeout(RECLAIM_POLL) {
                Ok(ReclaimMsg::Retire { id, epoch }) => retired.push((id, epoch)),
                Ok(ReclaimMsg::Unpinned) => {}
                Ok(ReclaimMsg::Sync(reply)) => sync_reply = Some(reply),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !retired.is_empty() {
                let horizon = inner.min_pinned_epoch();
                let before = retired.len();
                retired.retain(|(id, epoch)| {
                    let reclaimable = horizon.is_none_or(|min| min > *epoch);
                    if reclaimable {
                        inner.free(*id);
                    }
                    !reclaimable
                });
                if before != retired.len() {
                    debug!(
                        freed = before - retired.len(),
                        waiting = retired.len(),
                        "Reclaimed blocks"
                    );
                }
            }
            if let Some(reply) = sync_reply {
                reply.send(()).ok();
            }
        }
        if !retired.is_empty() {
            warn!(blocks = retired.len(), "Reclaimer stopped with blocks still awaiting readers");
        }
    }

    /// Encode `record` into a fresh block.
    pub fn store(&self, record: &VersionedRecord) -> Result<BlockHandle, Error> {
        let bytes = serde_json::to_vec(record).map_err(|e| Error::Encoding(e.to_string()))?;
        let data = Some(bytes.into_boxed_slice());
        let reused = self.inner.free_list.lock().pop();
        let mut slots = self.inner.slots.write();
        let id = match reused {
            Some(index) => {
                let slot = &mut slots[index as usize];
                slot.data = data;
                slot.refs.store(1, Ordering::Release);
                BlockId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(slots.len())
                    .map_err(|_| Error::InvalidState("block store is full".to_string()))?;
                slots.push(Slot {
                    generation: 0,
                    data,
                    refs: AtomicUsize::new(1),
                });
                BlockId {
                    index,
                    generation: 0,
                }
            }
        };
        drop(slots);
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        Ok(BlockHandle {
            id,
            inner: self.inner.clone(),
            sender: self.sender.clone(),
        })
    }

    /// Hold off reclamation of every block retired from now until the pin is dropped.
    pub fn pin(&self) -> ReadPin {
        let pin = self.inner.next_pin.fetch_add(1, Ordering::Relaxed);
        // The epoch is read under the pins lock so the reclaimer cannot compute its horizon between
        // the read and the registration.
        let mut pins = self.inner.pins.lock();
        pins.insert(pin, self.inner.epoch.load(Ordering::Acquire));
        drop(pins);
        ReadPin {
            pin,
            inner: self.inner.clone(),
            sender: self.sender.clone(),
        }
    }

    /// The raw bytes of block `id`, if it has not been freed. Works after the last handle is gone
    /// as long as `pin` predates its retirement.
    pub fn read_raw(&self, _pin: &ReadPin, id: BlockId) -> Option<Vec<u8>> {
        let slots = self.inner.slots.read();
        let slot = slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.data.as_ref().map(|d| d.to_vec())
    }

    /// Blocks stored and not yet freed, retired ones included.
    pub fn live_blocks(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn freed_count(&self) -> usize {
        self.inner.freed.load(Ordering::Acquire)
    }

    /// Wait for the reclaimer to process everything sent so far and run one pass.
    pub fn sync(&self) {
        let (reply, done) = oneshot::channel();
        if self.sender.send(ReclaimMsg::Sync(reply)).is_ok() {
            done.recv().ok();
        }
    }

    pub fn stop(&self) {
        self.kill_switch.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join_handle.lock().take() {
            if handle.join().is_err() {
                warn!("Block reclaimer panicked");
            }
            info!(freed = self.freed_count(), live = self.live_blocks(), "Block reclaimer stopped");
        }
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("live", &self.live_blocks())
            .field("freed", &self.freed_count())
            .finish()
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A counted reference to one block. Cloning adds a reference; dropping the last one retires the
/// block.
pub struct BlockHandle {
    id: BlockId,
    inner: Arc<Inner>,
    sender: Sender<ReclaimMsg>,
}

impl BlockHandle {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn read(&self, _pin: &ReadPin) -> Result<VersionedRecord, Error> {
        let slots = self.inner.slots.read();
        let bytes = slots
            .get(self.id.index as usize)
            .filter(|s| s.generation == self.id.generation)
            .and_then(|s| s.data.as_deref())
            .ok_or_else(|| Error::InvalidState(format!("block {:?} was freed", self.id)))?;
        serde_json::from_slice(bytes).map_err(|e| Error::Encoding(e.to_string()))
    }

    fn slot_refs<R>(&self, f: impl FnOnce(&AtomicUsize) -> R) -> Option<R> {
        let slots = self.inner.slots.read();
        slots
            .get(self.id.index as usize)
            .filter(|s| s.generation == self.id.generation)
            .map(|s| f(&s.refs))
    }

    pub fn ref_count(&self) -> usize {
        self.slot_refs(|r| r.load(Ordering::Acquire)).unwrap_or(0)
    }
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlockHandle").field(&self.id).finish()
    }
}

impl Clone for BlockHandle {
    fn clone(&self) -> Self {
        self.slot_refs(|r| r.fetch_add(1, Ordering::AcqRel));
        Self {
            id: self.id,
            inner: self.inner.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        if self.slot_refs(|r| r.fetch_sub(1, Ordering::AcqRel)) == Some(1) {
            let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel);
            if self
                .sender
                .send(ReclaimMsg::Retire { id: self.id, epoch })
                .is_err()
            {
                // Reclaimer gone; nobody can be waiting on the block any more.
                self.inner.free(self.id);
            }
        }
    }
}

/// Registers a reader with the block store for as long as it lives.
pub struct ReadPin {
    pin: u64,
    inner: Arc<Inner>,
    sender: Sender<ReclaimMsg>,
}

impl Drop for ReadPin {
    fn drop(&mut self) {
        self.inner.pins.lock().remove(&self.pin);
        self.sender.send(ReclaimMsg::Unpinned).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Payload, PrimaryKey, TimeRange, Timestamp, VersionToken};

    fn record(n: i64) -> VersionedRecord {
        VersionedRecord::new(
            PrimaryKey::from(n),
            TimeRange::open(Timestamp(0)),
            TimeRange::open(Timestamp(1)),
            Payload::new().with("n", n),
            VersionToken::Counter(1),
        )
    }

    #[test]
    fn test_store_and_read() {
        let store = BlockStore::new().unwrap();
        let handle = store.store(&record(7)).unwrap();
        let pin = store.pin();
        assert_eq!(handle.read(&pin).unwrap(), record(7));
        let second = handle.clone();
        assert_eq!(handle.ref_count(), 2);
        drop(second);
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(store.live_blocks(), 1);
    }

    #[test]
    fn test_reclamation_waits_for_earlier_readers() {
        let store = BlockStore::new().unwrap();
        let handle = store.store(&record(1)).unwrap();
        let id = handle.id();
        let early = store.pin();
        drop(handle);
        store.sync();

        // Retired, but the early reader can still get at it.
        assert_eq!(store.freed_count(), 0);
        assert!(store.read_raw(&early, id).is_some());

        // A reader pinned after the retirement does not hold it back.
        let late = store.pin();
        drop(early);
        store.sync();
        assert_eq!(store.freed_count(), 1);
        assert_eq!(store.live_blocks(), 0);
        assert!(store.read_raw(&late, id).is_none());
    }

    #[test]
    fn test_freed_slots_are_reused_with_new_generation() {
        let store = BlockStore::new().unwrap();
        let first = store.store(&record(1)).unwrap();
        let old_id = first.id();
        drop(first);
        store.sync();
        assert_eq!(store.freed_count(), 1);

        let second = store.store(&record(2)).unwrap();
        assert_ne!(second.id(), old_id);
        let pin = store.pin();
        assert!(store.read_raw(&pin, old_id).is_none());
        assert_eq!(second.read(&pin).unwrap(), record(2));
    }

    #[test]
    fn test_pin_racing_a_retirement_still_protects_it() {
        let store = Arc::new(BlockStore::new().unwrap());
        for n in 0..500 {
            let handle = store.store(&record(n)).unwrap();
            let id = handle.id();
            let retire_epoch = store.inner.epoch.load(Ordering::Acquire);
            let dropper = std::thread::spawn(move || drop(handle));
            let pin = store.pin();
            dropper.join().unwrap();
            store.sync();

            let pin_epoch = store.inner.pins.lock()[&pin.pin];
            if pin_epoch <= retire_epoch {
                assert!(store.read_raw(&pin, id).is_some(), "block {n} freed under its pin");
            }
        }
    }
}
