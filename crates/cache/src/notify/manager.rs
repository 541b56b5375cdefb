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

//! Subscription bookkeeping, the background dispatcher, and inbound event application.
//!
//! Local commits publish their events here. They are handed to the outbound transport right away
//! and queued for the dispatcher thread, which invokes listeners one at a time so that each
//! listener sees events in publication order. Subscriptions hold their targets weakly; a target
//! that has been dropped is pruned the next time an event for its entity is dispatched.

use crate::error::Error;
use crate::index::TemporalIndex;
use crate::notify::{
    CachedList, ChangeEvent, ChangeListener, EventKind, NotificationTransport, ProcessId,
    SourceFilter,
};
use crate::record::{PrimaryKey, Timestamp, VersionedRecord};
use crate::registry::{EntityName, Registry};
use crate::tx::TxId;
use ahash::{AHashMap, AHashSet};
use flume::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// What `on_receive` did with an inbound event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Inbound {
    Applied { records_changed: usize },
    /// Already seen within the dedupe window.
    Duplicate,
    /// Published by this very process.
    OwnEcho,
}

enum Target {
    Class(Weak<dyn ChangeListener>),
    List(Weak<CachedList>),
}

struct Registration {
    id: SubscriptionId,
    target: Target,
    filter: Option<SourceFilter>,
    /// Events originating from this transaction are not delivered back to it.
    owner: Option<TxId>,
    deliveries: AtomicU64,
    failures: AtomicU64,
}

impl Registration {
    fn is_alive(&self) -> bool {
        match &self.target {
            Target::Class(l) => l.strong_count() > 0,
            Target::List(l) => l.strong_count() > 0,
        }
    }
}

enum Command {
    Dispatch(Vec<ChangeEvent>),
    Barrier(oneshot::Sender<()>),
}

/// Remembers the most recent event ids, oldest evicted first.
struct DedupWindow {
    order: VecDeque<(ProcessId, u64)>,
    seen: AHashSet<(ProcessId, u64)>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: AHashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// False if the id was already in the window.
    fn insert(&mut self, id: (ProcessId, u64)) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        true
    }
}

struct Shared {
    process: ProcessId,
    registry: Arc<Registry>,
    subscriptions: RwLock<AHashMap<EntityName, Vec<Arc<Registration>>>>,
}

impl Shared {
    fn deliver(&self, event: &ChangeEvent) {
        let registrations = self
            .subscriptions
            .read()
            .get(&event.entity)
            .cloned()
            .unwrap_or_default();
        let mut saw_dead = false;
        for reg in &registrations {
            if event.process == self.process && reg.owner == Some(event.origin) {
                continue;
            }
            if let Some(filter) = &reg.filter
                && !filter.matches(event.source.as_ref())
            {
                continue;
            }
            match &reg.target {
                Target::Class(listener) => {
                    let Some(listener) = listener.upgrade() else {
                        saw_dead = true;
                        continue;
                    };
                    let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_change(event)));
                    let failure = match outcome {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(panic) => Some(panic_message(panic.as_ref())),
                    };
                    match failure {
                        None => {
                            reg.deliveries.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(message) => {
                            reg.failures.fetch_add(1, Ordering::Relaxed);
                            let error = Error::ListenerFailure(message);
                            warn!(subscription = %reg.id, entity = %event.entity, %error,
                                "Listener failed; continuing with the rest");
                        }
                    }
                }
                Target::List(list) => {
                    let Some(list) = list.upgrade() else {
                        saw_dead = true;
                        continue;
                    };
                    if list.is_affected_by(event) {
                        list.mark_stale();
                        reg.deliveries.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        if saw_dead {
            self.prune(&event.entity);
        }
    }

    fn prune(&self, entity: &EntityName) {
        let mut subscriptions = self.subscriptions.write();
        if let Some(registrations) = subscriptions.get_mut(entity) {
            let before = registrations.len();
            registrations.retain(|r| r.is_alive());
            trace!(%entity, pruned = before - registrations.len(), "Pruned dead subscriptions");
        }
    }

    /// Bring the local index in line with a remote change. Only moves versions forward, so
    /// applying an event twice is harmless.
    fn apply_inbound(&self, event: &ChangeEvent) -> Result<usize, Error> {
        let cache = self.registry.get(&event.entity)?;
        let processing = cache.shape().tracks_processing();
        let mut index = cache.index().write();
        let mut changed = 0;
        match event.kind {
            EventKind::Insert | EventKind::Update => {
                let mut by_key: Vec<(&PrimaryKey, Vec<&VersionedRecord>)> = vec![];
                for snapshot in &event.snapshots {
                    match by_key.iter_mut().find(|(k, _)| **k == snapshot.primary_key) {
                        Some((_, rows)) => rows.push(snapshot),
                        None => by_key.push((&snapshot.primary_key, vec![snapshot])),
                    }
                }
                for (key, rows) in by_key {
                    // Not resident: the next read loads the full history from the provider.
                    if !index.contains_key(key) {
                        continue;
                    }
                    let incoming = rows.iter().map(|r| r.version).max();
                    if index.key_version(key) >= incoming {
                        continue;
                    }
                    match replace_current(&mut index, key, &rows, processing) {
                        Ok(n) => changed += n,
                        Err(e) => {
                            // Half-applied; the next read reloads the key from the provider.
                            warn!(entity = %event.entity, %key, error = %e,
                                "Inbound rows do not fit the resident history; evicting key");
                            changed += index.remove_key(key).len();
                        }
                    }
                }
            }
            EventKind::Delete => {
                // Evict; the next read reloads the key's full history from the provider.
                for key in &event.keys {
                    let removed_version = event
                        .snapshots
                        .iter()
                        .filter(|r| r.primary_key == *key)
                        .map(|r| r.version)
                        .max();
                    let live = index.key_version(key);
                    if live.is_some() && (removed_version.is_none() || live <= removed_version) {
                        changed += index.remove_key(key).len();
                    }
                }
            }
            EventKind::MassDelete => {
                changed = index.len();
                index.clear();
            }
        }
        drop(index);
        if changed > 0 || event.kind == EventKind::MassDelete {
            cache.bump_update_count();
        }
        Ok(changed)
    }
}

/// Close (or drop) the key's current rows and install `rows` in their place.
fn replace_current(
    index: &mut TemporalIndex,
    key: &PrimaryKey,
    rows: &[&VersionedRecord],
    processing: bool,
) -> Result<usize, Error> {
    let mut changed = 0;
    // Rows the writer left unchanged carry older system times than the ones it wrote.
    let written_at = rows
        .iter()
        .map(|r| r.system.from)
        .max()
        .unwrap_or(Timestamp::MIN);
    for live in index.current_versions(key) {
        if processing {
            let at = Timestamp(written_at.0.max(live.system.from.0));
            index.put(live.with_system_closed(at))?;
        } else {
            index.remove(&live);
        }
        changed += 1;
    }
    for row in rows {
        index.put(VersionedRecord::clone(row))?;
        changed += 1;
    }
    Ok(changed)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

pub struct NotificationManager {
    shared: Arc<Shared>,
    transport: Arc<dyn NotificationTransport>,
    sender: Sender<Command>,
    kill_switch: Arc<AtomicBool>,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
    dedup: Mutex<DedupWindow>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationManager {
    pub fn new(
        process: ProcessId,
        registry: Arc<Registry>,
        transport: Arc<dyn NotificationTransport>,
        dedup_window: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            process,
            registry,
            subscriptions: RwLock::new(AHashMap::new()),
        });
        let kill_switch = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = flume::unbounded();

        let dispatcher_shared = shared.clone();
        let ks = kill_switch.clone();
        let join_handle = std::thread::Builder::new()
            .name("tempora-notify".to_string())
            .spawn(move || Self::dispatch_loop(dispatcher_shared, receiver, ks))
            .expect("failed to spawn notification dispatcher thread");

        Self {
            shared,
            transport,
            sender,
            kill_switch,
            next_subscription: AtomicU64::new(1),
            sequence: AtomicU64::new(1),
            dedup: Mutex::new(DedupWindow::new(dedup_window)),
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    fn dispatch_loop(
        shared: Arc<Shared>,
        receiver: Receiver<Command>,
        kill_switch: Arc<AtomicBool>,
    ) {
        while let Ok(command) = receiver.recv() {
            match command {
                Command::Dispatch(events) => {
                    for event in &events {
                        shared.deliver(event);
                    }
                }
                Command::Barrier(reply) => {
                    reply.send(()).ok();
                }
            }
            if kill_switch.load(Ordering::Relaxed) && receiver.is_empty() {
                break;
            }
        }
        debug!("Notification dispatcher exiting");
    }

    pub fn process(&self) -> ProcessId {
        self.shared.process
    }

    fn register(
        &self,
        entity: &EntityName,
        target: Target,
        filter: Option<SourceFilter>,
        owner: Option<TxId>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let registration = Arc::new(Registration {
            id,
            target,
            filter,
            owner,
            deliveries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });
        self.shared
            .subscriptions
            .write()
            .entry(entity.clone())
            .or_default()
            .push(registration);
        id
    }

    /// Subscribe `listener` to every change of `entity`. Only a weak reference is kept.
    pub fn register_class_listener<L>(
        &self,
        entity: &EntityName,
        listener: &Arc<L>,
        filter: Option<SourceFilter>,
        owner: Option<TxId>,
    ) -> Result<SubscriptionId, Error>
    where
        L: ChangeListener + 'static,
    {
        self.shared.registry.get(entity)?;
        let weak: Weak<dyn ChangeListener> = Arc::downgrade(listener) as Weak<dyn ChangeListener>;
        Ok(self.register(entity, Target::Class(weak), filter, owner))
    }

    /// Subscribe a cached list so that relevant changes mark it stale.
    pub fn register_list(
        &self,
        list: &Arc<CachedList>,
        filter: Option<SourceFilter>,
    ) -> Result<SubscriptionId, Error> {
        self.shared.registry.get(list.entity())?;
        Ok(self.register(
            list.entity(),
            Target::List(Arc::downgrade(list)),
            filter,
            None,
        ))
    }

    pub fn deregister(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.shared.subscriptions.write();
        for registrations in subscriptions.values_mut() {
            if let Some(pos) = registrations.iter().position(|r| r.id == id) {
                registrations.remove(pos);
                return true;
            }
        }
        false
    }

    fn find(&self, id: SubscriptionId) -> Option<Arc<Registration>> {
        self.shared
            .subscriptions
            .read()
            .values()
            .flatten()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Registrations held for `entity`, dead ones included until they are pruned.
    pub fn subscription_count(&self, entity: &EntityName) -> usize {
        self.shared
            .subscriptions
            .read()
            .get(entity)
            .map_or(0, |r| r.len())
    }

    pub fn failure_count(&self, id: SubscriptionId) -> Option<u64> {
        self.find(id).map(|r| r.failures.load(Ordering::Relaxed))
    }

    pub fn delivery_count(&self, id: SubscriptionId) -> Option<u64> {
        self.find(id).map(|r| r.deliveries.load(Ordering::Relaxed))
    }

    /// Stamp and send out events from a local commit.
    pub fn publish(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let events: Vec<_> = events
            .into_iter()
            .map(|mut e| {
                e.process = self.shared.process;
                e.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                e
            })
            .collect();
        for event in &events {
            if let Err(e) = self.transport.publish(event) {
                warn!(entity = %event.entity, sequence = event.sequence, error = %e,
                    "Failed to publish event");
            }
        }
        if self.sender.send(Command::Dispatch(events)).is_err() {
            warn!("Notification dispatcher is gone; dropping local events");
        }
    }

    /// Apply an event received from another process, then dispatch it locally.
    pub fn on_receive(&self, event: ChangeEvent) -> Result<Inbound, Error> {
        if self.kill_switch.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if event.process == self.shared.process {
            return Ok(Inbound::OwnEcho);
        }
        if !self.dedup.lock().insert((event.process, event.sequence)) {
            trace!(process = %event.process, sequence = event.sequence, "Duplicate event");
            return Ok(Inbound::Duplicate);
        }
        let records_changed = self.shared.apply_inbound(&event)?;
        self.sender
            .send(Command::Dispatch(vec![event]))
            .map_err(|_| Error::Shutdown)?;
        Ok(Inbound::Applied { records_changed })
    }

    /// Block until everything queued before this call has been dispatched.
    pub fn wait_until_idle(&self) {
        let (reply, done) = oneshot::channel();
        if self.sender.send(Command::Barrier(reply)).is_ok() {
            done.recv().ok();
        }
    }

    /// Drain queued events and stop the dispatcher.
    pub fn shutdown(&self) {
        if self.kill_switch.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the dispatcher so it notices the kill switch even when idle.
        let (reply, _done) = oneshot::channel();
        self.sender.send(Command::Barrier(reply)).ok();
        if let Some(handle) = self.join_handle.lock().take() {
            if handle.join().is_err() {
                warn!("Notification dispatcher panicked");
            }
            info!("Notification dispatcher stopped");
        }
    }
}

impl Drop for NotificationManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ListenerError, NullTransport};

    fn ids(n: u64) -> Vec<(ProcessId, u64)> {
        let p = ProcessId::generate();
        (0..n).map(|i| (p, i)).collect()
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        let ids = ids(3);
        assert!(window.insert(ids[0]));
        assert!(!window.insert(ids[0]));
        assert!(window.insert(ids[1]));
        assert!(window.insert(ids[2]));
        // ids[0] fell out of the window.
        assert!(window.insert(ids[0]));
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = Arc::new(Registry::new());
        registry
            .register(crate::registry::EntityDef::new(
                "e",
                crate::record::TemporalShape::NonDated,
            ))
            .unwrap();
        let manager =
            NotificationManager::new(ProcessId::generate(), registry, Arc::new(NullTransport), 16);
        let entity = EntityName::from("e");

        let bad = Arc::new(|_: &ChangeEvent| -> Result<(), ListenerError> { panic!("boom") });
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_listener = seen.clone();
        let good = Arc::new(move |_: &ChangeEvent| -> Result<(), ListenerError> {
            seen_in_listener.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let bad_id = manager
            .register_class_listener(&entity, &bad, None, None)
            .unwrap();
        let good_id = manager
            .register_class_listener(&entity, &good, None, None)
            .unwrap();

        manager.publish(vec![ChangeEvent::new(entity.clone(), EventKind::Insert, TxId(1))]);
        manager.wait_until_idle();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(manager.failure_count(bad_id), Some(1));
        assert_eq!(manager.delivery_count(good_id), Some(1));
        manager.shutdown();
        assert_eq!(
            manager.on_receive(ChangeEvent::new(entity, EventKind::Insert, TxId(2))),
            Err(Error::Shutdown)
        );
    }
}
