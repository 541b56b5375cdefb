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

//! The explicit registry of entity types. Built at startup and shared by `Arc`.

use crate::error::Error;
use crate::index::TemporalIndex;
use crate::lock::UpgradeableRwLock;
use crate::notify::QueryCache;
use crate::offheap::BlockStore;
use crate::record::{TemporalShape, VersioningStrategy};
use crate::tx::Isolation;
use ahash::AHashMap;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempora_common::util::CachePadded;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityName(Arc<str>);

impl EntityName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityName {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl Display for EntityName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static description of an entity type.
#[derive(Debug, Clone)]
pub struct EntityDef {
    pub name: EntityName,
    pub shape: TemporalShape,
    pub versioning: VersioningStrategy,
    /// Isolation used when neither the transaction nor the engine default say otherwise.
    pub isolation: Option<Isolation>,
    /// Payload attribute carrying the source / partition value that subscriptions may filter on.
    pub source_attribute: Option<Arc<str>>,
    /// Move versions closed on the processing axis into the registry's off-heap block store.
    pub off_heap_history: bool,
}

impl EntityDef {
    pub fn new(name: &str, shape: TemporalShape) -> Self {
        Self {
            name: EntityName::from(name),
            shape,
            versioning: VersioningStrategy::Counter,
            isolation: None,
            source_attribute: None,
            off_heap_history: false,
        }
    }

    pub fn with_versioning(mut self, versioning: VersioningStrategy) -> Self {
        self.versioning = versioning;
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_source_attribute(mut self, attribute: &str) -> Self {
        self.source_attribute = Some(Arc::from(attribute));
        self
    }

    pub fn with_off_heap_history(mut self) -> Self {
        self.off_heap_history = true;
        self
    }
}

/// Everything the engine keeps for one entity type.
pub struct EntityCache {
    def: EntityDef,
    index: UpgradeableRwLock<TemporalIndex>,
    /// Bumped by every commit touching the type; consulted by cached lists.
    update_count: CachePadded<AtomicU64>,
    queries: QueryCache,
}

impl EntityCache {
    fn new(def: EntityDef, blocks: Option<Arc<BlockStore>>) -> Self {
        let index = match blocks {
            Some(blocks) => TemporalIndex::with_block_store(def.name.clone(), def.shape, blocks),
            None => TemporalIndex::new(def.name.clone(), def.shape),
        };
        Self {
            def,
            index: UpgradeableRwLock::new(index),
            update_count: CachePadded::new(AtomicU64::new(0)),
            queries: QueryCache::default(),
        }
    }

    pub fn def(&self) -> &EntityDef {
        &self.def
    }

    pub fn name(&self) -> &EntityName {
        &self.def.name
    }

    pub fn shape(&self) -> TemporalShape {
        self.def.shape
    }

    pub fn index(&self) -> &UpgradeableRwLock<TemporalIndex> {
        &self.index
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Acquire)
    }

    pub(crate) fn bump_update_count(&self) -> u64 {
        self.update_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn queries(&self) -> &QueryCache {
        &self.queries
    }
}

#[derive(Default)]
pub struct Registry {
    entities: ArcSwap<AHashMap<EntityName, Arc<EntityCache>>>,
    register_lock: Mutex<()>,
    /// Started by the first entity registered with off-heap history.
    blocks: Mutex<Option<Arc<BlockStore>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: EntityDef) -> Result<Arc<EntityCache>, Error> {
        let _guard = self.register_lock.lock();
        let current = self.entities.load();
        if current.contains_key(&def.name) {
            return Err(Error::InvalidState(format!(
                "entity {} registered twice",
                def.name
            )));
        }
        info!(
            entity = %def.name,
            shape = ?def.shape,
            versioning = %def.versioning,
            off_heap = def.off_heap_history,
            "Registering entity"
        );
        let blocks = if def.off_heap_history {
            Some(self.shared_block_store()?)
        } else {
            None
        };
        let cache = Arc::new(EntityCache::new(def, blocks));
        let mut next = AHashMap::clone(&current);
        next.insert(cache.name().clone(), cache.clone());
        self.entities.store(Arc::new(next));
        Ok(cache)
    }

    fn shared_block_store(&self) -> Result<Arc<BlockStore>, Error> {
        let mut blocks = self.blocks.lock();
        if let Some(store) = blocks.as_ref() {
            return Ok(store.clone());
        }
        let store = Arc::new(BlockStore::new()?);
        *blocks = Some(store.clone());
        Ok(store)
    }

    /// The off-heap store shared by entities with off-heap history, once one is registered.
    pub fn block_store(&self) -> Option<Arc<BlockStore>> {
        self.blocks.lock().clone()
    }

    pub fn get(&self, name: &EntityName) -> Result<Arc<EntityCache>, Error> {
        self.entities
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntity(name.clone()))
    }

    pub fn names(&self) -> Vec<EntityName> {
        let mut names: Vec<_> = self.entities.load().keys().cloned().collect();
        names.sort();
        names
    }
}
