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

//! Change events and their delivery: to class-level listeners, to cached result lists, and across
//! processes through a [`NotificationTransport`].

mod list_cache;
mod manager;
mod transport;

pub use list_cache::{CachedList, ListKind, QueryCache};
pub use manager::{Inbound, NotificationManager, SubscriptionId};
pub use transport::{ChannelTransport, NotificationTransport, NullTransport, drain_into};

use crate::error::Error;
use crate::record::{PrimaryKey, Value, VersionedRecord};
use crate::registry::EntityName;
use crate::tx::TxId;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    /// An operation-defined delete. Carries the predicate, never rows.
    MassDelete,
}

/// Opaque identity of a query, as the query layer defines it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PredicateKey(Arc<str>);

impl PredicateKey {
    pub fn new(key: &str) -> Self {
        Self(Arc::from(key))
    }
}

impl Display for PredicateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one engine instance, used to drop our own events when they come back.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    fn unassigned() -> Self {
        Self(Uuid::nil())
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub process: ProcessId,
    /// Per-process publication order; with `process`, identifies the event.
    pub sequence: u64,
    pub entity: EntityName,
    pub kind: EventKind,
    pub keys: Vec<PrimaryKey>,
    /// New current records for inserts and updates; the removed records for deletes.
    pub snapshots: Vec<VersionedRecord>,
    pub predicate: Option<PredicateKey>,
    pub origin: TxId,
    /// Value of the entity's source attribute, when it has one.
    pub source: Option<Value>,
}

impl ChangeEvent {
    /// A fresh event. The process id and sequence are assigned on publication.
    pub fn new(entity: EntityName, kind: EventKind, origin: TxId) -> Self {
        Self {
            process: ProcessId::unassigned(),
            sequence: 0,
            entity,
            kind,
            keys: vec![],
            snapshots: vec![],
            predicate: None,
            origin,
            source: None,
        }
    }

    pub fn with_keys(mut self, keys: Vec<PrimaryKey>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Vec<VersionedRecord>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_predicate(mut self, predicate: PredicateKey) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_source(mut self, source: Option<Value>) -> Self {
        self.source = source;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::Encoding(e.to_string()))
    }
}

/// Restricts delivery to events whose source attribute is one of the given values. Events without
/// a source value always pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFilter(Vec<Value>);

impl SourceFilter {
    pub fn new(values: impl IntoIterator<Item = Value>) -> Self {
        Self(values.into_iter().collect())
    }

    pub fn matches(&self, source: Option<&Value>) -> bool {
        match source {
            None => true,
            Some(v) => self.0.contains(v),
        }
    }
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError>;
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        self(event)
    }
}
