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

//! An in-memory bitemporal cache with transactional concurrency control.
//!
//! Records are versioned along a business axis and a processing (system) axis. Each entity type has
//! a [`TemporalIndex`] guarded by an [`UpgradeableRwLock`]; transactions buffer their writes and,
//! at commit, validate what they read, write through to the [`Provider`], milestone the index and
//! publish [`ChangeEvent`]s to subscribers and to other processes.

pub mod batch;
pub mod config;
pub mod engine;
mod error;
pub mod index;
pub mod lock;
pub mod notify;
pub mod offheap;
pub mod provider;
pub mod record;
pub mod registry;
pub mod tx;

pub use batch::{BatchReport, PartitionedExecutor, Partitioner};
pub use config::{BatchConfig, EngineConfig};
pub use engine::{ChunkedFailure, ChunkedOutcome, Engine};
pub use error::{ConflictInfo, ConflictType, Error};
pub use index::{OverlapSet, TemporalIndex};
pub use lock::{Upgrade, UpgradeableRwLock};
pub use notify::{
    ChangeEvent, ChangeListener, EventKind, NotificationManager, PredicateKey, SourceFilter,
};
pub use provider::{MemoryProvider, Mutation, Provider};
pub use record::{
    AsOf, Axis, KeyPart, Payload, PrimaryKey, TemporalShape, TimeRange, Timestamp, Value,
    VersionToken, VersioningStrategy, VersionedRecord,
};
pub use registry::{EntityDef, EntityName, Registry};
pub use tx::{Isolation, Transaction, TxId, TxOptions, TxState};
