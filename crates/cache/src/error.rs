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

use crate::record::{PrimaryKey, VersionToken};
use crate::registry::EntityName;
use crate::tx::TxId;
use std::fmt::{Display, Formatter};

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub enum ConflictType {
    /// The version observed at read time is no longer current.
    StaleRead,
    /// Someone else created the key after we saw it absent.
    ConcurrentInsert,
    /// Someone else removed the key after we read it.
    ConcurrentDelete,
    /// A younger transaction asked for a key lock held by an older one.
    LockWaitDie,
}

/// Details about a detected conflict, for diagnostics and retry decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub entity: EntityName,
    pub key: PrimaryKey,
    pub conflict_type: ConflictType,
    pub observed: Option<VersionToken>,
    pub current: Option<VersionToken>,
}

impl Display for ConflictInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<VersionToken>| match v {
            Some(v) => v.to_string(),
            None => "absent".to_string(),
        };
        write!(
            f,
            "{} on {}{}: observed {}, current {}",
            self.conflict_type,
            self.entity,
            self.key,
            show(&self.observed),
            show(&self.current)
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Conflict detected: {0}")]
    Conflict(ConflictInfo),
    #[error("Overlapping current records for {entity}{key}")]
    Overlap { entity: EntityName, key: PrimaryKey },
    #[error("Transaction {0} exceeded its deadline")]
    Timeout(TxId),
    #[error("Listener failure: {0}")]
    ListenerFailure(String),
    #[error("Partition {partition} worker failed: {source}")]
    PartitionWorkerFailure {
        partition: usize,
        source: Box<Error>,
    },
    #[error("Duplicate current record for {entity}{key}")]
    Duplicate { entity: EntityName, key: PrimaryKey },
    #[error("No current record for {entity}{key}")]
    NotFound { entity: EntityName, key: PrimaryKey },
    #[error("Unknown entity type: {0}")]
    UnknownEntity(EntityName),
    #[error("Backing store failure: {0}")]
    Provider(String),
    #[error("Encoding failure: {0}")]
    Encoding(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Engine is shut down")]
    Shutdown,
}

impl Error {
    /// Whether re-running the whole transaction body from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::PartitionWorkerFailure { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn conflict_info(&self) -> Option<&ConflictInfo> {
        match self {
            Error::Conflict(info) => Some(info),
            _ => None,
        }
    }
}
