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

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use tempora_cache::notify::{ChangeListener, ListenerError, NullTransport};
use tempora_cache::{
    Axis, ChangeEvent, Engine, EngineConfig, EntityDef, EntityName, MemoryProvider, Payload,
    PrimaryKey, Provider, Registry, TemporalShape, TimeRange, Timestamp, VersionToken,
    VersionedRecord,
};

pub const ORDER: &str = "order";
pub const ACCOUNT: &str = "account";
pub const AUDIT: &str = "audit";
pub const PRICE: &str = "price";

pub struct Harness {
    pub engine: Arc<Engine>,
    pub provider: Arc<MemoryProvider>,
}

pub fn entity(name: &str) -> EntityName {
    EntityName::from(name)
}

pub fn registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    for def in [
        EntityDef::new(ORDER, TemporalShape::Bitemporal).with_source_attribute("desk"),
        EntityDef::new(ACCOUNT, TemporalShape::NonDated),
        EntityDef::new(AUDIT, TemporalShape::UniDated(Axis::Processing)),
        EntityDef::new(PRICE, TemporalShape::UniDated(Axis::Business)),
    ] {
        registry.register(def).unwrap();
    }
    registry
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::default(), MemoryProvider::new())
}

pub fn harness_with(config: EngineConfig, provider: MemoryProvider) -> Harness {
    tempora_common::tracing::init_test_tracing();
    let provider = Arc::new(provider);
    let engine = Engine::new(
        config,
        registry(),
        provider.clone() as Arc<dyn Provider>,
        Arc::new(NullTransport),
    );
    Harness { engine, provider }
}

pub fn ymd(year: i32, month: u32, day: u32) -> Timestamp {
    Timestamp::from_ymd(year, month, day).unwrap()
}

pub fn qty(n: i64) -> Payload {
    Payload::new().with("qty", n)
}

/// A committed-looking row for seeding the provider.
pub fn row(key: i64, business: TimeRange, system: TimeRange, payload: Payload) -> VersionedRecord {
    VersionedRecord::new(
        PrimaryKey::from(key),
        business,
        system,
        payload,
        VersionToken::Counter(1),
    )
}

/// A non-dated row.
pub fn flat_row(key: i64, payload: Payload) -> VersionedRecord {
    row(key, TimeRange::all(), TimeRange::all(), payload)
}

/// Listener that keeps every event it sees.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<ChangeEvent>>,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn kinds(&self) -> Vec<tempora_cache::EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl ChangeListener for Recorder {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
