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

mod support;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use support::*;
use tempora_cache::batch::{
    BatchErrorHandler, BatchOp, DefaultErrorHandler, ErrorAction, RefreshingErrorHandler,
};
use tempora_cache::{
    AsOf, BatchConfig, ConflictType, Error, PartitionedExecutor, Partitioner, PrimaryKey,
    TimeRange, TxOptions, Value, VersionToken, VersionedRecord,
};

fn order_row(key: i64, n: i64) -> VersionedRecord {
    row(key, TimeRange::open(ymd(2024, 1, 1)), TimeRange::all(), qty(n))
}

fn config(workers: usize, batch_size: usize) -> BatchConfig {
    BatchConfig {
        workers,
        batch_size,
        ..BatchConfig::default()
    }
}

/// An order read now, then changed behind the caller's back.
fn stale_order(h: &Harness) -> VersionedRecord {
    h.engine
        .execute(TxOptions::default(), |tx| {
            tx.insert(&entity(ORDER), &PrimaryKey::from(1), ymd(2024, 1, 1), qty(1))
        })
        .unwrap();
    let stale = h
        .engine
        .find(&entity(ORDER), &PrimaryKey::from(1), AsOf::current())
        .unwrap()
        .unwrap();
    h.engine
        .execute(TxOptions::default(), |tx| {
            tx.set_attribute(&entity(ORDER), &PrimaryKey::from(1), ymd(2024, 1, 1), "qty", 2)
        })
        .unwrap();
    VersionedRecord::clone(&stale)
}

#[test]
fn test_parallel_inserts() {
    let h = harness();
    let mut executor = PartitionedExecutor::with_config(
        &h.engine,
        &entity(ORDER),
        Partitioner::Hash,
        config(4, 25),
        Arc::new(DefaultErrorHandler::new(3)),
    )
    .unwrap();
    assert_eq!(executor.partitions(), 4);
    for k in 0..400 {
        executor.add_for_insert(order_row(k, k)).unwrap();
    }
    let report = executor.wait_until_finished().unwrap();
    assert_eq!(report.inserted, 400);
    assert_eq!(report.retries, 0);
    assert!(report.units >= 16);

    assert_eq!(h.provider.current_rows(&entity(ORDER)).len(), 400);
    let found = h
        .engine
        .find(&entity(ORDER), &PrimaryKey::from(123), AsOf::current())
        .unwrap()
        .unwrap();
    assert_eq!(found.payload.get("qty"), Some(&Value::Int(123)));
    assert_eq!(found.version, VersionToken::Counter(1));
}

#[test]
fn test_stale_update_fails_without_refresh() {
    let h = harness();
    let stale = stale_order(&h);
    let mut executor = PartitionedExecutor::with_config(
        &h.engine,
        &entity(ORDER),
        Partitioner::Hash,
        config(2, 10),
        Arc::new(DefaultErrorHandler::new(3)),
    )
    .unwrap();
    let new = order_row(1, 9);
    executor.add_for_update(stale, new).unwrap();
    let err = executor.wait_until_finished().unwrap_err();
    let source = match err {
        Error::PartitionWorkerFailure { source, .. } => source,
        other => panic!("expected a partition failure, got {other:?}"),
    };
    let info = source.conflict_info().unwrap();
    assert_eq!(info.conflict_type, ConflictType::StaleRead);
    assert_eq!(info.observed, Some(VersionToken::Counter(1)));
    assert_eq!(info.current, Some(VersionToken::Counter(2)));

    let current = h
        .engine
        .find(&entity(ORDER), &PrimaryKey::from(1), AsOf::current())
        .unwrap()
        .unwrap();
    assert_eq!(current.payload.get("qty"), Some(&Value::Int(2)));
}

#[test]
fn test_stale_update_succeeds_after_refresh() {
    let h = harness();
    let stale = stale_order(&h);
    let mut executor = PartitionedExecutor::with_config(
        &h.engine,
        &entity(ORDER),
        Partitioner::Hash,
        config(2, 10),
        Arc::new(RefreshingErrorHandler::new(3)),
    )
    .unwrap();
    executor.add_for_update(stale, order_row(1, 9)).unwrap();
    let report = executor.wait_until_finished().unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.retries, 1);

    let current = h
        .engine
        .find(&entity(ORDER), &PrimaryKey::from(1), AsOf::current())
        .unwrap()
        .unwrap();
    assert_eq!(current.payload.get("qty"), Some(&Value::Int(9)));
    assert_eq!(current.version, VersionToken::Counter(3));
}

#[test]
fn test_range_partitions_terminate() {
    let h = harness();
    let splits = Partitioner::ranges(vec![PrimaryKey::from(50)]);
    let mut executor = PartitionedExecutor::with_config(
        &h.engine,
        &entity(ORDER),
        splits.clone(),
        config(8, 20),
        Arc::new(DefaultErrorHandler::new(3)),
    )
    .unwrap();
    assert_eq!(executor.partitions(), 2);
    for k in 0..100 {
        executor.add_for_insert(order_row(k, 1)).unwrap();
    }
    assert_eq!(executor.wait_until_finished().unwrap().inserted, 100);

    let mut executor = PartitionedExecutor::with_config(
        &h.engine,
        &entity(ORDER),
        splits,
        config(8, 20),
        Arc::new(DefaultErrorHandler::new(3)),
    )
    .unwrap();
    for k in 0..100 {
        let live = h
            .engine
            .find(&entity(ORDER), &PrimaryKey::from(k), AsOf::current())
            .unwrap()
            .unwrap();
        executor
            .add_for_termination_at(VersionedRecord::clone(&live), ymd(2024, 6, 1))
            .unwrap();
    }
    let report = executor.wait_until_finished().unwrap();
    assert_eq!(report.terminated, 100);

    let key = PrimaryKey::from(77);
    assert!(
        h.engine
            .find(&entity(ORDER), &key, AsOf::at(ymd(2024, 7, 1)))
            .unwrap()
            .is_none()
    );
    assert!(
        h.engine
            .find(&entity(ORDER), &key, AsOf::at(ymd(2024, 3, 1)))
            .unwrap()
            .is_some()
    );
}

#[test]
fn test_bulk_insert_reports_overlaps() {
    let h = harness();
    let mut batch = config(2, 50);
    batch.bulk_insert = true;
    let mut executor = PartitionedExecutor::with_config(
        &h.engine,
        &entity(ORDER),
        Partitioner::Hash,
        batch,
        Arc::new(DefaultErrorHandler::new(3)),
    )
    .unwrap();
    executor.add_for_insert(order_row(5, 1)).unwrap();
    executor
        .add_for_insert(row(
            5,
            TimeRange::open(ymd(2024, 6, 1)),
            TimeRange::all(),
            qty(2),
        ))
        .unwrap();
    executor.add_for_insert(order_row(6, 1)).unwrap();
    let report = executor.wait_until_finished().unwrap();
    assert_eq!(report.inserted, 3);
    assert_eq!(report.overlaps.len(), 1);
    assert_eq!(report.overlaps[0].key, PrimaryKey::from(5));
    assert_eq!(report.overlaps[0].records.len(), 2);

    // Rows stay resident and stored, with the commit's system time.
    let cache = h.engine.registry().get(&entity(ORDER)).unwrap();
    assert_eq!(cache.index().read().len(), 3);
    let stored = h.provider.current_rows(&entity(ORDER));
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|r| r.system.is_open() && r.version == VersionToken::Counter(1)));
}

#[test]
fn test_bulk_mode_keeps_insert_before_update() {
    let h = harness();
    let mut batch = config(1, 50);
    batch.bulk_insert = true;
    let mut executor = PartitionedExecutor::with_config(
        &h.engine,
        &entity(ORDER),
        Partitioner::Hash,
        batch,
        Arc::new(DefaultErrorHandler::new(1)),
    )
    .unwrap();
    executor.add_for_insert(order_row(5, 1)).unwrap();
    executor
        .add_for_update(order_row(5, 1), order_row(5, 9))
        .unwrap();
    executor.add_for_insert(order_row(6, 1)).unwrap();
    let report = executor.wait_until_finished().unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 0);

    let found = h
        .engine
        .find(&entity(ORDER), &PrimaryKey::from(5), AsOf::current())
        .unwrap()
        .unwrap();
    assert_eq!(found.payload.get("qty"), Some(&Value::Int(9)));
    assert_eq!(h.provider.current_rows(&entity(ORDER)).len(), 2);
}

/// Skips units that fail for any reason, counting how often it was asked.
#[derive(Default)]
struct SkipAll {
    calls: AtomicUsize,
}

impl BatchErrorHandler for SkipAll {
    fn on_error(&self, _: usize, _: usize, ops: &[BatchOp], _: &Error) -> ErrorAction {
        self.calls.fetch_add(ops.len(), Ordering::Relaxed);
        ErrorAction::Skip
    }
}

#[test]
fn test_skipped_units_do_not_fail_batch() {
    let h = harness();
    h.engine
        .execute(TxOptions::default(), |tx| {
            tx.insert(&entity(ORDER), &PrimaryKey::from(3), ymd(2024, 1, 1), qty(1))
        })
        .unwrap();
    let handler = Arc::new(SkipAll::default());
    let mut executor = PartitionedExecutor::with_config(
        &h.engine,
        &entity(ORDER),
        Partitioner::Hash,
        config(1, 1),
        handler.clone(),
    )
    .unwrap();
    for k in 1..=4 {
        executor.add_for_insert(order_row(k, 5)).unwrap();
    }
    let report = executor.wait_until_finished().unwrap();
    assert_eq!(report.inserted, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(handler.calls.load(Ordering::Relaxed), 1);
    assert_eq!(h.provider.current_rows(&entity(ORDER)).len(), 4);
}
