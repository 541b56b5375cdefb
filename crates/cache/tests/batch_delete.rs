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
use std::time::Duration;
use support::*;
use tempora_cache::{
    AsOf, ChunkedOutcome, EngineConfig, Error, MemoryProvider, PrimaryKey, TxOptions, Value,
};

fn seeded(rows: i64, provider: MemoryProvider) -> Harness {
    let h = harness_with(EngineConfig::default(), provider);
    let payloads = (0..rows).map(|k| flat_row(k, qty(k).with("book", "north")));
    h.provider.seed(&entity(ACCOUNT), payloads);
    h
}

#[test]
fn test_chunks_outlast_single_transaction_timeout() {
    let h = seeded(
        5000,
        MemoryProvider::new().with_commit_delay(Duration::from_millis(20)),
    );
    let options = TxOptions::default().with_timeout(Duration::from_millis(200));
    let outcome = h
        .engine
        .delete_all_in_batches(&entity(ACCOUNT), |_| true, 500, options)
        .unwrap();
    assert_eq!(outcome, ChunkedOutcome { rows: 5000, chunks: 10 });
    assert!(h.provider.rows(&entity(ACCOUNT)).is_empty());
    assert_eq!(h.provider.commit_count(), 10);
}

#[test]
fn test_failed_chunk_keeps_earlier_chunks() {
    let h = seeded(1000, MemoryProvider::new());
    h.provider.fail_commit_at(3);
    let failure = h
        .engine
        .delete_all_in_batches(&entity(ACCOUNT), |_| true, 100, TxOptions::default())
        .unwrap_err();
    assert_eq!(failure.completed, ChunkedOutcome { rows: 300, chunks: 3 });
    assert!(matches!(failure.error, Error::Provider(_)));
    assert_eq!(h.provider.rows(&entity(ACCOUNT)).len(), 700);
    assert_eq!(h.provider.staged_transactions(), 0);

    // The failed chunk's keys are untouched, in the store and in the cache.
    let survivor = h
        .engine
        .find(&entity(ACCOUNT), &PrimaryKey::from(350), AsOf::current())
        .unwrap()
        .unwrap();
    assert_eq!(survivor.payload.get("qty"), Some(&Value::Int(350)));
    assert!(
        h.engine
            .find(&entity(ACCOUNT), &PrimaryKey::from(150), AsOf::current())
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_filter_selects_rows() {
    let h = seeded(20, MemoryProvider::new());
    let outcome = h
        .engine
        .delete_all_in_batches(
            &entity(ACCOUNT),
            |r| matches!(r.payload.get("qty"), Some(Value::Int(n)) if n % 2 == 0),
            3,
            TxOptions::default(),
        )
        .unwrap();
    assert_eq!(outcome, ChunkedOutcome { rows: 10, chunks: 4 });
    let left: Vec<_> = h
        .provider
        .rows(&entity(ACCOUNT))
        .into_iter()
        .map(|r| r.primary_key)
        .collect();
    assert_eq!(left.len(), 10);
    assert!(left.contains(&PrimaryKey::from(1)));
    assert!(!left.contains(&PrimaryKey::from(2)));
}

#[test]
fn test_nothing_to_delete() {
    let h = seeded(0, MemoryProvider::new());
    let outcome = h
        .engine
        .delete_all_in_batches(&entity(ACCOUNT), |_| true, 10, TxOptions::default())
        .unwrap();
    assert_eq!(outcome, ChunkedOutcome::default());
    assert_eq!(h.provider.commit_count(), 0);
}
