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

use crate::record::PrimaryKey;
use ahash::RandomState;

// Fixed seeds: a key must land on the same worker for the life of the process.
const SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Decides which worker owns a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Partitioner {
    /// Stable hash of the key, modulo the worker count.
    Hash,
    /// Contiguous key ranges. `n` sorted split points give `n + 1` partitions; partition `i` holds
    /// keys below split point `i`.
    Ranges(Vec<PrimaryKey>),
}

impl Partitioner {
    pub fn ranges(mut splits: Vec<PrimaryKey>) -> Self {
        splits.sort();
        splits.dedup();
        Partitioner::Ranges(splits)
    }

    /// Number of partitions, and so of workers, for a pool sized `workers`.
    pub fn partitions(&self, workers: usize) -> usize {
        match self {
            Partitioner::Hash => workers.max(1),
            Partitioner::Ranges(splits) => splits.len() + 1,
        }
    }

    pub fn partition_of(&self, key: &PrimaryKey, partitions: usize) -> usize {
        match self {
            Partitioner::Hash => {
                let hasher = RandomState::with_seeds(SEEDS.0, SEEDS.1, SEEDS.2, SEEDS.3);
                (hasher.hash_one(key) % partitions.max(1) as u64) as usize
            }
            Partitioner::Ranges(splits) => splits.partition_point(|split| split <= key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_hash_is_stable_and_in_range() {
        let p = Partitioner::Hash;
        for i in 0..200 {
            let key = PrimaryKey::from(i);
            let a = p.partition_of(&key, 7);
            assert!(a < 7);
            assert_eq!(a, p.partition_of(&key, 7));
        }
    }

    #[test]
    fn test_hash_spreads_keys() {
        let p = Partitioner::Hash;
        let mut used = [false; 4];
        for i in 0..200 {
            used[p.partition_of(&PrimaryKey::from(i), 4)] = true;
        }
        assert!(used.iter().all(|u| *u));
    }

    #[test_case(5, 0; "below first split")]
    #[test_case(10, 1; "split point opens its partition")]
    #[test_case(15, 1; "between splits")]
    #[test_case(20, 2; "second split")]
    #[test_case(1000, 2; "above last split")]
    fn test_range_partitions(key: i64, expected: usize) {
        let p = Partitioner::ranges(vec![PrimaryKey::from(20), PrimaryKey::from(10)]);
        assert_eq!(p.partitions(8), 3);
        assert_eq!(p.partition_of(&PrimaryKey::from(key), 3), expected);
    }
}
