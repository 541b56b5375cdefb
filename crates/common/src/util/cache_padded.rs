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

use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};

/// Pads and aligns a value to the length of a cache line, so that hot atomics sitting next to each
/// other (lock state words, per-entity update counters) don't false-share.
///
/// 128 bytes on targets with 128-byte lines (Apple aarch64, powerpc64), 64 elsewhere. Smaller-line
/// targets simply waste a little space.
#[cfg_attr(
    any(
        all(target_arch = "aarch64", target_vendor = "apple"),
        target_arch = "powerpc64"
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        all(target_arch = "aarch64", target_vendor = "apple"),
        target_arch = "powerpc64"
    )),
    repr(align(64))
)]
#[derive(Default)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Debug> Debug for CachePadded<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CachePadded").field(&self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::CachePadded;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_alignment_at_least_a_line() {
        assert!(std::mem::align_of::<CachePadded<AtomicU64>>() >= 64);
        let padded = CachePadded::new(AtomicU64::new(3));
        padded.fetch_add(1, Ordering::Relaxed);
        assert_eq!(padded.into_inner().into_inner(), 4);
    }
}
