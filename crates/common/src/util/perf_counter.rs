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

//! Optional performance counters for the commit path. With the `perf_counters` feature disabled
//! every counter operation compiles to nothing.

#[cfg(feature = "perf_counters")]
use fast_counter::ConcurrentCounter;
#[cfg(feature = "perf_counters")]
use minstant::Instant;

/// No-op stand-in for a concurrent counter when perf counters are disabled.
#[cfg(not(feature = "perf_counters"))]
pub struct DummyCounter;

#[cfg(not(feature = "perf_counters"))]
impl DummyCounter {
    #[inline]
    pub fn add(&self, _value: isize) {}

    #[inline]
    pub fn sum(&self) -> isize {
        0
    }
}

pub struct PerfCounter {
    pub operation: &'static str,
    #[cfg(feature = "perf_counters")]
    invocations: ConcurrentCounter,
    #[cfg(feature = "perf_counters")]
    cumulative_duration_nanos: ConcurrentCounter,
}

impl PerfCounter {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            #[cfg(feature = "perf_counters")]
            invocations: ConcurrentCounter::new(0),
            #[cfg(feature = "perf_counters")]
            cumulative_duration_nanos: ConcurrentCounter::new(0),
        }
    }

    #[cfg(feature = "perf_counters")]
    pub fn invocations(&self) -> &ConcurrentCounter {
        &self.invocations
    }

    #[cfg(feature = "perf_counters")]
    pub fn cumulative_duration_nanos(&self) -> &ConcurrentCounter {
        &self.cumulative_duration_nanos
    }

    #[cfg(not(feature = "perf_counters"))]
    pub fn invocations(&self) -> DummyCounter {
        DummyCounter
    }

    #[cfg(not(feature = "perf_counters"))]
    pub fn cumulative_duration_nanos(&self) -> DummyCounter {
        DummyCounter
    }
}

/// Records one invocation and its wall time against a `PerfCounter` when dropped.
pub struct PerfTimerGuard<'a> {
    #[cfg_attr(not(feature = "perf_counters"), allow(dead_code))]
    counter: &'a PerfCounter,
    #[cfg(feature = "perf_counters")]
    started: Instant,
}

impl<'a> PerfTimerGuard<'a> {
    pub fn new(counter: &'a PerfCounter) -> Self {
        Self {
            counter,
            #[cfg(feature = "perf_counters")]
            started: Instant::now(),
        }
    }
}

impl Drop for PerfTimerGuard<'_> {
    fn drop(&mut self) {
        #[cfg(feature = "perf_counters")]
        {
            let elapsed = self.started.elapsed().as_nanos();
            self.counter.invocations().add(1);
            self.counter.cumulative_duration_nanos().add(elapsed as isize);
        }
    }
}
