// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampling of API schema extraction.
//!
//! Each `(method, route, status)` endpoint is sampled at most once per
//! interval. Endpoints are kept in LRU order so that the least recently seen
//! one is evicted when the sampler is full.
//!
//! ```text
//! GET /users/{id} -> 200
//! - T=0s:  sampled
//! - T=15s: skipped (within the 30s interval)
//! - T=35s: sampled
//! ```

use std::hash::{BuildHasher, BuildHasherDefault, Hasher};
use std::num::NonZeroUsize;
use std::time::Duration;

#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use fnv::FnvBuildHasher;
use ordered_hash_map::OrderedHashMap;

pub const DEFAULT_SAMPLE_DELAY: Duration = Duration::from_secs(30);

const DEFAULT_CAPACITY: usize = 4_096;

/// Time-based, per-endpoint sampler. Not synchronized: callers sharing it
/// across requests wrap it in a mutex.
#[derive(Debug)]
pub struct Sampler {
    interval: Duration,
    capacity: usize,
    /// Endpoint hashes in least-recently-seen first order.
    data: OrderedHashMap<u64, SamplerState, BuildIdentityHasher>,
    hasher_builder: FnvBuildHasher,
}

impl Sampler {
    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self::with_interval_and_capacity(interval, capacity)
    }

    #[must_use]
    pub fn with_interval_and_capacity(interval: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            interval,
            capacity: capacity.get(),
            data: OrderedHashMap::with_capacity_and_hasher(capacity.get(), BuildIdentityHasher::default()),
            hasher_builder: FnvBuildHasher::default(),
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the schema of the `(method, route, status)` endpoint should be
    /// extracted for the current request.
    pub fn decision_for(&mut self, method: &str, route: &str, status: u16) -> bool {
        let hash = self.endpoint_hash(method, route, status);

        if let Some(state) = self.data.get_mut(&hash) {
            let sampled = state.last_sample.elapsed() >= self.interval;
            if sampled {
                state.last_sample = Instant::now();
            }
            self.data.move_to_back(&hash);
            return sampled;
        }

        if self.data.len() >= self.capacity {
            self.data.pop_front();
        }
        self.data.insert(
            hash,
            SamplerState {
                last_sample: Instant::now(),
            },
        );
        true
    }

    fn endpoint_hash(&self, method: &str, route: &str, status: u16) -> u64 {
        let mut hasher = self.hasher_builder.build_hasher();
        hasher.write(method.as_bytes());
        hasher.write_u8(0);
        hasher.write(route.as_bytes());
        hasher.write_u8(0);
        hasher.write_u16(status);
        hasher.finish()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
struct SamplerState {
    last_sample: Instant,
}

type BuildIdentityHasher = BuildHasherDefault<IdentityHasher>;

/// Keys are already FNV hashes, so they are used as is.
#[derive(Debug, Default, Clone, Copy)]
struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    #[cfg_attr(coverage_nightly, coverage(off))] // Unsupported
    fn write(&mut self, bytes: &[u8]) {
        crate::unreachable_warn("IdentityHasher only hashes u64 keys");
        for &b in bytes {
            self.0 = self.0.rotate_left(8) ^ u64::from(b);
        }
    }

    fn write_u64(&mut self, v: u64) {
        self.0 = v;
    }

    fn finish(&self) -> u64 {
        self.0
    }
}
