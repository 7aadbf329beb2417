// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token bucket bounding how many security events are reported per second.
//!
//! The bucket holds at most `max_tokens` tokens and refills at a rate of
//! `max_tokens` per second, in steps of [`TICK`]. Refill is computed from the
//! monotonic clock whenever a token is requested, which is equivalent to a
//! ticker adding tokens in the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

/// Granularity at which tokens are added back to the bucket.
pub const TICK: Duration = Duration::from_micros(500);

const NANOS_PER_SECOND: u128 = 1_000_000_000;

pub trait Limiter: Send + Sync {
    /// Takes a token from the bucket, returning whether one was available.
    fn allow(&self) -> bool;
}

/// A token bucket refilled at a constant rate.
#[derive(Debug)]
pub struct TokenTicker {
    max_tokens: u64,
    nanos_per_token: u128,
    state: Mutex<BucketState>,
    stopped: AtomicBool,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    /// Nanoseconds accumulated since the last token was added.
    elapsed_nanos: u128,
    last_tick: Instant,
}

impl TokenTicker {
    /// Creates a bucket starting with `tokens` tokens, capped at `max_tokens`.
    /// A zero `max_tokens` is raised to one.
    #[must_use]
    pub fn new(tokens: u64, max_tokens: u64) -> Self {
        let max_tokens = max_tokens.max(1);
        Self {
            max_tokens,
            nanos_per_token: NANOS_PER_SECOND / u128::from(max_tokens),
            state: Mutex::new(BucketState {
                tokens: tokens.min(max_tokens),
                elapsed_nanos: 0,
                last_tick: Instant::now(),
            }),
            stopped: AtomicBool::new(false),
        }
    }

    /// Creates a full bucket allowing `rate` events per second.
    #[must_use]
    pub fn with_rate(rate: u64) -> Self {
        Self::new(rate, rate)
    }

    #[must_use]
    pub const fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// Stops refilling the bucket. Tokens still in the bucket remain
    /// available. Calling this more than once has no further effect.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!("appsec: stopped the rate limiter ticker");
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_tick.elapsed();
        let ticks = elapsed.as_nanos() / TICK.as_nanos();
        if ticks == 0 {
            return;
        }
        let ticked = TICK.as_nanos() * ticks;
        state.last_tick += Duration::from_nanos(u64::try_from(ticked).unwrap_or(u64::MAX));

        let cap = u128::from(self.max_tokens) * self.nanos_per_token;
        state.elapsed_nanos = (state.elapsed_nanos + ticked).min(cap);
        if state.elapsed_nanos < self.nanos_per_token || state.tokens == self.max_tokens {
            return;
        }

        let increment = u64::try_from(state.elapsed_nanos / self.nanos_per_token).unwrap_or(u64::MAX);
        state.tokens = state.tokens.saturating_add(increment).min(self.max_tokens);
        state.elapsed_nanos %= self.nanos_per_token;
    }
}

impl Limiter for TokenTicker {
    fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_stopped() {
            self.refill(&mut state);
        }
        if state.tokens == 0 {
            return false;
        }
        state.tokens -= 1;
        true
    }
}
