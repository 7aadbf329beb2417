// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted evaluator handle and the per-request context created
//! out of it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::addresses::RaspRuleType;
use crate::error::Result;
use crate::waf::evaluator::{Diagnostics, NativeContext, NativeHandle, RunAddressData, RunResult, Scope};

/// Shared evaluator handle. Cloning it takes a new reference; the native
/// handle is closed when the last reference is dropped.
#[derive(Clone)]
pub struct WafHandle(Arc<HandleInner>);

struct HandleInner {
    native: Box<dyn NativeHandle>,
    diagnostics: Diagnostics,
    addresses: Vec<String>,
    waf_version: String,
    diagnostics_reported: AtomicBool,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        debug!("appsec: releasing the WAF handle");
        self.native.close();
    }
}

impl WafHandle {
    #[must_use]
    pub fn new(native: Box<dyn NativeHandle>, diagnostics: Diagnostics, waf_version: String) -> Self {
        let addresses = native.addresses();
        Self(Arc::new(HandleInner {
            native,
            diagnostics,
            addresses,
            waf_version,
            diagnostics_reported: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.0.diagnostics
    }

    /// Returns `true` to the first caller only, across every clone of the
    /// handle. The rules diagnostics are reported by that caller.
    pub fn take_diagnostics_report(&self) -> bool {
        !self.0.diagnostics_reported.swap(true, Ordering::AcqRel)
    }

    /// Version of the loaded rules, empty when they declare none.
    #[must_use]
    pub fn rules_version(&self) -> &str {
        self.0.diagnostics.version.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn waf_version(&self) -> &str {
        &self.0.waf_version
    }

    /// Addresses declared by the compiled rules.
    #[must_use]
    pub fn addresses(&self) -> &[String] {
        &self.0.addresses
    }

    /// Number of live references to the handle, contexts included.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Creates a per-request context with a total time budget of `budget`.
    pub fn new_context(&self, budget: Duration) -> Result<WafContext> {
        let native = self.0.native.new_context(budget)?;
        Ok(WafContext {
            native: Some(native),
            handle: Some(self.clone()),
            remaining: budget,
            supplied: HashSet::new(),
            stats: ContextStats::default(),
        })
    }
}

impl fmt::Debug for WafHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WafHandle")
            .field("rules_version", &self.rules_version())
            .field("waf_version", &self.waf_version())
            .field("addresses", &self.addresses().len())
            .finish_non_exhaustive()
    }
}

/// Counters accumulated by a context over its runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub waf_duration: Duration,
    pub rasp_duration: Duration,
    pub rasp_calls: u64,
    pub rasp_rule_evals: HashMap<RaspRuleType, u64>,
    pub waf_timeouts: u64,
    pub rasp_timeouts: u64,
    pub waf_errors: u64,
    pub rasp_errors: u64,
}

impl ContextStats {
    fn record(&mut self, scope: Scope, rule_type: Option<RaspRuleType>, outcome: &Result<RunResult>) {
        match (scope, outcome) {
            (Scope::Waf, Ok(result)) => {
                self.waf_duration += result.elapsed;
                self.waf_timeouts += u64::from(result.timeout);
            }
            (Scope::Rasp, Ok(result)) => {
                self.rasp_duration += result.elapsed;
                self.rasp_timeouts += u64::from(result.timeout);
            }
            (Scope::Waf, Err(_)) => self.waf_errors += 1,
            (Scope::Rasp, Err(_)) => self.rasp_errors += 1,
        }
        if scope == Scope::Rasp {
            self.rasp_calls += 1;
            if let Some(rule_type) = rule_type {
                *self.rasp_rule_evals.entry(rule_type).or_default() += 1;
            }
        }
    }

    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.waf_timeouts + self.rasp_timeouts
    }
}

/// A per-request evaluator context.
///
/// Closing is idempotent, happens at drop at the latest, and releases the
/// context's reference on the handle.
pub struct WafContext {
    native: Option<Box<dyn NativeContext>>,
    handle: Option<WafHandle>,
    remaining: Duration,
    supplied: HashSet<String>,
    stats: ContextStats,
}

impl WafContext {
    /// Evaluates `data`, bounding the run by `min(remaining budget, per_call)`.
    ///
    /// Persistent addresses already supplied by an earlier run are dropped.
    /// Returns `Ok(None)` when nothing is left to evaluate or the context is
    /// closed. An exhausted budget skips the run and reports a timeout.
    pub fn run(&mut self, mut data: RunAddressData, per_call: Duration) -> Result<Option<RunResult>> {
        let Some(native) = self.native.as_mut() else {
            return Ok(None);
        };

        data.persistent.retain(|addr, _| !self.supplied.contains(addr));
        if data.is_empty() {
            return Ok(None);
        }

        let scope = data.scope;
        let rule_type = RaspRuleType::from_run(&data);
        let budget = self.remaining.min(per_call);
        if budget.is_zero() {
            info!(
                "appsec: the WAF budget of the request is exhausted, skipping evaluation; consider tuning DD_APPSEC_WAF_TIMEOUT"
            );
            let skipped = Ok(RunResult {
                timeout: true,
                ..RunResult::default()
            });
            self.stats.record(scope, rule_type, &skipped);
            return skipped.map(Some);
        }

        let outcome = native.run(&data, budget);
        self.stats.record(scope, rule_type, &outcome);
        let result = outcome?;
        self.remaining = self.remaining.saturating_sub(result.elapsed);
        self.supplied.extend(data.persistent.keys().cloned());
        Ok(Some(result))
    }

    #[must_use]
    pub fn remaining_budget(&self) -> Duration {
        self.remaining
    }

    #[must_use]
    pub fn stats(&self) -> &ContextStats {
        &self.stats
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.native.is_none()
    }

    pub fn close(&mut self) {
        if let Some(mut native) = self.native.take() {
            native.close();
        }
        self.handle = None;
    }
}

impl Drop for WafContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for WafContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WafContext")
            .field("closed", &self.is_closed())
            .field("remaining", &self.remaining)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
