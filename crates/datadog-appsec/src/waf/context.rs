// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The WAF context operation: one per request, wrapping the evaluator
//! context of that request.
//!
//! ```text
//! start_context_operation
//!         │
//!         ├─> WAF feature swaps an evaluator context in, sets the limiter,
//!         │   the supported addresses and the settings
//!         │
//! RunEvent (emitted by child operations, any number of times)
//!         │
//!         ├─> addresses filtered down to the supported set
//!         ├─> evaluator run within the remaining budget
//!         ├─> triggers recorded if the limiter allows them
//!         ├─> derivatives merged
//!         └─> actions dispatched from the emitting operation
//!         │
//! finish
//!         │
//!         └─> WAF feature closes the evaluator context and writes the tags
//! ```

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::addresses::AddressSet;
use crate::dyngo::{self, emit_data, on_data, AsOperation, Operation};
use crate::limiter::Limiter;
use crate::stacktrace::StackTrace;
use crate::trace::{TagSetter, TagValue};
use crate::waf::actions::{send_action_events, ActionSettings, BlockingSecurityEvent};
use crate::waf::evaluator::{RunAddressData, RunResult};
use crate::waf::handle::WafContext;
use crate::waf::tags::{TagName, SAMPLING_PRIORITY_USER_KEEP};

/// Upper bound on the triggers a single request reports.
pub const MAX_SECURITY_EVENTS: usize = 512;

pub const DEFAULT_WAF_TIMEOUT: Duration = Duration::from_millis(1);

/// Start arguments of a [`ContextOperation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextArgs;

impl dyngo::ArgOf for ContextArgs {
    type Operation = ContextOperation;
}

/// Finish results of a [`ContextOperation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextRes;

impl dyngo::ResultOf for ContextRes {
    type Operation = ContextOperation;
}

/// Data event asking the enclosing WAF context to evaluate `data`. Actions
/// resulting from the run are emitted from `receiver`.
#[derive(Debug, Clone)]
pub struct RunEvent {
    pub receiver: Operation,
    pub data: RunAddressData,
}

/// Data event signaling that the evaluator reported triggers that made it
/// through the rate limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityEvent;

/// Per-context settings, fixed by the WAF feature when the context starts.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    /// Budget of a single run.
    pub timeout: Duration,
    pub actions: ActionSettings,
    pub max_stack_traces: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAF_TIMEOUT,
            actions: ActionSettings::default(),
            max_stack_traces: 2,
        }
    }
}

pub struct ContextOperation {
    op: Operation,
    tags: Arc<dyn TagSetter>,
    context: Mutex<Option<WafContext>>,
    limiter: OnceLock<Arc<dyn Limiter>>,
    supported: OnceLock<AddressSet>,
    settings: OnceLock<ContextSettings>,
    events: Mutex<Vec<Value>>,
    derivatives: Mutex<Map<String, Value>>,
    stack_traces: Mutex<Vec<StackTrace>>,
    blocked: AtomicBool,
    timed_out: AtomicBool,
}

impl AsOperation for ContextOperation {
    fn as_operation(&self) -> &Operation {
        &self.op
    }
}

/// Creates and starts a WAF context operation below `parent`. Its tags are
/// written through `tags`, usually the service entry span of the request.
#[must_use]
pub fn start_context_operation(parent: &Operation, tags: Arc<dyn TagSetter>) -> Arc<ContextOperation> {
    let op = Arc::new(ContextOperation {
        op: Operation::new(Some(parent)),
        tags,
        context: Mutex::new(None),
        limiter: OnceLock::new(),
        supported: OnceLock::new(),
        settings: OnceLock::new(),
        events: Mutex::default(),
        derivatives: Mutex::default(),
        stack_traces: Mutex::default(),
        blocked: AtomicBool::new(false),
        timed_out: AtomicBool::new(false),
    });
    dyngo::start_and_bind_operation(&op, ContextArgs);
    op
}

impl ContextOperation {
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    #[must_use]
    pub fn tags(&self) -> &dyn TagSetter {
        self.tags.as_ref()
    }

    pub fn set_tag(&self, key: &str, value: impl Into<TagValue>) {
        self.tags.set_tag(key, value.into());
    }

    /// Swaps the evaluator context, returning the previous one.
    pub fn swap_context(&self, context: Option<WafContext>) -> Option<WafContext> {
        mem::replace(&mut *lock(&self.context), context)
    }

    pub fn set_limiter(&self, limiter: Arc<dyn Limiter>) {
        if self.limiter.set(limiter).is_err() {
            debug!("appsec: the rate limiter of the WAF context is already set");
        }
    }

    pub fn set_supported_addresses(&self, supported: AddressSet) {
        if self.supported.set(supported).is_err() {
            debug!("appsec: the supported addresses of the WAF context are already set");
        }
    }

    pub fn set_settings(&self, settings: ContextSettings) {
        if self.settings.set(settings).is_err() {
            debug!("appsec: the settings of the WAF context are already set");
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ContextSettings {
        self.settings.get_or_init(ContextSettings::default)
    }

    /// Handles a [`RunEvent`] emitted below this operation.
    pub fn on_event(&self, event: &RunEvent) {
        self.run(&event.receiver, event.data.clone());
    }

    /// Evaluates `data`, emitting resulting actions from `receiver`.
    pub fn run(&self, receiver: &Operation, data: RunAddressData) {
        let Some(supported) = self.supported.get() else {
            debug!("appsec: WAF context is not set up, skipping the run");
            return;
        };
        let data = data.retain_supported(supported);
        if data.is_empty() {
            return;
        }

        let outcome = {
            let mut guard = lock(&self.context);
            let Some(context) = guard.as_mut() else {
                return;
            };
            context.run(data, self.settings().timeout)
        };
        let result = match outcome {
            Ok(Some(result)) => result,
            Ok(None) => return,
            Err(e) => {
                debug!("appsec: the WAF run failed, the request continues unmonitored: {e}");
                return;
            }
        };

        let RunResult {
            events,
            actions,
            derivatives,
            timeout,
            keep,
            ..
        } = result;

        if timeout {
            self.timed_out.store(true, Ordering::Release);
        }
        if keep {
            debug!("appsec: a WAF rule requested the trace to be upgraded to USER_KEEP priority");
            self.set_tag(TagName::SamplingPriorityV1.as_str(), SAMPLING_PRIORITY_USER_KEEP);
        }
        if !derivatives.is_empty() {
            lock(&self.derivatives).extend(derivatives);
        }

        if !events.is_empty() {
            if self.allow_event() {
                debug!("appsec: WAF ruleset detected {} events", events.len());
                self.add_events(events);
                emit_data(receiver, SecurityEvent);
            } else {
                debug!("appsec: rate limit reached, dropping {} WAF events", events.len());
            }
        }

        if !actions.is_empty() {
            send_action_events(receiver, &actions, &self.settings().actions);
        }
    }

    fn allow_event(&self) -> bool {
        self.limiter.get().map_or(true, |limiter| limiter.allow())
    }

    fn add_events(&self, events: Vec<Value>) {
        let mut all = lock(&self.events);
        let room = MAX_SECURITY_EVENTS.saturating_sub(all.len());
        if events.len() > room {
            debug!(
                "appsec: dropping {} WAF events above the limit of {MAX_SECURITY_EVENTS} per request",
                events.len() - room
            );
        }
        all.extend(events.into_iter().take(room));
    }

    /// Records a captured stack trace, within the configured limit.
    pub fn add_stack_trace(&self, stack: StackTrace) {
        let max = self.settings().max_stack_traces;
        let mut stacks = lock(&self.stack_traces);
        if stacks.len() >= max {
            debug!("appsec: dropping stack trace {}, the request already has {max}", stack.id);
            return;
        }
        stacks.push(stack);
    }

    /// Marks the request as blocked. Returns `true` only for the first call.
    pub fn set_blocked(&self) -> bool {
        !self.blocked.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Whether any run of this context timed out.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn events(&self) -> Vec<Value> {
        lock(&self.events).clone()
    }

    #[must_use]
    pub fn derivatives(&self) -> Map<String, Value> {
        lock(&self.derivatives).clone()
    }

    #[must_use]
    pub fn stack_traces(&self) -> Vec<StackTrace> {
        lock(&self.stack_traces).clone()
    }

    pub fn finish(&self) {
        dyngo::finish_operation(self, ContextRes);
    }
}

/// Wires the [`RunEvent`] listener of `op`. The listener only holds a weak
/// reference on the operation.
pub fn listen_run_events(op: &Arc<ContextOperation>) {
    let weak: Weak<ContextOperation> = Arc::downgrade(op);
    on_data::<RunEvent, _>(&op.op, move |event| {
        if let Some(op) = weak.upgrade() {
            op.on_event(event);
        }
    });
}

/// Asks the enclosing WAF context to evaluate `data`. Resulting actions are
/// emitted from `op`.
pub fn run_from(op: &Operation, data: RunAddressData) {
    emit_data(op, RunEvent {
        receiver: op.clone(),
        data,
    });
}

/// Evaluates `data` from a short-lived operation below `parent`, returning
/// the blocking decision the run produced, if any.
pub fn run_simple(parent: &Operation, data: RunAddressData) -> Result<(), BlockingSecurityEvent> {
    let op = Operation::new(Some(parent));
    let blocking: Arc<Mutex<Option<BlockingSecurityEvent>>> = Arc::default();
    let sink = Arc::clone(&blocking);
    on_data::<BlockingSecurityEvent, _>(&op, move |event| {
        lock(&sink).get_or_insert_with(|| event.clone());
    });

    run_from(&op, data);
    op.disable();

    let outcome = lock(&blocking).take();
    outcome.map_or(Ok(()), Err)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::addresses::{AddressesBuilder, CLIENT_IP, SERVER_DB_STATEMENT};
    use crate::limiter::TokenTicker;
    use crate::trace::SpanTags;
    use crate::waf::testing::{handle, trigger, Recorder};

    struct Fixture {
        root: Operation,
        span: Arc<SpanTags>,
        ctx: Arc<ContextOperation>,
        recorder: Arc<Recorder>,
    }

    fn fixture(script: impl Fn(&RunAddressData) -> RunResult + Send + Sync + 'static) -> Fixture {
        let recorder = Recorder::new(script);
        let handle = handle(&recorder, &[CLIENT_IP, SERVER_DB_STATEMENT]);
        let root = Operation::root();
        let span = Arc::new(SpanTags::new());
        let ctx = start_context_operation(&root, Arc::clone(&span) as Arc<dyn TagSetter>);
        ctx.swap_context(handle.new_context(Duration::from_millis(5)).ok());
        ctx.set_supported_addresses(AddressSet::from_declared(handle.addresses()));
        ctx.set_limiter(Arc::new(TokenTicker::with_rate(100)));
        listen_run_events(&ctx);
        Fixture {
            root,
            span,
            ctx,
            recorder,
        }
    }

    fn ip(addr: &str) -> RunAddressData {
        AddressesBuilder::new().with_client_ip(addr.parse().ok()).build()
    }

    #[test]
    fn test_run_records_events_and_derivatives() {
        let f = fixture(|_| RunResult {
            derivatives: json!({"_dd.appsec.s.req.headers": [{"accept": [8]}]})
                .as_object()
                .cloned()
                .unwrap(),
            ..trigger("crs-913-110", json!({}))
        });
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&observed);
        on_data::<SecurityEvent, _>(&f.ctx.op, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let child = Operation::new(Some(&f.ctx.op));
        emit_data(&child, RunEvent {
            receiver: child.clone(),
            data: ip("1.2.3.4"),
        });

        assert_eq!(f.ctx.events(), vec![json!({"rule": {"id": "crs-913-110"}})]);
        assert!(f.ctx.derivatives().contains_key("_dd.appsec.s.req.headers"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(!f.ctx.is_blocked());
    }

    #[test]
    fn test_unsupported_addresses_are_not_evaluated() {
        let f = fixture(|_| RunResult::default());
        f.ctx.run(
            &f.ctx.op,
            AddressesBuilder::new().with_method("GET").with_url("http://x").build(),
        );
        assert_eq!(f.recorder.run_count(), 0);

        f.ctx.run(&f.ctx.op, ip("10.0.0.1"));
        assert_eq!(f.recorder.run_count(), 1);
    }

    #[test]
    fn test_derivatives_last_write_wins() {
        let calls = AtomicUsize::new(0);
        let f = fixture(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            RunResult {
                derivatives: json!({"schema": n}).as_object().cloned().unwrap(),
                ..RunResult::default()
            }
        });
        f.ctx.run(&f.ctx.op, ip("1.1.1.1"));
        f.ctx.run(&f.ctx.op, AddressesBuilder::new().with_db_statement("SELECT 1").build());
        assert_eq!(f.ctx.derivatives()["schema"], json!(1));
    }

    #[test]
    fn test_rate_limited_events() {
        let f = fixture(|_| trigger("r", json!({})));
        let ctx = start_context_operation(&f.root, Arc::new(SpanTags::new()));
        let handle = handle(&f.recorder, &[SERVER_DB_STATEMENT]);
        ctx.swap_context(handle.new_context(Duration::from_millis(5)).ok());
        ctx.set_supported_addresses(AddressSet::from_declared(handle.addresses()));
        ctx.set_limiter(Arc::new(TokenTicker::with_rate(1)));

        for i in 0..5 {
            let data = AddressesBuilder::new()
                .with_db_statement(&format!("SELECT {i}"))
                .build();
            ctx.run(&ctx.op, data);
        }
        assert_eq!(f.recorder.run_count(), 5);
        assert_eq!(ctx.events().len(), 1);
    }

    #[test]
    fn test_events_are_bounded() {
        let f = fixture(|_| RunResult {
            events: vec![json!({}); 300],
            ..RunResult::default()
        });
        for i in 0..3 {
            let data = AddressesBuilder::new()
                .with_db_statement(&format!("SELECT {i}"))
                .build();
            f.ctx.run(&f.ctx.op, data);
        }
        assert_eq!(f.ctx.events().len(), MAX_SECURITY_EVENTS);
    }

    #[test]
    fn test_block_action_reaches_the_receiver() {
        let f = fixture(|_| trigger("blk-001-001", json!({"block_request": {"status_code": 403}})));
        let parent = Operation::new(Some(&f.ctx.op));
        let outcome = run_simple(&parent, ip("1.2.3.4"));

        let blocking = outcome.unwrap_err();
        assert_eq!(blocking.http_status, 403);
        assert_eq!(f.ctx.events().len(), 1);
    }

    #[test]
    fn test_run_simple_without_context() {
        let root = Operation::root();
        assert!(run_simple(&root, ip("1.2.3.4")).is_ok());
    }

    #[test]
    fn test_keep_sets_sampling_priority() {
        let f = fixture(|_| RunResult {
            keep: true,
            timeout: true,
            ..RunResult::default()
        });
        f.ctx.run(&f.ctx.op, ip("1.2.3.4"));
        assert_eq!(f.span.get("_sampling_priority_v1"), Some(TagValue::Float(2.0)));
        assert!(f.ctx.timed_out());
    }

    #[test]
    fn test_closed_context_ignores_runs() {
        let f = fixture(|_| trigger("r", json!({})));
        if let Some(mut context) = f.ctx.swap_context(None) {
            context.close();
        }
        f.ctx.run(&f.ctx.op, ip("1.2.3.4"));
        assert_eq!(f.recorder.run_count(), 0);
        assert_eq!(f.recorder.context_closes(), 1);
    }

    #[test]
    fn test_stack_traces_are_bounded() {
        let f = fixture(|_| RunResult::default());
        for id in ["a", "b", "c"] {
            f.ctx.add_stack_trace(StackTrace {
                id: id.to_string(),
                language: "rust",
                frames: Vec::new(),
            });
        }
        let ids: Vec<String> = f.ctx.stack_traces().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_set_blocked_once() {
        let f = fixture(|_| RunResult::default());
        assert!(f.ctx.set_blocked());
        assert!(!f.ctx.set_blocked());
        assert!(f.ctx.is_blocked());
    }

    #[test]
    fn test_run_listener_does_not_keep_the_operation_alive() {
        let f = fixture(|_| RunResult::default());
        let weak = Arc::downgrade(&f.ctx);
        let Fixture { ctx, root, .. } = f;
        drop(ctx);
        assert!(weak.upgrade().is_none());
        drop(root);
    }
}
