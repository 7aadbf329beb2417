// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The WAF core feature: it sets every WAF context operation up when it
//! starts, and reports its findings as span tags when it finishes.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tracing::debug;

use crate::addresses::AddressSet;
use crate::dyngo::{find_operation, on, on_data, on_finish, Operation};
use crate::error::Result;
use crate::features::{Feature, FeatureContext};
use crate::limiter::{Limiter, TokenTicker};
use crate::stacktrace;
use crate::telemetry::{Telemetry, WAF_REQUESTS};
use crate::trace::{set_serializable_tag, set_serializable_tags, TagSetter, TagValue};
use crate::waf::actions::{BlockingSecurityEvent, StackTraceAction};
use crate::waf::context::{
    listen_run_events, ContextArgs, ContextOperation, ContextRes, ContextSettings, SecurityEvent,
};
use crate::waf::handle::WafHandle;
use crate::waf::tags::{
    add_rules_monitoring_tags, add_waf_monitoring_tags, set_event_span_tags, TagName,
};

pub struct WafFeature {
    state: Arc<State>,
    limiter: Arc<TokenTicker>,
}

struct State {
    /// Released by [`Feature::stop`]; contexts started afterwards stay
    /// disabled.
    handle: Mutex<Option<WafHandle>>,
    rules_version: String,
    waf_version: String,
    supported: AddressSet,
    settings: ContextSettings,
    limiter: Arc<dyn Limiter>,
    telemetry: Arc<Telemetry>,
    meta_struct_available: bool,
}

pub fn new_feature(ctx: &FeatureContext<'_>) -> Result<Option<Box<dyn Feature>>> {
    let limiter = Arc::new(TokenTicker::with_rate(ctx.config.trace_rate_limit));
    let state = Arc::new(State {
        handle: Mutex::new(Some(ctx.handle.clone())),
        rules_version: ctx.handle.rules_version().to_string(),
        waf_version: ctx.handle.waf_version().to_string(),
        supported: ctx.supported.clone(),
        settings: ctx.config.context_settings(),
        limiter: Arc::clone(&limiter) as Arc<dyn Limiter>,
        telemetry: Arc::clone(ctx.telemetry),
        meta_struct_available: ctx.config.meta_struct_available,
    });

    let on_start = Arc::clone(&state);
    on::<ContextArgs, _>(ctx.root, move |op, _| on_start.on_context_start(op));
    let on_end = Arc::clone(&state);
    on_finish::<ContextRes, _>(ctx.root, move |op, _| on_end.on_context_finish(op));

    Ok(Some(Box::new(WafFeature { state, limiter })))
}

impl fmt::Display for WafFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WAF")
    }
}

impl Feature for WafFeature {
    fn stop(&self) {
        self.limiter.stop();
        let released = self
            .state
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            debug!("appsec: released the WAF handle of the WAF feature");
        }
    }
}

impl State {
    fn handle(&self) -> Option<WafHandle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn on_context_start(&self, op: &ContextOperation) {
        let Some(handle) = self.handle() else {
            return;
        };
        let Some(ctx) = find_operation::<ContextOperation>(op.operation()) else {
            crate::unreachable_warn("appsec: started a WAF context operation that is not bound");
            return;
        };

        if handle.take_diagnostics_report() {
            add_rules_monitoring_tags(ctx.tags(), handle.diagnostics());
        }

        match handle.new_context(self.settings.timeout) {
            Ok(context) => {
                ctx.swap_context(Some(context));
            }
            Err(e) => {
                debug!("appsec: could not create a WAF context, the request is not monitored: {e}");
            }
        }
        ctx.set_limiter(Arc::clone(&self.limiter));
        ctx.set_supported_addresses(self.supported.clone());
        ctx.set_settings(self.settings.clone());

        listen_run_events(&ctx);
        listen_actions(&ctx);
    }

    fn on_context_finish(&self, op: &ContextOperation) {
        let Some(mut context) = op.swap_context(None) else {
            return;
        };
        let stats = context.stats().clone();
        context.close();

        let tags = op.tags();
        add_waf_monitoring_tags(tags, &self.rules_version, &self.waf_version, &stats);

        let events = op.events();
        let rule_triggered = !events.is_empty();
        if rule_triggered {
            self.set_triggers(tags, events);
        }
        set_serializable_tags(tags, &op.derivatives());
        let stacks = op.stack_traces();
        if !stacks.is_empty() {
            tags.set_tag(stacktrace::SPAN_KEY, TagValue::Struct(stacktrace::span_value(&stacks)));
        }

        self.telemetry.count(
            WAF_REQUESTS,
            1,
            vec![
                format!("rule_triggered:{rule_triggered}"),
                format!("request_blocked:{}", op.is_blocked()),
                format!("waf_timeout:{}", op.timed_out() || stats.timeouts() > 0),
                format!("waf_version:{}", self.waf_version),
                format!("event_rules_version:{}", self.rules_version),
            ],
        );
    }

    /// Structured when the trace writer accepts it, JSON-encoded otherwise.
    fn set_triggers(&self, tags: &dyn TagSetter, events: Vec<Value>) {
        let triggers = json!({ "triggers": events });
        if self.meta_struct_available {
            tags.set_tag(TagName::AppsecMetaStruct.as_str(), TagValue::Struct(triggers));
        } else {
            set_serializable_tag(tags, TagName::AppsecJson.as_str(), &triggers);
        }
    }
}

/// Data listeners of the events the evaluator actions produce below `ctx`.
fn listen_actions(ctx: &Arc<ContextOperation>) {
    let node: &Operation = ctx.operation();

    let weak = Arc::downgrade(ctx);
    on_data::<BlockingSecurityEvent, _>(node, move |_| {
        if let Some(ctx) = weak.upgrade() {
            if ctx.set_blocked() {
                ctx.set_tag(TagName::AppsecBlocked.as_str(), true);
            }
        }
    });

    let weak = Arc::downgrade(ctx);
    on_data::<StackTraceAction, _>(node, move |action| {
        if let Some(ctx) = weak.upgrade() {
            ctx.add_stack_trace(action.event.clone());
        }
    });

    let weak = Arc::downgrade(ctx);
    on_data::<SecurityEvent, _>(node, move |_| {
        if let Some(ctx) = weak.upgrade() {
            set_event_span_tags(ctx.tags());
        }
    });
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::addresses::{AddressesBuilder, CLIENT_IP, SERVER_DB_STATEMENT};
    use crate::config::Config;
    use crate::telemetry::TelemetryRecord;
    use crate::trace::SpanTags;
    use crate::waf::context::{run_simple, start_context_operation};
    use crate::waf::evaluator::{RunAddressData, RunResult};
    use crate::waf::testing::{handle, trigger, Recorder};

    struct Setup {
        root: Operation,
        feature: Box<dyn Feature>,
        recorder: Arc<Recorder>,
        telemetry: Arc<Telemetry>,
    }

    fn setup(
        config: &Config,
        script: impl Fn(&RunAddressData) -> RunResult + Send + Sync + 'static,
    ) -> Setup {
        let recorder = Recorder::new(script);
        let handle = handle(&recorder, &[CLIENT_IP, SERVER_DB_STATEMENT]);
        let supported = AddressSet::from_declared(handle.addresses());
        let telemetry = Arc::new(Telemetry::new());
        let root = Operation::root();
        let feature = new_feature(&FeatureContext {
            config,
            supported: &supported,
            handle: &handle,
            telemetry: &telemetry,
            root: &root,
        })
        .unwrap()
        .unwrap();
        Setup {
            root,
            feature,
            recorder,
            telemetry,
        }
    }

    fn ip() -> RunAddressData {
        AddressesBuilder::new()
            .with_client_ip("1.2.3.4".parse().ok())
            .build()
    }

    #[test]
    fn test_request_with_a_block() {
        let s = setup(&Config::default(), |_| {
            trigger("blk-001-001", json!({"block_request": {"status_code": 403}}))
        });
        let span = Arc::new(SpanTags::new());
        let ctx = start_context_operation(&s.root, Arc::clone(&span) as Arc<dyn TagSetter>);

        assert!(run_simple(ctx.operation(), ip()).is_err());
        ctx.finish();

        assert_eq!(span.get("appsec.blocked"), Some(TagValue::Bool(true)));
        assert_eq!(span.get("appsec.event"), Some(TagValue::Bool(true)));
        assert_eq!(span.get("_dd.appsec.event_rules.version"), Some(TagValue::from("1.13.3")));
        assert_eq!(span.get("_dd.appsec.waf.version"), Some(TagValue::from("1.24.1")));
        let payload = span.get("_dd.appsec.json").unwrap();
        let payload: Value = serde_json::from_str(payload.as_str().unwrap()).unwrap();
        assert_eq!(payload["triggers"][0]["rule"]["id"], "blk-001-001");
        assert_eq!(s.recorder.context_closes(), 1);

        let records = s.telemetry.flush();
        assert!(records.iter().any(|r| matches!(
            r,
            TelemetryRecord::Count { name, tags, .. }
                if *name == WAF_REQUESTS && tags.contains(&"request_blocked:true".to_string())
        )));
    }

    #[test]
    fn test_meta_struct_triggers_and_derivatives() {
        let config = Config {
            meta_struct_available: true,
            ..Config::default()
        };
        let s = setup(&config, |_| RunResult {
            derivatives: json!({"_dd.appsec.s.req.headers": [{"accept": [8]}], "_dd.appsec.fp.http.header": "hdr-1"})
                .as_object()
                .cloned()
                .unwrap(),
            ..trigger("crs-913-110", json!({}))
        });
        let span = Arc::new(SpanTags::new());
        let ctx = start_context_operation(&s.root, Arc::clone(&span) as Arc<dyn TagSetter>);
        assert!(run_simple(ctx.operation(), ip()).is_ok());
        ctx.finish();

        assert!(matches!(span.get("appsec"), Some(TagValue::Struct(v)) if v["triggers"].is_array()));
        assert!(!span.contains("_dd.appsec.json"));
        assert!(!span.contains("appsec.blocked"));
        assert_eq!(span.get("_dd.appsec.fp.http.header"), Some(TagValue::from("hdr-1")));
        assert_eq!(
            span.get("_dd.appsec.s.req.headers"),
            Some(TagValue::from(r#"[{"accept":[8]}]"#))
        );
    }

    #[test]
    fn test_rules_diagnostics_reported_once() {
        let s = setup(&Config::default(), |_| RunResult::default());
        let first = Arc::new(SpanTags::new());
        start_context_operation(&s.root, Arc::clone(&first) as Arc<dyn TagSetter>).finish();
        let second = Arc::new(SpanTags::new());
        start_context_operation(&s.root, Arc::clone(&second) as Arc<dyn TagSetter>).finish();

        assert!(first.contains("_dd.appsec.event_rules.loaded"));
        assert!(!second.contains("_dd.appsec.event_rules.loaded"));
        assert!(second.contains("_dd.appsec.event_rules.version"));
        assert!(!second.contains("_dd.appsec.json"));
    }

    #[test]
    fn test_timed_out_events_count_against_the_limiter() {
        let config = Config {
            trace_rate_limit: 1,
            ..Config::default()
        };
        let s = setup(&config, |_| RunResult {
            timeout: true,
            ..trigger("crs-913-110", json!({}))
        });
        let span = Arc::new(SpanTags::new());
        let ctx = start_context_operation(&s.root, Arc::clone(&span) as Arc<dyn TagSetter>);
        assert!(run_simple(ctx.operation(), ip()).is_ok());
        let data = AddressesBuilder::new().with_db_statement("SELECT 1").build();
        assert!(run_simple(ctx.operation(), data).is_ok());

        assert_eq!(s.recorder.run_count(), 2);
        assert_eq!(ctx.events().len(), 1);
        assert!(ctx.timed_out());
        ctx.finish();

        assert_eq!(span.get("_dd.appsec.waf.timeouts"), Some(TagValue::Int(1)));
        let payload = span.get("_dd.appsec.json").unwrap();
        let payload: Value = serde_json::from_str(payload.as_str().unwrap()).unwrap();
        assert_eq!(payload["triggers"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_stop_releases_the_handle() {
        let s = setup(&Config::default(), |_| trigger("r", json!({})));
        s.feature.stop();
        s.feature.stop();
        assert_eq!(s.recorder.handle_closes(), 1);

        let span = Arc::new(SpanTags::new());
        let ctx = start_context_operation(&s.root, Arc::clone(&span) as Arc<dyn TagSetter>);
        assert!(run_simple(ctx.operation(), ip()).is_ok());
        ctx.finish();
        assert_eq!(s.recorder.run_count(), 0);
        assert!(span.is_empty());
    }

    #[test]
    fn test_stack_trace_action() {
        let s = setup(&Config::default(), |_| {
            trigger("rasp-942-100", json!({"generate_stack": {"stack_id": "s-1"}}))
        });
        let span = Arc::new(SpanTags::new());
        let ctx = start_context_operation(&s.root, Arc::clone(&span) as Arc<dyn TagSetter>);
        let data = AddressesBuilder::new().with_db_statement("SELECT 1").build();
        assert!(run_simple(ctx.operation(), data).is_ok());
        ctx.finish();

        let Some(TagValue::Struct(stack)) = span.get("_dd.stack") else {
            panic!("missing stack trace tag");
        };
        assert_eq!(stack["exploit"][0]["id"], "s-1");
        assert_eq!(span.get("_dd.appsec.rasp.rule.eval"), Some(TagValue::Int(1)));
    }
}
