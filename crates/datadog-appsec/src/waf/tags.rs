// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span tags written by the WAF feature.

use std::fmt;

use tracing::debug;

use crate::addresses::RaspRuleType;
use crate::trace::{set_serializable_tag, TagSetter, TagValue};
use crate::waf::evaluator::Diagnostics;
use crate::waf::handle::ContextStats;

/// Sampling priority forcing the trace to be kept.
pub const SAMPLING_PRIORITY_USER_KEEP: f64 = 2.0;

const WAF_TAG_PREFIX: &str = "_dd.appsec.";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagName {
    // AppSec tags
    AppsecBlocked,
    AppsecEvent,
    AppsecEventRulesVersion,
    AppsecEventRulesLoaded,
    AppsecEventRulesErrorCount,
    AppsecEventRulesErrors,
    AppsecJson,
    AppsecMetaStruct,
    AppsecWafVersion,
    AppsecWafDuration,
    AppsecWafTimeouts,
    AppsecWafErrors,
    AppsecRaspDuration,
    AppsecRaspRuleEval,
    AppsecRaspTimeouts,
    AppsecRaspErrors,
    // Hidden span tags of relevance
    Origin,
    ManualKeep,
    // Special tags
    SamplingPriorityV1,
    /// A tag name that is not statically known.
    Dynamic(String),
}

impl TagName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::AppsecBlocked => "appsec.blocked",
            Self::AppsecEvent => "appsec.event",
            Self::AppsecEventRulesVersion => "_dd.appsec.event_rules.version",
            Self::AppsecEventRulesLoaded => "_dd.appsec.event_rules.loaded",
            Self::AppsecEventRulesErrorCount => "_dd.appsec.event_rules.error_count",
            Self::AppsecEventRulesErrors => "_dd.appsec.event_rules.errors",
            Self::AppsecJson => "_dd.appsec.json",
            Self::AppsecMetaStruct => "appsec",
            Self::AppsecWafVersion => "_dd.appsec.waf.version",
            Self::AppsecWafDuration => "_dd.appsec.waf.duration",
            Self::AppsecWafTimeouts => "_dd.appsec.waf.timeouts",
            Self::AppsecWafErrors => "_dd.appsec.waf.error",
            Self::AppsecRaspDuration => "_dd.appsec.rasp.duration",
            Self::AppsecRaspRuleEval => "_dd.appsec.rasp.rule.eval",
            Self::AppsecRaspTimeouts => "_dd.appsec.rasp.timeout",
            Self::AppsecRaspErrors => "_dd.appsec.rasp.error",
            Self::Origin => "_dd.origin",
            Self::ManualKeep => "manual.keep",
            Self::SamplingPriorityV1 => "_sampling_priority_v1",
            Self::Dynamic(name) => name,
        }
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn set(span: &dyn TagSetter, name: &TagName, value: impl Into<TagValue>) {
    span.set_tag(name.as_str(), value.into());
}

/// Rule diagnostics, reported once per evaluator handle.
pub fn add_rules_monitoring_tags(span: &dyn TagSetter, diagnostics: &Diagnostics) {
    if let Some(version) = &diagnostics.version {
        set(span, &TagName::AppsecEventRulesVersion, version.as_str());
    }
    set(span, &TagName::AppsecEventRulesLoaded, diagnostics.loaded.len() as u64);
    set(span, &TagName::AppsecEventRulesErrorCount, diagnostics.error_count() as u64);
    if !diagnostics.errors.is_empty() {
        set_serializable_tag(span, TagName::AppsecEventRulesErrors.as_str(), &diagnostics.errors);
    }
    set(span, &TagName::ManualKeep, true);
}

/// Versions and evaluation stats of a finished context. Zero counters are
/// not reported.
pub fn add_waf_monitoring_tags(
    span: &dyn TagSetter,
    rules_version: &str,
    waf_version: &str,
    stats: &ContextStats,
) {
    set(span, &TagName::AppsecWafVersion, waf_version);
    set(span, &TagName::AppsecEventRulesVersion, rules_version);
    set(span, &TagName::AppsecWafDuration, micros(stats.waf_duration));
    if stats.rasp_calls > 0 {
        set(span, &TagName::AppsecRaspDuration, micros(stats.rasp_duration));
        set(span, &TagName::AppsecRaspRuleEval, stats.rasp_calls);
        for rule_type in RaspRuleType::ALL {
            if let Some(&count) = stats.rasp_rule_evals.get(&rule_type) {
                let name = format!("{WAF_TAG_PREFIX}rasp.rule.eval.{rule_type}");
                span.set_tag(&name, TagValue::from(count));
            }
        }
    }
    let counters = [
        (TagName::AppsecWafTimeouts, stats.waf_timeouts),
        (TagName::AppsecRaspTimeouts, stats.rasp_timeouts),
        (TagName::AppsecWafErrors, stats.waf_errors),
        (TagName::AppsecRaspErrors, stats.rasp_errors),
    ];
    for (name, value) in counters {
        if value > 0 {
            set(span, &name, value);
        }
    }
}

/// Tags marking the span as carrying a security event.
pub fn set_event_span_tags(span: &dyn TagSetter) {
    debug!("appsec: setting span tag {}:appsec", TagName::Origin);
    set(span, &TagName::Origin, "appsec");
    set(span, &TagName::AppsecEvent, true);
    set(span, &TagName::SamplingPriorityV1, SAMPLING_PRIORITY_USER_KEEP);
}

fn micros(duration: std::time::Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000.0
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::trace::SpanTags;

    #[test]
    fn test_rules_monitoring_tags() {
        let span = SpanTags::new();
        let diagnostics = Diagnostics {
            version: Some("1.13.3".to_string()),
            loaded: vec!["a".to_string(), "b".to_string()],
            failed: vec!["c".to_string()],
            errors: json!({"bad operator": ["c"]}).as_object().cloned().unwrap(),
        };
        add_rules_monitoring_tags(&span, &diagnostics);

        assert_eq!(span.get("_dd.appsec.event_rules.version"), Some(TagValue::from("1.13.3")));
        assert_eq!(span.get("_dd.appsec.event_rules.loaded"), Some(TagValue::Int(2)));
        assert_eq!(span.get("_dd.appsec.event_rules.error_count"), Some(TagValue::Int(1)));
        assert_eq!(
            span.get("_dd.appsec.event_rules.errors"),
            Some(TagValue::from(r#"{"bad operator":["c"]}"#))
        );
    }

    #[test]
    fn test_rules_errors_omitted_when_empty() {
        let span = SpanTags::new();
        add_rules_monitoring_tags(&span, &Diagnostics::default());
        assert!(!span.contains("_dd.appsec.event_rules.errors"));
        assert!(!span.contains("_dd.appsec.event_rules.version"));
    }

    #[test]
    fn test_waf_monitoring_tags() {
        let span = SpanTags::new();
        let mut stats = ContextStats {
            waf_duration: Duration::from_micros(1_500),
            rasp_duration: Duration::from_micros(250),
            rasp_calls: 2,
            waf_timeouts: 1,
            ..ContextStats::default()
        };
        stats.rasp_rule_evals.insert(RaspRuleType::SqlInjection, 2);
        add_waf_monitoring_tags(&span, "1.13.3", "1.24.1", &stats);

        assert_eq!(span.get("_dd.appsec.waf.version"), Some(TagValue::from("1.24.1")));
        assert_eq!(span.get("_dd.appsec.waf.duration"), Some(TagValue::Float(1_500.0)));
        assert_eq!(span.get("_dd.appsec.rasp.duration"), Some(TagValue::Float(250.0)));
        assert_eq!(span.get("_dd.appsec.rasp.rule.eval"), Some(TagValue::Int(2)));
        assert_eq!(
            span.get("_dd.appsec.rasp.rule.eval.sql_injection"),
            Some(TagValue::Int(2))
        );
        assert_eq!(span.get("_dd.appsec.waf.timeouts"), Some(TagValue::Int(1)));
        assert!(!span.contains("_dd.appsec.rasp.timeout"));
        assert!(!span.contains("_dd.appsec.waf.error"));
    }

    #[test]
    fn test_event_span_tags() {
        let span = SpanTags::new();
        set_event_span_tags(&span);
        assert_eq!(span.get("_dd.origin"), Some(TagValue::from("appsec")));
        assert_eq!(span.get("appsec.event"), Some(TagValue::Bool(true)));
        assert_eq!(span.get("_sampling_priority_v1"), Some(TagValue::Float(2.0)));
    }
}
