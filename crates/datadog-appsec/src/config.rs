// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::apisec::DEFAULT_SAMPLE_DELAY;
use crate::error::{Error, Result};
use crate::stacktrace::DEFAULT_MAX_DEPTH;
use crate::waf::actions::{ActionSettings, BlockTemplates};
use crate::waf::context::{ContextSettings, DEFAULT_WAF_TIMEOUT};
use crate::waf::evaluator::ObfuscatorConfig;

pub const ENV_ENABLED: &str = "DD_APPSEC_ENABLED";
pub const ENV_RULES: &str = "DD_APPSEC_RULES";
pub const ENV_WAF_TIMEOUT: &str = "DD_APPSEC_WAF_TIMEOUT";
pub const ENV_TRACE_RATE_LIMIT: &str = "DD_APPSEC_TRACE_RATE_LIMIT";
pub const ENV_OBFUSCATOR_KEY: &str = "DD_APPSEC_OBFUSCATION_PARAMETER_KEY_REGEXP";
pub const ENV_OBFUSCATOR_VALUE: &str = "DD_APPSEC_OBFUSCATION_PARAMETER_VALUE_REGEXP";
pub const ENV_RASP_ENABLED: &str = "DD_APPSEC_RASP_ENABLED";
pub const ENV_STACK_TRACE_ENABLED: &str = "DD_APPSEC_STACK_TRACE_ENABLE";
pub const ENV_MAX_STACK_TRACE_DEPTH: &str = "DD_APPSEC_MAX_STACK_TRACE_DEPTH";
pub const ENV_MAX_STACK_TRACES: &str = "DD_APPSEC_MAX_STACK_TRACES";
pub const ENV_CLIENT_IP_HEADER: &str = "DD_TRACE_CLIENT_IP_HEADER";
pub const ENV_API_SECURITY_ENABLED: &str = "DD_API_SECURITY_ENABLED";
pub const ENV_API_SECURITY_SAMPLE_DELAY: &str = "DD_API_SECURITY_SAMPLE_DELAY";
pub const ENV_BLOCKED_TEMPLATE_JSON: &str = "DD_APPSEC_HTTP_BLOCKED_TEMPLATE_JSON";
pub const ENV_BLOCKED_TEMPLATE_HTML: &str = "DD_APPSEC_HTTP_BLOCKED_TEMPLATE_HTML";

pub const DEFAULT_TRACE_RATE_LIMIT: u64 = 100;
pub const DEFAULT_MAX_STACK_TRACES: usize = 2;

pub const DEFAULT_OBFUSCATOR_KEY_REGEX: &str = r"(?i)(?:p(?:ass)?w(?:or)?d|pass(?:_?phrase)?|secret|(?:api_?|private_?|public_?)key)|token|consumer_?(?:id|key|secret)|sign(?:ed|ature)|bearer|authorization";
pub const DEFAULT_OBFUSCATOR_VALUE_REGEX: &str = r#"(?i)(?:p(?:ass)?w(?:or)?d|pass(?:_?phrase)?|secret|(?:api_?|private_?|public_?|access_?|secret_?)key(?:_?id)?|token|consumer_?(?:id|key|secret)|sign(?:ed|ature)?|auth(?:entication|orization)?)(?:\s*=[^;]|"\s*:\s*"[^"]+")|bearer\s+[a-z0-9\._\-]+|token:[a-z0-9]{13}|gh[opsu]_[0-9a-zA-Z]{36}|ey[I-L][\w=-]+\.ey[I-L][\w=-]+(?:\.[\w.+\/=-]+)?|[\-]{5}BEGIN[a-z\s]+PRIVATE\sKEY[\-]{5}[^\-]+[\-]{5}END[a-z\s]+PRIVATE\sKEY|ssh-rsa\s*[a-z0-9\/\.+]{100,}"#;

/// App & API Protection configuration. Immutable once features are
/// registered.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub enabled: bool,
    /// Path of a custom ruleset; the embedded ruleset is used when unset.
    pub rules_path: Option<PathBuf>,
    pub waf_timeout: Duration,
    /// Security events reported per second.
    pub trace_rate_limit: u64,
    pub obfuscator_key_regex: String,
    pub obfuscator_value_regex: String,
    pub rasp_enabled: bool,
    pub stack_trace_enabled: bool,
    pub max_stack_trace_depth: usize,
    pub max_stack_traces: usize,
    pub client_ip_header: Option<String>,
    pub api_security_enabled: bool,
    pub api_security_sample_delay: Duration,
    pub blocked_template_json: String,
    pub blocked_template_html: String,
    /// Whether the trace writer accepts structured tags.
    pub meta_struct_available: bool,
}

impl Default for Config {
    fn default() -> Self {
        let templates = BlockTemplates::default();
        Self {
            enabled: false,
            rules_path: None,
            waf_timeout: DEFAULT_WAF_TIMEOUT,
            trace_rate_limit: DEFAULT_TRACE_RATE_LIMIT,
            obfuscator_key_regex: DEFAULT_OBFUSCATOR_KEY_REGEX.to_string(),
            obfuscator_value_regex: DEFAULT_OBFUSCATOR_VALUE_REGEX.to_string(),
            rasp_enabled: true,
            stack_trace_enabled: true,
            max_stack_trace_depth: DEFAULT_MAX_DEPTH,
            max_stack_traces: DEFAULT_MAX_STACK_TRACES,
            client_ip_header: None,
            api_security_enabled: true,
            api_security_sample_delay: DEFAULT_SAMPLE_DELAY,
            blocked_template_json: templates.json,
            blocked_template_html: templates.html,
            meta_struct_available: false,
        }
    }
}

impl Config {
    /// Reads the configuration from the environment. Unset or unparsable
    /// values keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(enabled) = read(ENV_ENABLED, parse_bool) {
            config.enabled = enabled;
        }
        config.rules_path = env::var(ENV_RULES).ok().filter(|p| !p.is_empty()).map(PathBuf::from);
        if let Some(timeout) = read(ENV_WAF_TIMEOUT, parse_waf_timeout).filter(|t| !t.is_zero()) {
            config.waf_timeout = timeout;
        }
        if let Some(rate) = read(ENV_TRACE_RATE_LIMIT, |v| v.parse().ok()).filter(|&r: &u64| r > 0) {
            config.trace_rate_limit = rate;
        }
        if let Some(regex) = read(ENV_OBFUSCATOR_KEY, compiled_regex) {
            config.obfuscator_key_regex = regex;
        }
        if let Some(regex) = read(ENV_OBFUSCATOR_VALUE, compiled_regex) {
            config.obfuscator_value_regex = regex;
        }
        if let Some(enabled) = read(ENV_RASP_ENABLED, parse_bool) {
            config.rasp_enabled = enabled;
        }
        if let Some(enabled) = read(ENV_STACK_TRACE_ENABLED, parse_bool) {
            config.stack_trace_enabled = enabled;
        }
        if let Some(depth) = read(ENV_MAX_STACK_TRACE_DEPTH, |v| v.parse().ok()).filter(|&d: &usize| d > 0) {
            config.max_stack_trace_depth = depth;
        }
        if let Some(max) = read(ENV_MAX_STACK_TRACES, |v| v.parse().ok()) {
            config.max_stack_traces = max;
        }
        config.client_ip_header = env::var(ENV_CLIENT_IP_HEADER)
            .ok()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty());
        if let Some(enabled) = read(ENV_API_SECURITY_ENABLED, parse_bool) {
            config.api_security_enabled = enabled;
        }
        if let Some(delay) = read(ENV_API_SECURITY_SAMPLE_DELAY, parse_seconds) {
            config.api_security_sample_delay = delay;
        }
        if let Some(template) = read(ENV_BLOCKED_TEMPLATE_JSON, read_file) {
            config.blocked_template_json = template;
        }
        if let Some(template) = read(ENV_BLOCKED_TEMPLATE_HTML, read_file) {
            config.blocked_template_html = template;
        }
        config
    }

    /// Checks the invariants features rely on.
    pub fn validate(&self) -> Result<()> {
        if self.waf_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "the WAF timeout must be strictly positive".to_string(),
            ));
        }
        if self.trace_rate_limit == 0 {
            return Err(Error::InvalidConfig(
                "the trace rate limit must be strictly positive".to_string(),
            ));
        }
        if self.max_stack_trace_depth == 0 {
            return Err(Error::InvalidConfig(
                "the maximum stack trace depth must be strictly positive".to_string(),
            ));
        }
        for (name, regex) in [
            ("key", &self.obfuscator_key_regex),
            ("value", &self.obfuscator_value_regex),
        ] {
            Regex::new(regex).map_err(|e| {
                Error::InvalidConfig(format!("invalid obfuscator {name} regular expression: {e}"))
            })?;
        }
        Ok(())
    }

    #[must_use]
    pub fn obfuscator(&self) -> ObfuscatorConfig {
        ObfuscatorConfig {
            key_regex: self.obfuscator_key_regex.clone(),
            value_regex: self.obfuscator_value_regex.clone(),
        }
    }

    /// Settings of the WAF contexts created with this configuration.
    #[must_use]
    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            timeout: self.waf_timeout,
            actions: ActionSettings {
                templates: Arc::new(BlockTemplates {
                    json: self.blocked_template_json.clone(),
                    html: self.blocked_template_html.clone(),
                }),
                stack_trace_enabled: self.stack_trace_enabled,
                max_stack_trace_depth: self.max_stack_trace_depth,
            },
            max_stack_traces: self.max_stack_traces,
        }
    }
}

fn read<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let value = env::var(name).ok()?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let parsed = parse(value);
    if parsed.is_none() {
        debug!("appsec: could not parse the env var {name}={value}, using the default value");
    }
    parsed
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// A duration in microseconds, unless suffixed with `ns`, `us`, `µs`, `ms`,
/// `s` or `m`.
fn parse_waf_timeout(value: &str) -> Option<Duration> {
    parse_duration(value, Duration::from_micros)
}

/// A duration in seconds, unless suffixed with a unit.
fn parse_seconds(value: &str) -> Option<Duration> {
    parse_duration(value, Duration::from_secs)
}

fn parse_duration(value: &str, unitless: fn(u64) -> Duration) -> Option<Duration> {
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount.parse().ok()?;
    let duration = match unit.trim() {
        "" => unitless(amount),
        "ns" => Duration::from_nanos(amount),
        "us" | "µs" => Duration::from_micros(amount),
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.checked_mul(60)?),
        _ => return None,
    };
    Some(duration)
}

fn compiled_regex(value: &str) -> Option<String> {
    Regex::new(value).ok().map(|_| value.to_string())
}

fn read_file(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .map_err(|e| debug!("appsec: could not read the blocking response template {path}: {e}"))
        .ok()
}
