// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interface of the native rule evaluator (the WAF library itself).
//!
//! The evaluator is provided by the embedder: this crate only orchestrates
//! it. An implementation loads the native library ([`Evaluator::load`]),
//! compiles rules into a [`NativeHandle`], and creates one [`NativeContext`]
//! per request out of that handle.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::addresses::AddressSet;
use crate::error::Result;

/// Scope a run is accounted under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Scope {
    #[default]
    Waf,
    Rasp,
}

impl Scope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waf => "waf",
            Self::Rasp => "rasp",
        }
    }
}

/// Address data of one run.
///
/// Persistent addresses stay visible to every later run of the same context,
/// ephemeral ones only to the run that carries them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunAddressData {
    pub persistent: Map<String, Value>,
    pub ephemeral: Map<String, Value>,
    pub scope: Scope,
}

impl RunAddressData {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.persistent.is_empty() && self.ephemeral.is_empty()
    }

    /// Drops the addresses the loaded rules do not consume. Pseudo-addresses
    /// (`waf.*`) are always kept.
    #[must_use]
    pub fn retain_supported(mut self, supported: &AddressSet) -> Self {
        let keep = |addr: &String, _: &mut Value| supported.contains(addr) || addr.starts_with("waf.");
        self.persistent.retain(keep);
        self.ephemeral.retain(keep);
        self
    }
}

/// Regular expressions the evaluator uses to redact sensitive keys and
/// values from reported events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObfuscatorConfig {
    pub key_regex: String,
    pub value_regex: String,
}

/// Outcome of compiling a ruleset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Version of the ruleset (`metadata.rules_version`), if it declares one.
    pub version: Option<String>,
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
    /// Error messages mapped to the identifiers of the rules that raised them.
    pub errors: Map<String, Value>,
}

impl Diagnostics {
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.failed.len()
    }
}

/// Result of a single run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    /// Rule matches, reported verbatim in the triggers payload.
    pub events: Vec<Value>,
    /// Actions keyed by action type (`block_request`, `generate_stack`...),
    /// each with its parameters.
    pub actions: Map<String, Value>,
    /// Values extracted by the evaluator processors, such as API schemas.
    pub derivatives: Map<String, Value>,
    pub timeout: bool,
    /// Whether the trace must be kept regardless of sampling.
    pub keep: bool,
    pub elapsed: Duration,
}

impl RunResult {
    #[must_use]
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    #[must_use]
    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }
}

pub trait Evaluator: Send + Sync {
    /// Loads the native library. `Ok(Some(_))` carries a non-fatal warning.
    fn load(&self) -> Result<Option<String>>;

    /// Version of the native library.
    fn version(&self) -> String;

    /// Compiles `rules` into a handle.
    fn new_handle(
        &self,
        rules: &Value,
        obfuscator: &ObfuscatorConfig,
    ) -> Result<(Box<dyn NativeHandle>, Diagnostics)>;
}

/// Compiled rules. Safe for concurrent context creation.
pub trait NativeHandle: Send + Sync {
    /// Addresses the compiled rules consume.
    fn addresses(&self) -> Vec<String>;

    fn new_context(&self, budget: Duration) -> Result<Box<dyn NativeContext>>;

    /// Releases the native resources. Called exactly once.
    fn close(&self);
}

/// Per-request evaluation state. Not safe for concurrent use.
pub trait NativeContext: Send {
    fn run(&mut self, data: &RunAddressData, budget: Duration) -> Result<RunResult>;

    /// Releases the native resources. Called exactly once.
    fn close(&mut self);
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::addresses::{AddressesBuilder, CLIENT_IP, SERVER_DB_STATEMENT, SERVER_REQUEST_METHOD};

    #[test]
    fn test_retain_supported() {
        let supported = AddressSet::from_declared([CLIENT_IP, SERVER_DB_STATEMENT]);
        let data = AddressesBuilder::new()
            .with_method("GET")
            .with_client_ip("10.0.0.1".parse().ok())
            .with_db_statement("SELECT 1")
            .extract_schema()
            .build()
            .retain_supported(&supported);

        assert!(!data.persistent.contains_key(SERVER_REQUEST_METHOD));
        assert!(data.persistent.contains_key(CLIENT_IP));
        assert!(data.persistent.contains_key("waf.context.processor"));
        assert!(data.ephemeral.contains_key(SERVER_DB_STATEMENT));
    }

    #[test]
    fn test_diagnostics_serialization() {
        let diagnostics = Diagnostics {
            version: Some("1.13.3".to_string()),
            loaded: vec!["crs-942-100".to_string()],
            failed: vec!["bad-rule".to_string()],
            errors: json!({"missing key 'operator'": ["bad-rule"]})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };
        assert_eq!(diagnostics.error_count(), 1);
        let value = serde_json::to_value(&diagnostics).unwrap();
        assert_eq!(value["version"], "1.13.3");
    }
}
