// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock WAF evaluator with scripted verdicts

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use datadog_appsec::waf::{
    Diagnostics, Evaluator, NativeContext, NativeHandle, ObfuscatorConfig, RunAddressData, RunResult,
};
use datadog_appsec::Error;
use serde_json::{json, Value};

type Script = dyn Fn(&RunAddressData) -> RunResult + Send + Sync;

/// Shared state of a [`MockEvaluator`] and every handle and context it
/// creates.
pub struct Shared {
    pub runs: Mutex<Vec<RunAddressData>>,
    pub handle_closes: AtomicUsize,
    script: Box<Script>,
}

impl Shared {
    #[allow(dead_code)]
    pub fn runs(&self) -> Vec<RunAddressData> {
        self.runs.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn handle_closes(&self) -> usize {
        self.handle_closes.load(Ordering::SeqCst)
    }
}

/// Evaluator whose rules consume `addresses` and whose verdicts come from a
/// script.
pub struct MockEvaluator {
    pub shared: Arc<Shared>,
    addresses: Vec<String>,
    unavailable: Option<String>,
}

impl MockEvaluator {
    pub fn new(
        addresses: &[&str],
        script: impl Fn(&RunAddressData) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runs: Mutex::default(),
                handle_closes: AtomicUsize::new(0),
                script: Box::new(script),
            }),
            addresses: addresses.iter().map(ToString::to_string).collect(),
            unavailable: None,
        }
    }

    /// An evaluator that fails to load with `reason`.
    #[allow(dead_code)]
    pub fn unavailable(reason: &str) -> Self {
        Self {
            unavailable: Some(reason.to_string()),
            ..Self::new(&[], |_| RunResult::default())
        }
    }
}

impl Evaluator for MockEvaluator {
    fn load(&self) -> datadog_appsec::Result<Option<String>> {
        match &self.unavailable {
            Some(reason) => Err(Error::EvaluatorUnavailable(reason.clone())),
            None => Ok(None),
        }
    }

    fn version(&self) -> String {
        "1.24.1".to_string()
    }

    fn new_handle(
        &self,
        _rules: &Value,
        _obfuscator: &ObfuscatorConfig,
    ) -> datadog_appsec::Result<(Box<dyn NativeHandle>, Diagnostics)> {
        let handle = MockHandle {
            shared: Arc::clone(&self.shared),
            addresses: self.addresses.clone(),
        };
        let diagnostics = Diagnostics {
            version: Some("1.13.3".to_string()),
            loaded: vec!["crs-942-100".to_string(), "ua0-600-55x".to_string()],
            ..Diagnostics::default()
        };
        Ok((Box::new(handle), diagnostics))
    }
}

struct MockHandle {
    shared: Arc<Shared>,
    addresses: Vec<String>,
}

impl NativeHandle for MockHandle {
    fn addresses(&self) -> Vec<String> {
        self.addresses.clone()
    }

    fn new_context(&self, _budget: Duration) -> datadog_appsec::Result<Box<dyn NativeContext>> {
        Ok(Box::new(MockContext(Arc::clone(&self.shared))))
    }

    fn close(&self) {
        self.shared.handle_closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockContext(Arc<Shared>);

impl NativeContext for MockContext {
    fn run(&mut self, data: &RunAddressData, _budget: Duration) -> datadog_appsec::Result<RunResult> {
        self.0.runs.lock().unwrap().push(data.clone());
        Ok((self.0.script)(data))
    }

    fn close(&mut self) {}
}

/// A verdict with one event for `rule` and the given actions.
pub fn trigger(rule: &str, actions: Value) -> RunResult {
    RunResult {
        events: vec![json!({"rule": {"id": rule, "name": rule}})],
        actions: actions.as_object().cloned().unwrap_or_default(),
        elapsed: Duration::from_micros(25),
        ..RunResult::default()
    }
}
