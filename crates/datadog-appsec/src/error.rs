// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while starting or running App & API Protection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// App & API Protection is not enabled in the configuration.
    #[error("appsec: feature is not enabled")]
    FeatureDisabled,

    #[error("appsec: the WAF evaluator is unavailable: {0}")]
    EvaluatorUnavailable(String),

    #[error("appsec: failed to build the WAF handle: {0}")]
    HandleCreation(String),

    #[error("appsec: invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("appsec: failed to read the rules file {path}: {err}", path = .0.display(), err = .1)]
    RulesFile(PathBuf, #[source] std::io::Error),

    #[error("appsec: failed to parse the security rules: {0}")]
    RulesParse(#[from] serde_json::Error),

    #[error("appsec: failed to start feature {feature}: {reason}")]
    FeatureStart { feature: String, reason: String },

    #[error("appsec: failed to create a WAF context: {0}")]
    ContextCreation(String),

    #[error("appsec: WAF run failed: {0}")]
    Run(String),
}
