// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Feature bundles wiring the instrumentation operations to the WAF.
//!
//! A feature is only registered when the loaded rules consume at least one
//! of the addresses it supplies. Registration happens on the root operation,
//! before it is handed to instrumented call sites.

pub mod clientip;
pub mod graphqlsec;
pub mod grpcsec;
pub mod httpsec;
pub mod sqlsec;
pub mod ssrf;
pub mod usersec;
pub mod waf;

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::addresses::AddressSet;
use crate::config::Config;
use crate::dyngo::Operation;
use crate::error::Result;
use crate::telemetry::Telemetry;
use crate::waf::handle::WafHandle;

/// A registered listener bundle.
pub trait Feature: fmt::Display + Send + Sync {
    /// Releases the resources of the feature. Calling it again has no effect.
    fn stop(&self);
}

/// What features are built from.
pub struct FeatureContext<'a> {
    pub config: &'a Config,
    pub supported: &'a AddressSet,
    pub handle: &'a WafHandle,
    pub telemetry: &'a Arc<Telemetry>,
    pub root: &'a Operation,
}

/// Builds a feature, or returns `None` when it has nothing to do with the
/// current configuration and rules.
pub type NewFeature = fn(&FeatureContext<'_>) -> Result<Option<Box<dyn Feature>>>;

/// Every feature, in registration order.
pub const FEATURES: &[NewFeature] = &[
    waf::new_feature,
    httpsec::new_feature,
    grpcsec::new_feature,
    graphqlsec::new_feature,
    usersec::new_feature,
    sqlsec::new_feature,
    ssrf::new_feature,
];

/// Registers every applicable feature on `ctx.root`. On failure, the
/// features registered so far are stopped.
pub fn register_features(ctx: &FeatureContext<'_>) -> Result<Vec<Box<dyn Feature>>> {
    let mut features: Vec<Box<dyn Feature>> = Vec::with_capacity(FEATURES.len());
    for new_feature in FEATURES {
        match new_feature(ctx) {
            Ok(Some(feature)) => {
                debug!("appsec: enabled feature {feature}");
                features.push(feature);
            }
            Ok(None) => {}
            Err(e) => {
                stop_features(&features);
                return Err(e);
            }
        }
    }
    Ok(features)
}

pub fn stop_features(features: &[Box<dyn Feature>]) {
    for feature in features {
        debug!("appsec: stopping feature {feature}");
        feature.stop();
    }
}
