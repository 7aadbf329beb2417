// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server-side request forgery exploit prevention.

use std::fmt;

use crate::addresses::{AddressesBuilder, SERVER_IO_NET_URL};
use crate::dyngo::{on, AsOperation};
use crate::error::Result;
use crate::features::{Feature, FeatureContext};
use crate::instrumentation::httpsec::{RoundTripOperation, RoundTripOperationArgs};
use crate::waf::context::run_from;

pub const ADDRESSES: &[&str] = &[SERVER_IO_NET_URL];

#[derive(Debug, Clone, Copy)]
pub struct SsrfFeature;

pub fn new_feature(ctx: &FeatureContext<'_>) -> Result<Option<Box<dyn Feature>>> {
    if !ctx.config.rasp_enabled || !ctx.supported.any_of(ADDRESSES) {
        return Ok(None);
    }
    on::<RoundTripOperationArgs, _>(ctx.root, on_round_trip);
    Ok(Some(Box::new(SsrfFeature)))
}

impl fmt::Display for SsrfFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SSRF Protection")
    }
}

impl Feature for SsrfFeature {
    fn stop(&self) {}
}

fn on_round_trip(op: &RoundTripOperation, args: &RoundTripOperationArgs) {
    run_from(
        op.as_operation(),
        AddressesBuilder::new().with_url(&args.url).build(),
    );
}
