// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SQL injection exploit prevention.

use std::fmt;

use crate::addresses::{AddressesBuilder, SERVER_DB_STATEMENT, SERVER_DB_SYSTEM};
use crate::dyngo::{on, AsOperation};
use crate::error::Result;
use crate::features::{Feature, FeatureContext};
use crate::instrumentation::sqlsec::{SqlOperation, SqlOperationArgs};
use crate::waf::context::run_from;

pub const ADDRESSES: &[&str] = &[SERVER_DB_STATEMENT, SERVER_DB_SYSTEM];

#[derive(Debug, Clone, Copy)]
pub struct SqlSecFeature;

pub fn new_feature(ctx: &FeatureContext<'_>) -> Result<Option<Box<dyn Feature>>> {
    if !ctx.config.rasp_enabled || !ctx.supported.any_of(ADDRESSES) {
        return Ok(None);
    }
    on::<SqlOperationArgs, _>(ctx.root, on_query);
    Ok(Some(Box::new(SqlSecFeature)))
}

impl fmt::Display for SqlSecFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SQL Injection Protection")
    }
}

impl Feature for SqlSecFeature {
    fn stop(&self) {}
}

fn on_query(op: &SqlOperation, args: &SqlOperationArgs) {
    run_from(
        op.as_operation(),
        AddressesBuilder::new()
            .with_db_statement(&args.query)
            .with_db_type(&args.driver)
            .build(),
    );
}
