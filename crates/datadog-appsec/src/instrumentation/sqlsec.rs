// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SQL statements executed by the application.

use crate::dyngo::{self, ArgOf, AsOperation, Operation, ResultOf};
use crate::instrumentation::BlockingSlot;
use crate::waf::actions::BlockingSecurityEvent;

#[derive(Debug, Clone, Default)]
pub struct SqlOperationArgs {
    pub query: String,
    /// Database system, such as `postgresql` or `mysql`.
    pub driver: String,
}

impl ArgOf for SqlOperationArgs {
    type Operation = SqlOperation;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlOperationRes;

impl ResultOf for SqlOperationRes {
    type Operation = SqlOperation;
}

pub struct SqlOperation {
    op: Operation,
}

impl AsOperation for SqlOperation {
    fn as_operation(&self) -> &Operation {
        &self.op
    }
}

/// Evaluates `query` before it is executed. An `Err` means the query must
/// not be executed.
pub fn protect_sql_operation(
    parent: &Operation,
    query: &str,
    driver: &str,
) -> Result<(), BlockingSecurityEvent> {
    let op = SqlOperation {
        op: Operation::new(Some(parent)),
    };
    let blocking = BlockingSlot::listen(&op.op);
    dyngo::start_operation(&op, SqlOperationArgs {
        query: query.to_string(),
        driver: driver.to_string(),
    });
    dyngo::finish_operation(&op, SqlOperationRes);
    blocking.check()
}
