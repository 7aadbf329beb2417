// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! GraphQL requests and field resolutions.
//!
//! A request operation wraps the whole GraphQL request; every field resolved
//! while executing it starts a resolve operation below it.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::dyngo::{self, ArgOf, AsOperation, Operation, ResultOf};
use crate::instrumentation::{context_for, BlockingSlot};
use crate::trace::TagSetter;
use crate::waf::actions::BlockingSecurityEvent;
use crate::waf::context::{run_from, ContextOperation};
use crate::waf::evaluator::RunAddressData;

#[derive(Debug, Clone, Default)]
pub struct RequestOperationArgs {
    pub raw_query: String,
    pub operation_name: Option<String>,
    pub variables: Map<String, Value>,
}

impl ArgOf for RequestOperationArgs {
    type Operation = RequestOperation;
}

#[derive(Debug, Clone, Default)]
pub struct RequestOperationRes {
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ResultOf for RequestOperationRes {
    type Operation = RequestOperation;
}

pub struct RequestOperation {
    op: Operation,
    context: Arc<ContextOperation>,
    owns_context: bool,
    blocking: Arc<BlockingSlot>,
}

impl AsOperation for RequestOperation {
    fn as_operation(&self) -> &Operation {
        &self.op
    }
}

/// Starts a GraphQL request. It joins the WAF context of the enclosing HTTP
/// handler, if any.
#[must_use]
pub fn start_request_operation(
    parent: &Operation,
    args: RequestOperationArgs,
    tags: Arc<dyn TagSetter>,
) -> Arc<RequestOperation> {
    let (context, owns_context) = context_for(parent, tags);
    let op = Operation::new(Some(context.operation()));
    let blocking = BlockingSlot::listen(&op);
    let request = Arc::new(RequestOperation {
        op,
        context,
        owns_context,
        blocking,
    });
    dyngo::start_and_bind_operation(&request, args);
    request
}

impl RequestOperation {
    #[must_use]
    pub fn context(&self) -> &Arc<ContextOperation> {
        &self.context
    }

    /// `Err` once one of the fields resolved so far was blocked.
    pub fn check_blocked(&self) -> Result<(), BlockingSecurityEvent> {
        self.blocking.check()
    }

    pub fn finish(&self, res: RequestOperationRes) -> Result<(), BlockingSecurityEvent> {
        dyngo::finish_operation(self, res);
        if self.owns_context {
            self.context.finish();
        }
        self.check_blocked()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOperationArgs {
    pub type_name: String,
    pub field_name: String,
    pub arguments: Map<String, Value>,
    /// Whether the resolver only reads a property, without side effects.
    pub trivial: bool,
}

impl ArgOf for ResolveOperationArgs {
    type Operation = ResolveOperation;
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOperationRes {
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ResultOf for ResolveOperationRes {
    type Operation = ResolveOperation;
}

pub struct ResolveOperation {
    op: Operation,
}

impl AsOperation for ResolveOperation {
    fn as_operation(&self) -> &Operation {
        &self.op
    }
}

/// Starts the resolution of a field. When a rule blocks it, the operation is
/// finished right away and the resolver must not run.
pub fn start_resolve_operation(
    parent: &Operation,
    args: ResolveOperationArgs,
) -> Result<ResolveOperation, BlockingSecurityEvent> {
    let resolve = ResolveOperation {
        op: Operation::new(Some(parent)),
    };
    let blocking = BlockingSlot::listen(&resolve.op);
    dyngo::start_operation(&resolve, args);
    if let Err(blocked) = blocking.check() {
        resolve.finish(ResolveOperationRes {
            data: None,
            error: Some(blocked.to_string()),
        });
        return Err(blocked);
    }
    Ok(resolve)
}

impl ResolveOperation {
    pub fn run(&self, data: RunAddressData) {
        run_from(&self.op, data);
    }

    pub fn finish(&self, res: ResolveOperationRes) {
        dyngo::finish_operation(self, res);
    }
}
