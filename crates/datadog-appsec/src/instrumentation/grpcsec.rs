// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! gRPC server handlers.

use std::sync::Arc;

use serde_json::Value;

use crate::addresses::AddressesBuilder;
use crate::dyngo::{self, ArgOf, AsOperation, Operation, ResultOf};
use crate::instrumentation::{context_for, BlockingSlot, Multimap};
use crate::trace::TagSetter;
use crate::waf::actions::BlockingSecurityEvent;
use crate::waf::context::{run_from, run_simple, ContextOperation};
use crate::waf::evaluator::RunAddressData;

#[derive(Debug, Clone, Default)]
pub struct HandlerOperationArgs {
    /// Full method name, such as `/package.Service/Method`.
    pub method: String,
    pub metadata: Multimap,
    /// Peer address of the connection, with or without a port.
    pub remote_addr: Option<String>,
}

impl ArgOf for HandlerOperationArgs {
    type Operation = HandlerOperation;
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOperationRes {
    pub status_code: u32,
    pub headers: Multimap,
    pub trailers: Multimap,
}

impl ResultOf for HandlerOperationRes {
    type Operation = HandlerOperation;
}

/// The operation of a gRPC handler, unary or streaming.
pub struct HandlerOperation {
    op: Operation,
    context: Arc<ContextOperation>,
    owns_context: bool,
    blocking: Arc<BlockingSlot>,
}

impl AsOperation for HandlerOperation {
    fn as_operation(&self) -> &Operation {
        &self.op
    }
}

/// Starts the operation of a gRPC handler. Call
/// [`HandlerOperation::check_blocked`] before running the handler.
#[must_use]
pub fn start_handler_operation(
    parent: &Operation,
    args: HandlerOperationArgs,
    tags: Arc<dyn TagSetter>,
) -> Arc<HandlerOperation> {
    let (context, owns_context) = context_for(parent, tags);
    let op = Operation::new(Some(context.operation()));
    let blocking = BlockingSlot::listen(&op);
    let handler = Arc::new(HandlerOperation {
        op,
        context,
        owns_context,
        blocking,
    });
    dyngo::start_and_bind_operation(&handler, args);
    handler
}

impl HandlerOperation {
    #[must_use]
    pub fn context(&self) -> &Arc<ContextOperation> {
        &self.context
    }

    pub fn run(&self, data: RunAddressData) {
        run_from(&self.op, data);
    }

    /// `Err` carrying the gRPC status to return once a rule blocked the call.
    pub fn check_blocked(&self) -> Result<(), BlockingSecurityEvent> {
        self.blocking.check()
    }

    /// Monitors a message received from the client.
    pub fn monitor_request_message(&self, message: Value) -> Result<(), BlockingSecurityEvent> {
        run_simple(
            &self.op,
            AddressesBuilder::new()
                .with_grpc_request_message(Some(message))
                .build(),
        )
    }

    /// Monitors a message about to be sent to the client.
    pub fn monitor_response_message(&self, message: Value) -> Result<(), BlockingSecurityEvent> {
        run_simple(
            &self.op,
            AddressesBuilder::new()
                .with_grpc_response_message(Some(message))
                .build(),
        )
    }

    pub fn finish(&self, res: HandlerOperationRes) -> Result<(), BlockingSecurityEvent> {
        dyngo::finish_operation(self, res);
        if self.owns_context {
            self.context.finish();
        }
        self.check_blocked()
    }
}
