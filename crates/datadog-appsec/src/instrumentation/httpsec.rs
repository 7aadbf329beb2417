// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP server handlers and outbound HTTP round trips.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::addresses::AddressesBuilder;
use crate::dyngo::{self, on_data, ArgOf, AsOperation, Operation, ResultOf};
use crate::instrumentation::{context_for, BlockingSlot, Multimap};
use crate::trace::TagSetter;
use crate::waf::actions::{BlockHttp, BlockingSecurityEvent};
use crate::waf::context::{run_from, run_simple, ContextOperation};
use crate::waf::evaluator::RunAddressData;

/// What is known of a request when its handler starts.
#[derive(Debug, Clone, Default)]
pub struct HandlerOperationArgs {
    pub method: String,
    pub raw_uri: String,
    /// Route template, such as `/users/{id}`.
    pub route: Option<String>,
    pub headers: Multimap,
    pub cookies: Multimap,
    pub query: Multimap,
    pub path_params: HashMap<String, String>,
    /// Peer address of the connection, with or without a port.
    pub remote_addr: Option<String>,
    /// Parsed request body, when the framework parses it before the handler.
    pub body: Option<Value>,
}

impl ArgOf for HandlerOperationArgs {
    type Operation = HandlerOperation;
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOperationRes {
    pub status: u16,
    pub headers: Multimap,
    pub body: Option<Value>,
}

impl ResultOf for HandlerOperationRes {
    type Operation = HandlerOperation;
}

/// The operation of an HTTP handler. It reuses the WAF context enclosing
/// its parent, or starts its own.
pub struct HandlerOperation {
    op: Operation,
    context: Arc<ContextOperation>,
    owns_context: bool,
    method: String,
    route: Option<String>,
    response: Mutex<Option<BlockHttp>>,
    blocking: Arc<BlockingSlot>,
}

impl AsOperation for HandlerOperation {
    fn as_operation(&self) -> &Operation {
        &self.op
    }
}

/// Starts the operation of a request handler. Call
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
        method: args.method.clone(),
        route: args.route.clone(),
        response: Mutex::new(None),
        blocking,
    });

    let weak = Arc::downgrade(&handler);
    on_data::<BlockHttp, _>(&handler.op, move |response| {
        if let Some(handler) = weak.upgrade() {
            handler
                .response
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert_with(|| response.clone());
        }
    });

    dyngo::start_and_bind_operation(&handler, args);
    handler
}

impl HandlerOperation {
    #[must_use]
    pub fn context(&self) -> &Arc<ContextOperation> {
        &self.context
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Asks the WAF context to evaluate `data` on behalf of this handler.
    pub fn run(&self, data: RunAddressData) {
        run_from(&self.op, data);
    }

    /// `Err` once a rule blocked the request. The handler must stop and let
    /// the blocking response be written instead.
    pub fn check_blocked(&self) -> Result<(), BlockingSecurityEvent> {
        self.blocking.check()
    }

    /// The response to write in place of the handler's, once blocked.
    #[must_use]
    pub fn blocking_response(&self) -> Option<BlockHttp> {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Monitors a request body parsed by the handler itself.
    pub fn monitor_parsed_body(&self, body: Value) -> Result<(), BlockingSecurityEvent> {
        run_simple(
            &self.op,
            AddressesBuilder::new().with_request_body(Some(body)).build(),
        )
    }

    /// Finishes the handler, evaluating its response. The WAF context is
    /// finished too when the handler started it.
    pub fn finish(&self, res: HandlerOperationRes) -> Result<(), BlockingSecurityEvent> {
        dyngo::finish_operation(self, res);
        if self.owns_context {
            self.context.finish();
        }
        self.check_blocked()
    }
}

/// Start arguments of an outbound HTTP request.
#[derive(Debug, Clone)]
pub struct RoundTripOperationArgs {
    pub url: String,
}

impl ArgOf for RoundTripOperationArgs {
    type Operation = RoundTripOperation;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoundTripOperationRes;

impl ResultOf for RoundTripOperationRes {
    type Operation = RoundTripOperation;
}

pub struct RoundTripOperation {
    op: Operation,
}

impl AsOperation for RoundTripOperation {
    fn as_operation(&self) -> &Operation {
        &self.op
    }
}

/// Evaluates an outbound request to `url` before it is sent. An `Err` means
/// the request must not be sent. It is never retried here.
pub fn protect_round_trip(parent: &Operation, url: &str) -> Result<(), BlockingSecurityEvent> {
    let op = RoundTripOperation {
        op: Operation::new(Some(parent)),
    };
    let blocking = BlockingSlot::listen(&op.op);
    dyngo::start_operation(&op, RoundTripOperationArgs {
        url: url.to_string(),
    });
    dyngo::finish_operation(&op, RoundTripOperationRes);
    blocking.check()
}
