// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! WAF orchestration: the evaluator interface, its reference-counted handle,
//! the per-request context operation, action dispatch and span tags.

pub mod actions;
pub mod context;
pub mod evaluator;
pub mod handle;
pub mod tags;

pub use actions::{BlockGrpc, BlockHttp, BlockingSecurityEvent, StackTraceAction};
pub use context::{
    listen_run_events, run_from, run_simple, start_context_operation, ContextArgs,
    ContextOperation, ContextRes, ContextSettings, RunEvent, SecurityEvent,
};
pub use evaluator::{
    Diagnostics, Evaluator, NativeContext, NativeHandle, ObfuscatorConfig, RunAddressData, RunResult,
    Scope,
};
pub use handle::{ContextStats, WafContext, WafHandle};
