// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Datadog App & API Protection
//!
//! In-process runtime security for instrumented services. Integrations start
//! operations in a hierarchical [`dyngo`] graph; security features listen on
//! that graph, feed the addresses they observe to the WAF evaluator through a
//! per-request [`waf::WafContext`], and turn the evaluator's verdicts into
//! span tags, stack traces and blocking responses.
//!
//! ## Architecture
//!
//! - [`dyngo`]: operation graph and typed event dispatch
//! - [`instrumentation`]: operations for HTTP, gRPC, GraphQL, SQL, outgoing
//!   HTTP requests and user events
//! - [`features`]: listeners turning those operations into WAF runs
//! - [`waf`]: evaluator seam, handle, context operation and span tags
//! - [`appsec`]: start, stop and root operation lifecycle
//! - [`ring_queue`], [`limiter`], [`apisec`]: supporting data structures

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_copy_implementations)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::module_name_repetitions)]
// Allow use of the `coverage_nightly` attribute for code coverage
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

/// WAF address names and the builder of run payloads
pub mod addresses;

/// API security schema extraction sampling
pub mod apisec;

/// Process-level lifecycle
pub mod appsec;

/// Environment configuration
pub mod config;

/// Operation graph and event dispatch
pub mod dyngo;

pub mod error;

/// Security features registered on the root operation
pub mod features;

/// Operations started by integrations
pub mod instrumentation;

/// Token bucket rate limiting
pub mod limiter;

/// Log line formatting
pub mod logger;

/// Bounded FIFO queues with pooled buffers
pub mod ring_queue;

/// Security rules loading
pub mod ruleset;

pub mod stacktrace;

/// Internal telemetry records
pub mod telemetry;

/// Span tag seam
pub mod trace;

/// WAF evaluator, handle and context
pub mod waf;

pub use appsec::AppSec;
pub use config::Config;
pub use error::{Error, Result};
pub use waf::actions::BlockingSecurityEvent;

/// Marks a code path that a correct caller never reaches. Panics in debug
/// builds and logs a warning in release builds.
#[cold]
#[track_caller]
pub(crate) fn unreachable_warn(msg: &'static str) {
    if cfg!(debug_assertions) {
        unreachable!("{msg}");
    } else {
        tracing::warn!("{msg}");
    }
}
