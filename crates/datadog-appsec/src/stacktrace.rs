// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack trace capture for exploit reports.

use std::backtrace::Backtrace;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::ring_queue::{Range, RingQueue};

/// Span tag holding the stack traces captured for a request.
pub const SPAN_KEY: &str = "_dd.stack";

pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Frames of the capturing machinery itself.
const SKIPPED_PREFIXES: &[&str] = &[
    "std::backtrace",
    "std::backtrace_rs",
    "datadog_appsec::stacktrace",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub id: u32,
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackTrace {
    pub id: String,
    pub language: &'static str,
    pub frames: Vec<StackFrame>,
}

/// Captures the current stack, keeping at most `max_depth` frames.
#[must_use]
pub fn capture(id: &str, max_depth: usize) -> StackTrace {
    let frames = parse(&Backtrace::force_capture().to_string());
    StackTrace {
        id: id.to_string(),
        language: "rust",
        frames: truncate(frames, max_depth),
    }
}

/// The span value for `stacks`: `{"exploit": [...]}`.
#[must_use]
pub fn span_value(stacks: &[StackTrace]) -> Value {
    json!({ "exploit": stacks })
}

lazy_static! {
    /// Frame header of a rendered backtrace: `  3: crate::module::function`.
    static ref FRAME_REGEX: Regex = Regex::new(r"^\s*\d+: (.+)$").expect("failed creating regex");

    /// Source location of the preceding frame: `at ./src/file.rs:12:5`.
    static ref LOCATION_REGEX: Regex =
        Regex::new(r"^\s+at (.+?):(\d+)(?::(\d+))?$").expect("failed creating regex");
}

/// Parses the textual rendering of a [`Backtrace`].
fn parse(rendered: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();
    let mut skipping = false;
    for line in rendered.lines() {
        if let Some(caps) = FRAME_REGEX.captures(line) {
            let function = caps[1].trim().to_string();
            skipping = SKIPPED_PREFIXES.iter().any(|p| function.starts_with(p));
            if !skipping {
                frames.push(StackFrame {
                    function,
                    ..StackFrame::default()
                });
            }
        } else if let Some(caps) = LOCATION_REGEX.captures(line) {
            if skipping {
                continue;
            }
            if let Some(frame) = frames.last_mut() {
                frame.file = Some(caps[1].to_string());
                frame.line = caps[2].parse().ok();
                frame.column = caps.get(3).and_then(|c| c.as_str().parse().ok());
            }
        }
    }
    for (id, frame) in frames.iter_mut().enumerate() {
        frame.id = u32::try_from(id).unwrap_or(u32::MAX);
    }
    frames
}

/// Keeps the top quarter of `max_depth` frames and fills the rest with the
/// bottom-most ones. Frame ids keep their original positions.
fn truncate(frames: Vec<StackFrame>, max_depth: usize) -> Vec<StackFrame> {
    if max_depth == 0 || frames.len() <= max_depth {
        return frames;
    }
    let top = max_depth / 4;
    let bottom = max_depth - top;
    debug!(
        "appsec: truncating a stack trace of {} frames to {max_depth}",
        frames.len()
    );

    let mut frames = frames.into_iter();
    let mut kept: Vec<StackFrame> = frames.by_ref().take(top).collect();
    let tail = RingQueue::new(Range::new(bottom, bottom));
    tail.enqueue(frames);
    kept.extend(tail.flush());
    kept
}
