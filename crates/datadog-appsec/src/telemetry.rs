// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process telemetry buffer.
//!
//! Records are buffered in a [`RingQueue`] until the host drains them with
//! [`Telemetry::flush`]. When the host does not drain fast enough, the oldest
//! records are dropped.

use std::fmt;

use tracing::debug;

use crate::ring_queue::{Range, RingQueue};

pub const MIN_BUFFERED_RECORDS: usize = 16;
pub const MAX_BUFFERED_RECORDS: usize = 1024;

/// Counter of the evaluated requests, reported at every context finish.
pub const WAF_REQUESTS: &str = "waf.requests";
pub const WAF_INIT: &str = "waf.init";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Debug => "DEBUG",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    Log {
        level: LogLevel,
        message: String,
    },
    Count {
        name: &'static str,
        value: u64,
        /// `key:value` pairs.
        tags: Vec<String>,
    },
}

impl TelemetryRecord {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Log {
                level: LogLevel::Error,
                ..
            }
        )
    }
}

#[derive(Debug)]
pub struct Telemetry {
    records: RingQueue<Option<TelemetryRecord>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RingQueue::new(Range::new(MIN_BUFFERED_RECORDS, MAX_BUFFERED_RECORDS)),
        }
    }

    pub fn record(&self, record: TelemetryRecord) {
        if !self.records.push(Some(record)) {
            debug!("appsec: telemetry buffer is full, dropping the oldest record");
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.record(TelemetryRecord::Log {
            level,
            message: message.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn count(&self, name: &'static str, value: u64, tags: Vec<String>) {
        self.record(TelemetryRecord::Count { name, value, tags });
    }

    /// Drains the buffered records, oldest first.
    pub fn flush(&self) -> Vec<TelemetryRecord> {
        self.records.flush().into_iter().flatten().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
