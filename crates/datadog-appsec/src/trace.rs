// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span tagging seam between the security runtime and the tracer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// A span tag value.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    String(String),
    Int(i64),
    Bool(bool),
    Float(f64),
    /// A structured value the trace writer serializes itself (meta-struct).
    Struct(Value),
}
impl TagValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}
impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Struct(v) => write!(f, "{v}"),
        }
    }
}
impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}
impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}
impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}
impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}
impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Something that ultimately writes tags on a trace span, usually the
/// service entry span of the request.
pub trait TagSetter: Send + Sync {
    fn set_tag(&self, key: &str, value: TagValue);
}

/// Sets `value` as a tag, keeping scalars as they are and JSON-encoding any
/// other kind of value. Values that cannot be serialized are skipped.
pub fn set_serializable_tag<T: Serialize + ?Sized>(span: &dyn TagSetter, key: &str, value: &T) {
    let value = match serde_json::to_value(value) {
        Ok(value) => value,
        Err(e) => {
            debug!("appsec: failed to serialize the value of span tag {key}, the tag will be skipped: {e}");
            return;
        }
    };

    let tag = match value {
        Value::String(s) => TagValue::String(s),
        Value::Bool(b) => TagValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => TagValue::Int(i),
            None => TagValue::Float(n.as_f64().unwrap_or_default()),
        },
        other => match serde_json::to_string(&other) {
            Ok(json) => TagValue::String(json),
            Err(e) => {
                debug!("appsec: failed to encode span tag {key} as JSON, the tag will be skipped: {e}");
                return;
            }
        },
    };
    span.set_tag(key, tag);
}

/// Sets every entry of `values` as a serializable tag.
pub fn set_serializable_tags<'a>(
    span: &dyn TagSetter,
    values: impl IntoIterator<Item = (&'a String, &'a Value)>,
) {
    for (key, value) in values {
        set_serializable_tag(span, key, value);
    }
}

/// In-memory tag store, usable as the tag setter of a request when the
/// embedding tracer copies the tags onto its span at the end of the request.
#[derive(Debug, Default)]
pub struct SpanTags {
    tags: Mutex<HashMap<String, TagValue>>,
}
impl SpanTags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<TagValue> {
        self.lock().get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns a copy of all tags collected so far.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, TagValue> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TagValue>> {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
impl TagSetter for SpanTags {
    fn set_tag(&self, key: &str, value: TagValue) {
        self.lock().insert(key.to_string(), value);
    }
}
