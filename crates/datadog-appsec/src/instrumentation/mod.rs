// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed operations started by instrumented call sites.
//!
//! Each module exposes the operations of one kind of call site along with
//! their start arguments and finish results. Features listen to those types
//! on the root operation. Call sites only have to propagate the
//! [`BlockingSecurityEvent`] they may be handed back.

pub mod graphqlsec;
pub mod grpcsec;
pub mod httpsec;
pub mod sqlsec;
pub mod usersec;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::dyngo::{find_operation, on_data, Operation};
use crate::trace::TagSetter;
use crate::waf::actions::BlockingSecurityEvent;
use crate::waf::context::{start_context_operation, ContextOperation};

/// Header-like multi-valued map, keyed by lower-case names.
pub type Multimap = HashMap<String, Vec<String>>;

/// Records the first [`BlockingSecurityEvent`] emitted by an operation or
/// its descendants.
#[derive(Debug, Default)]
pub struct BlockingSlot(Mutex<Option<BlockingSecurityEvent>>);

impl BlockingSlot {
    /// Listens to the blocking events of `op`.
    #[must_use]
    pub fn listen(op: &Operation) -> Arc<Self> {
        let slot = Arc::new(Self::default());
        let sink = Arc::clone(&slot);
        on_data::<BlockingSecurityEvent, _>(op, move |event| {
            sink.lock().get_or_insert_with(|| event.clone());
        });
        slot
    }

    #[must_use]
    pub fn get(&self) -> Option<BlockingSecurityEvent> {
        self.lock().clone()
    }

    /// `Err` once a blocking event was recorded.
    pub fn check(&self) -> Result<(), BlockingSecurityEvent> {
        self.get().map_or(Ok(()), Err)
    }

    fn lock(&self) -> MutexGuard<'_, Option<BlockingSecurityEvent>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The WAF context enclosing `parent`, or a new one owned by the caller when
/// there is none. The boolean tells whether the context was created.
pub(crate) fn context_for(
    parent: &Operation,
    tags: Arc<dyn TagSetter>,
) -> (Arc<ContextOperation>, bool) {
    match find_operation::<ContextOperation>(parent) {
        Some(context) => (context, false),
        None => (start_context_operation(parent, tags), true),
    }
}

/// Lower-cases header names, merging the values of names that only differ in
/// case.
#[must_use]
pub fn normalize_headers(headers: &Multimap) -> Multimap {
    let mut normalized = Multimap::with_capacity(headers.len());
    for (name, values) in headers {
        normalized
            .entry(name.to_ascii_lowercase())
            .or_default()
            .extend(values.iter().cloned());
    }
    normalized
}

/// Lower-cased headers without the cookies.
#[must_use]
pub fn headers_no_cookies(headers: &Multimap) -> Multimap {
    let mut headers = normalize_headers(headers);
    headers.remove("cookie");
    headers
}
