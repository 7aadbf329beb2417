// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-operation listener tables, keyed by the type of the event they listen to.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use fnv::FnvBuildHasher;
use tracing::debug;

/// Listener of start and finish events: receives the operation and the event.
pub(super) type EventListener = Arc<dyn Fn(&dyn Any, &dyn Any) + Send + Sync>;

/// Listener of data events.
pub(super) type DataListener = Arc<dyn Fn(&dyn Any) + Send + Sync>;

pub(super) struct Registry<L> {
    listeners: RwLock<HashMap<TypeId, Vec<L>, FnvBuildHasher>>,
}

impl<L> Default for Registry<L> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::default()),
        }
    }
}

impl<L: Clone> Registry<L> {
    pub(super) fn add(&self, key: TypeId, listener: L) {
        self.write().entry(key).or_default().push(listener);
    }

    /// Copies the listeners registered for `key`. Dispatching from a copy lets
    /// listeners register further listeners without deadlocking, and keeps
    /// them out of the in-flight dispatch.
    pub(super) fn snapshot(&self, key: TypeId) -> Option<Vec<L>> {
        self.read().get(&key).filter(|l| !l.is_empty()).cloned()
    }

    pub(super) fn clear(&self) {
        self.write().clear();
    }

    pub(super) fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TypeId, Vec<L>, FnvBuildHasher>> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TypeId, Vec<L>, FnvBuildHasher>> {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs `f`, containing any panic it raises so the remaining listeners still
/// get to run.
pub(super) fn call_guarded(event: &'static str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        debug!(
            "appsec: recovered from a panic in a {event} listener: {}",
            panic_message(panic.as_ref())
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic payload"
    }
}
