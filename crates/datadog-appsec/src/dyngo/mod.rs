// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed, synchronous, in-process event bus structured as a tree of live
//! operations.
//!
//! Instrumented call sites create an [`Operation`] per scope (an HTTP handler,
//! a SQL query, a GraphQL field resolution...), linked to its parent. Features
//! register listeners on an operation, usually the root one, and events flow
//! from the operation that emits them up to the root:
//!
//! ```text
//! root ─┬─ waf context ── http handler ── sql query
//!       └─ waf context ── grpc handler
//! ```
//!
//! - start events go to the ancestors of the operation being started (an
//!   operation cannot listen to its own start);
//! - finish and data events go to the operation itself, then its ancestors.
//!
//! Events are matched by their exact type: a listener registered with
//! [`on`] for `HandlerOperationArgs` only sees `HandlerOperationArgs` values.
//! Listeners of one node run in registration order, nodes are visited
//! child-first. A panicking listener is logged and skipped.
//!
//! Parents never reference their children, so the tree holds no cycle: each
//! node only keeps its parent alive. The typed wrapper of a node (see
//! [`AsOperation`]) is reachable from the node through a weak reference set
//! by [`bind`], which is what [`find_operation`] relies on.

mod registry;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::debug;

use registry::{call_guarded, DataListener, EventListener, Registry};

/// A node of the operation tree. Cloning it is cheap and yields a handle to
/// the same node.
#[derive(Clone)]
pub struct Operation(Arc<Node>);

struct Node {
    parent: Option<Operation>,
    on_start: Registry<EventListener>,
    on_finish: Registry<EventListener>,
    on_data: Registry<DataListener>,
    started: AtomicBool,
    finishing: AtomicBool,
    finished: AtomicBool,
    bound: OnceLock<Weak<dyn Any + Send + Sync>>,
}

impl Operation {
    /// Creates a new operation below `parent`, or a root when `parent` is
    /// `None`.
    #[must_use]
    pub fn new(parent: Option<&Operation>) -> Self {
        Self(Arc::new(Node {
            parent: parent.cloned(),
            on_start: Registry::default(),
            on_finish: Registry::default(),
            on_data: Registry::default(),
            started: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            bound: OnceLock::new(),
        }))
    }

    /// Creates a new root operation.
    #[must_use]
    pub fn root() -> Self {
        Self::new(None)
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Operation> {
        self.0.parent.as_ref()
    }

    /// Whether the operation was finished. A finished operation no longer
    /// emits nor receives events.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::Acquire)
    }

    /// Total number of listeners registered on this node.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.0.on_start.len() + self.0.on_finish.len() + self.0.on_data.len()
    }

    /// Finishes an operation that has no typed wrapper, such as a root.
    /// Its listeners are released and further events are dropped.
    pub fn disable(&self) {
        if self.0.finishing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminate();
    }

    fn terminate(&self) {
        self.0.finished.store(true, Ordering::Release);
        self.0.on_start.clear();
        self.0.on_finish.clear();
        self.0.on_data.clear();
    }

    /// Iterates over this operation and its ancestors, child-first.
    fn lineage(&self) -> impl Iterator<Item = &Operation> {
        std::iter::successors(Some(self), |op| op.parent())
    }

    /// Same as [`Operation::lineage`], skipping finished nodes.
    fn live_lineage(&self) -> impl Iterator<Item = &Operation> {
        self.lineage().filter(|op| !op.is_finished())
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &Arc::as_ptr(&self.0))
            .field("has_parent", &self.0.parent.is_some())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Operation {}

/// Implemented by the typed operations instrumented call sites create. They
/// wrap an [`Operation`] node.
pub trait AsOperation: Any + Send + Sync {
    fn as_operation(&self) -> &Operation;
}

impl AsOperation for Operation {
    fn as_operation(&self) -> &Operation {
        self
    }
}

/// Start arguments of the typed operation `Self::Operation`.
pub trait ArgOf: Any + Send + Sync {
    type Operation: AsOperation;
}

/// Finish results of the typed operation `Self::Operation`.
pub trait ResultOf: Any + Send + Sync {
    type Operation: AsOperation;
}

/// Registers a listener of the start events of operations whose start
/// arguments are of type `A`.
pub fn on<A, F>(op: &Operation, listener: F)
where
    A: ArgOf,
    F: Fn(&A::Operation, &A) + Send + Sync + 'static,
{
    if op.is_finished() {
        return;
    }
    op.0.on_start.add(TypeId::of::<A>(), typed_listener(listener));
}

/// Registers a listener of the finish events of operations whose finish
/// results are of type `R`.
pub fn on_finish<R, F>(op: &Operation, listener: F)
where
    R: ResultOf,
    F: Fn(&R::Operation, &R) + Send + Sync + 'static,
{
    if op.is_finished() {
        return;
    }
    op.0.on_finish.add(TypeId::of::<R>(), typed_listener(listener));
}

/// Registers a listener of the data events of type `T` emitted by `op` or
/// any of its descendants.
pub fn on_data<T, F>(op: &Operation, listener: F)
where
    T: Any,
    F: Fn(&T) + Send + Sync + 'static,
{
    if op.is_finished() {
        return;
    }
    let listener: DataListener = Arc::new(move |data: &dyn Any| {
        if let Some(data) = data.downcast_ref::<T>() {
            listener(data);
        }
    });
    op.0.on_data.add(TypeId::of::<T>(), listener);
}

fn typed_listener<O, E, F>(listener: F) -> EventListener
where
    O: Any,
    E: Any,
    F: Fn(&O, &E) + Send + Sync + 'static,
{
    Arc::new(move |op: &dyn Any, event: &dyn Any| {
        match (op.downcast_ref::<O>(), event.downcast_ref::<E>()) {
            (Some(op), Some(event)) => listener(op, event),
            _ => debug!("appsec: operation listener invoked with mismatching types"),
        }
    })
}

/// Starts `op`, dispatching `args` to the start listeners of its ancestors.
pub fn start_operation<O, A>(op: &O, args: A)
where
    O: AsOperation,
    A: ArgOf<Operation = O>,
{
    let node = op.as_operation();
    if node.0.started.swap(true, Ordering::AcqRel) {
        debug!("appsec: ignoring a second start of the same operation");
        return;
    }
    let Some(parent) = node.parent() else {
        return;
    };
    dispatch(parent.live_lineage(), |n| &n.0.on_start, op, &args, "start");
}

/// Binds `op` to its node so that [`find_operation`] can find it, then starts
/// it.
pub fn start_and_bind_operation<O, A>(op: &Arc<O>, args: A)
where
    O: AsOperation,
    A: ArgOf<Operation = O>,
{
    bind(op);
    start_operation(op.as_ref(), args);
}

/// Finishes `op`, dispatching `res` to the finish listeners of `op` and its
/// ancestors. The operation is terminal afterwards: its listeners are
/// released and further events emitted through it are dropped. Finishing an
/// operation twice has no effect.
pub fn finish_operation<O, R>(op: &O, res: R)
where
    O: AsOperation,
    R: ResultOf<Operation = O>,
{
    let node = op.as_operation();
    if node.0.finishing.swap(true, Ordering::AcqRel) {
        return;
    }
    dispatch(node.live_lineage(), |n| &n.0.on_finish, op, &res, "finish");
    node.terminate();
}

/// Emits `data` from `op`, dispatching it to the data listeners of `op` and
/// its ancestors. Dropped when `op` is finished.
pub fn emit_data<T: Any>(op: &Operation, data: T) {
    if op.is_finished() {
        return;
    }
    let key = TypeId::of::<T>();
    for node in op.live_lineage() {
        let Some(listeners) = node.0.on_data.snapshot(key) else {
            continue;
        };
        for listener in listeners {
            call_guarded("data", || listener(&data));
        }
    }
}

fn dispatch<'a, O: Any, E: Any>(
    lineage: impl Iterator<Item = &'a Operation>,
    registry: impl Fn(&'a Operation) -> &'a Registry<EventListener>,
    op: &O,
    event: &E,
    kind: &'static str,
) {
    let key = TypeId::of::<E>();
    for node in lineage {
        let Some(listeners) = registry(node).snapshot(key) else {
            continue;
        };
        for listener in listeners {
            call_guarded(kind, || listener(op, event));
        }
    }
}

/// Makes the typed operation `op` discoverable through [`find_operation`]
/// from its node and descendants. Binding is done once per node.
pub fn bind<O: AsOperation>(op: &Arc<O>) {
    let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(op) as Weak<dyn Any + Send + Sync>;
    if op.as_operation().0.bound.set(weak).is_err() {
        debug!("appsec: operation is already bound to a typed operation");
    }
}

/// Searches `op` and its ancestors for the closest typed operation of type
/// `T` bound with [`bind`].
#[must_use]
pub fn find_operation<T: AsOperation>(op: &Operation) -> Option<Arc<T>> {
    op.lineage().find_map(|node| {
        let bound = node.0.bound.get()?.upgrade()?;
        bound.downcast::<T>().ok()
    })
}
