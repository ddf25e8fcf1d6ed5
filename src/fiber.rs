//! The fiber primitive: stack allocation, context save/restore, lifecycle
//! (detached vs. joinable) and the ready queue all meet here.
//!
//! Fibers live in a scheduler-owned arena rather than as individually
//! `Box`ed, intrusively-linked nodes: a back-reference is a plain
//! [`FiberId`] index rather than a raw pointer, which sidesteps the
//! circular-doubly-linked-list-of-raw-pointers shape of the original
//! implementation (see SPEC_FULL.md Design Notes).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::blocking::{to_result, BlockingReference};
use crate::context::Context;
use crate::error::Result;
use crate::scheduler::Scheduler;

/// Index into a scheduler's fiber arena. Never reused while the fiber it
/// names is alive; arena slots are recycled only after a fiber is fully
/// finalized and, if detached, reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Ready,
    Blocked,
    Running,
    Finished,
}

pub(crate) struct FiberRecord {
    pub context: Context,
    pub stack_top: std::ptr::NonNull<u8>,
    pub name: String,
    pub joinable: bool,
    pub state: RunState,
    pub in_ready_queue: bool,
    /// Unblocked when this fiber finishes, if it's joinable.
    pub joiner: Option<Rc<BlockingReference>>,
    /// The blocking reference currently holding this fiber, if any. Set by
    /// `Scheduler::park_current_on` and cleared by `Scheduler::unpark`, in
    /// lockstep with the reference's own `held` slot (§3 invariant (a)); the
    /// actual wakeup path goes through the `BlockingReference` itself, this
    /// is purely the back-pointer half of the pairing.
    pub blocker: Option<Rc<BlockingReference>>,
    pub body: Option<Box<dyn FnOnce()>>,
}

/// A handle to a joinable fiber's eventual result.
pub struct JoinHandle<T> {
    id: FiberId,
    scheduler: Scheduler,
    slot: Rc<RefCell<Option<T>>>,
    joiner: Rc<BlockingReference>,
}

impl<T> JoinHandle<T> {
    /// Blocks the calling fiber until the target finishes (or is destroyed
    /// mid-join), per §4.3's join semantics.
    pub fn join(self) -> Result<T> {
        if !self.scheduler.fiber_finished(self.id) {
            let result = self.joiner.block_current();
            to_result(result)?;
        }
        // Falls through to `Drop`, which reaps the now-finished arena slot.
        self.slot
            .borrow_mut()
            .take()
            .ok_or(crate::error::Error::Cancelled)
    }
}

impl<T> Drop for JoinHandle<T> {
    /// A `JoinHandle` dropped without ever being joined still owns the
    /// target's arena slot once it finishes; nothing else will ever reap it.
    fn drop(&mut self) {
        if self.scheduler.fiber_finished(self.id) {
            self.scheduler.reap(self.id);
        }
    }
}

/// Spawns fibers with an optional name and stack size, wrapping the raw
/// construction sequence in familiar `Builder` ergonomics.
pub struct Builder {
    scheduler: Scheduler,
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            name: None,
            stack_size: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Spawns a joinable fiber. The closure runs the next time the
    /// scheduler drains the ready queue, not immediately.
    pub fn spawn<F, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let slot: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let joiner = Rc::new(BlockingReference::new(self.scheduler.clone()));
        let slot_for_body = slot.clone();
        let body = move || {
            let result = f();
            *slot_for_body.borrow_mut() = Some(result);
        };
        let id = self.scheduler.spawn_fiber(
            self.name.unwrap_or_default(),
            self.stack_size,
            true,
            Some(joiner.clone()),
            Box::new(body),
        );
        JoinHandle {
            id,
            scheduler: self.scheduler,
            slot,
            joiner,
        }
    }

    /// Spawns a detached fiber. Its storage is reclaimed as soon as the
    /// closure returns; there is no way to observe its result.
    pub fn spawn_detached<F>(self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.scheduler
            .spawn_fiber(self.name.unwrap_or_default(), self.stack_size, false, None, Box::new(f));
    }
}

/// Spawns a detached fiber on `scheduler` running `f`. Shorthand for
/// `Builder::new(scheduler).spawn_detached(f)`.
pub fn spawn<F>(scheduler: &Scheduler, f: F)
where
    F: FnOnce() + 'static,
{
    Builder::new(scheduler).spawn_detached(f)
}

thread_local! {
    static CURRENT_TAG: RefCell<Option<String>> = RefCell::new(None);
}

/// The name of the fiber currently running on this OS thread's scheduler,
/// used to tag log lines (§6a).
pub fn current_tag() -> Option<String> {
    CURRENT_TAG.with(|t| t.borrow().clone())
}

pub(crate) fn set_current_tag(tag: Option<String>) {
    CURRENT_TAG.with(|t| *t.borrow_mut() = tag);
}

/// Entry point the bootstrap trampoline resumes into. Exposed to
/// `scheduler` so the context-switch machinery can live next to the arena
/// it operates on without a public API surface for it.
pub(crate) fn run_body(scheduler: &Scheduler, id: FiberId) {
    let body = scheduler.take_fiber_body(id);
    set_current_tag(Some(scheduler.fiber_name(id)));
    if let Some(body) = body {
        body();
    }
}

