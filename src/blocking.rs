//! The blocking reference: a single-slot holder representing "a fiber
//! currently suspended, wakeable only through me". It's the one suspension
//! primitive every other wait (I/O, timers, join, the worker pool) is built
//! out of.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::fiber::FiberId;
use crate::scheduler::Handle;

/// The result a blocked fiber observes when it resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockResult {
    Unblocked,
    Cancelled,
}

/// A single-slot suspension point. At most one fiber is ever held by a
/// given reference at a time; the pairing between a reference and the
/// fiber it holds is updated atomically (with respect to other fibers,
/// since only one fiber ever runs at a time) by [`block_current`] and
/// [`unblock`].
///
/// Dropping a reference while it holds a fiber is itself a cancellation
/// point: the held fiber is woken with [`UnblockResult::Cancelled`].
pub struct BlockingReference {
    scheduler: Handle,
    held: Cell<Option<FiberId>>,
    result: Cell<UnblockResult>,
}

impl BlockingReference {
    pub fn new(scheduler: Handle) -> Self {
        Self {
            scheduler,
            held: Cell::new(None),
            // The original's destructor reads "the last stored result"; if
            // nothing was ever stored, it's undefined. This crate pins that
            // down explicitly to `Cancelled` (see SPEC_FULL.md Design Notes).
            result: Cell::new(UnblockResult::Cancelled),
        }
    }

    /// Suspends the currently running fiber on this reference and yields to
    /// the scheduler. Returns the result the eventual unblocker recorded.
    ///
    /// Requires an `Rc` receiver so the scheduler can stash a clone as the
    /// fiber's `blocker` back-pointer (§3's invariant (a): `r.thread == f` iff
    /// `f.blocker == r`), cleared again the moment this reference unblocks it.
    ///
    /// # Panics
    /// In debug builds, panics if this reference already holds a fiber.
    pub fn block_current(self: &Rc<Self>) -> UnblockResult {
        debug_assert!(self.held.get().is_none(), "blocking reference reused while armed");
        let current = self.scheduler.current_fiber();
        self.held.set(Some(current));
        self.scheduler.park_current_on(current, self.clone());
        self.scheduler.yield_to_scheduler();
        self.result.get()
    }

    /// If a fiber is held, clears the link, records `result`, and places the
    /// fiber back on the ready queue. Returns whether a fiber was held.
    pub fn unblock(&self, result: UnblockResult) -> bool {
        self.result.set(result);
        match self.held.take() {
            Some(fiber) => {
                self.scheduler.unpark(fiber);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self) -> bool {
        self.unblock(UnblockResult::Cancelled)
    }

    pub fn is_armed(&self) -> bool {
        self.held.get().is_some()
    }
}

impl Drop for BlockingReference {
    fn drop(&mut self) {
        self.unblock(self.result.get());
    }
}

/// Converts the raw [`UnblockResult`] into the crate's [`Result`] idiom used
/// by every higher-level suspension point (I/O, timers, join, worker pool).
pub fn to_result(result: UnblockResult) -> Result<()> {
    match result {
        UnblockResult::Unblocked => Ok(()),
        UnblockResult::Cancelled => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn unblock_with_nothing_held_returns_false() {
        let scheduler = Scheduler::new().unwrap();
        let reference = BlockingReference::new(scheduler);
        assert!(!reference.is_armed());
        assert!(!reference.unblock(UnblockResult::Unblocked));
    }

    #[test]
    fn to_result_maps_unblocked_and_cancelled() {
        assert!(to_result(UnblockResult::Unblocked).is_ok());
        assert!(matches!(to_result(UnblockResult::Cancelled), Err(Error::Cancelled)));
    }

    #[test]
    fn block_current_returns_the_result_the_unblocker_recorded() {
        // A two-fiber dance: the first parks on a shared reference, the
        // second unblocks it with a specific result and we assert the
        // first fiber observed exactly that result.
        let scheduler = Scheduler::new().unwrap();
        let observed = Rc::new(RefCell::new(None));
        let observed_for_blocker = observed.clone();
        let scheduler_for_blocker = scheduler.clone();
        let reference = Rc::new(BlockingReference::new(scheduler.clone()));
        let reference_for_waker = reference.clone();

        crate::fiber::spawn(&scheduler, move || {
            let result = reference.block_current();
            *observed_for_blocker.borrow_mut() = Some(result);
        });
        crate::fiber::spawn(&scheduler_for_blocker, move || {
            reference_for_waker.unblock(UnblockResult::Cancelled);
        });

        scheduler.run();

        assert_eq!(observed.borrow_mut().take(), Some(UnblockResult::Cancelled));
    }

    #[test]
    fn result_defaults_to_cancelled_until_something_records_otherwise() {
        // A reference that is dropped having never been armed or unblocked
        // still carries `Cancelled` as its `result`, so a bug that drops a
        // still-armed reference fails safe rather than silently reporting
        // success (§9's resolution of the original's unblock-on-drop
        // ambiguity).
        let scheduler = Scheduler::new().unwrap();
        let reference = BlockingReference::new(scheduler);
        assert_eq!(reference.result.get(), UnblockResult::Cancelled);
    }

    #[test]
    fn blocker_back_pointer_matches_holding_reference_while_parked_and_clears_on_unblock() {
        // §8 invariant 1: `r.thread == f` iff `f.blocker == r`. A second
        // fiber inspects the first fiber's `blocker` while it's parked (the
        // parked fiber itself can't observe its own state), then again right
        // after unblocking it.
        let scheduler = Scheduler::new().unwrap();
        let reference = Rc::new(BlockingReference::new(scheduler.clone()));
        let reference_for_parker = reference.clone();
        let scheduler_for_parker = scheduler.clone();
        let parked_id = Rc::new(Cell::new(None));
        let parked_id_for_parker = parked_id.clone();
        let parked_id_for_checker = parked_id.clone();
        let scheduler_for_checker = scheduler.clone();
        let observed_while_parked = Rc::new(Cell::new(false));
        let observed_while_parked_for_checker = observed_while_parked.clone();
        let observed_after_unblock = Rc::new(Cell::new(true));
        let observed_after_unblock_for_checker = observed_after_unblock.clone();

        crate::fiber::spawn(&scheduler, move || {
            parked_id_for_parker.set(Some(scheduler_for_parker.current_fiber()));
            reference_for_parker.block_current();
        });
        crate::fiber::spawn(&scheduler_for_checker, move || {
            let id = parked_id_for_checker.get().expect("parker fiber ran first");
            let held = scheduler_for_checker.fiber_blocker(id);
            observed_while_parked_for_checker.set(matches!(held, Some(r) if Rc::ptr_eq(&r, &reference)));
            reference.unblock(UnblockResult::Unblocked);
            observed_after_unblock_for_checker.set(scheduler_for_checker.fiber_blocker(id).is_some());
        });

        scheduler.run();

        assert!(observed_while_parked.get(), "blocker back-pointer did not match the holding reference while parked");
        assert!(!observed_after_unblock.get(), "blocker back-pointer was not cleared on unblock");
    }
}
