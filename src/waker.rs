//! A [`std::task::Waker`] backed by a [`BlockingReference`], so the handful
//! of `futures`-combinator code this crate uses (`select`, `join`) can drive
//! a fiber the same way every other suspension point does: through
//! `block_current`/`unblock`, not a cross-thread wake mechanism.

use std::rc::Rc;
use std::task::{RawWaker, RawWakerVTable, Waker};

use crate::blocking::{BlockingReference, UnblockResult};

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);

unsafe fn clone(data: *const ()) -> RawWaker {
    let rc = unsafe { Rc::from_raw(data as *const BlockingReference) };
    let cloned = rc.clone();
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake(data: *const ()) {
    let rc = unsafe { Rc::from_raw(data as *const BlockingReference) };
    rc.unblock(UnblockResult::Unblocked);
}

unsafe fn wake_by_ref(data: *const ()) {
    let rc = unsafe { Rc::from_raw(data as *const BlockingReference) };
    rc.unblock(UnblockResult::Unblocked);
    std::mem::forget(rc);
}

unsafe fn drop(data: *const ()) {
    unsafe { Rc::from_raw(data as *const BlockingReference) };
}

/// Builds a `Waker` that, when woken from any clone, unblocks the fiber
/// parked on `waiter`.
///
/// # Safety
/// Not `Send`/`Sync` despite `Waker`'s bounds requiring it: this crate never
/// hands these wakers to another OS thread, only to `futures` combinators
/// running on the same fiber-scheduler thread that owns `waiter`.
pub fn fiber_waker(waiter: Rc<BlockingReference>) -> Waker {
    let raw = RawWaker::new(Rc::into_raw(waiter) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}
