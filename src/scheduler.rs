//! The scheduler: a fiber arena, a ready queue, and the event loop that
//! drains it between polling rounds.
//!
//! A `Scheduler` is a cheap `Rc` clone (see SPEC_FULL.md Design Notes for why
//! this crate uses one scheduler per OS thread rather than a process-wide
//! singleton): every fiber-affine API takes a `Scheduler`/`Handle` rather
//! than reaching for a thread-local "current scheduler" pointer, so the
//! ownership story stays visible at every call site.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::blocking::{BlockingReference, UnblockResult};
use crate::config::Config;
use crate::context::{self, Context};
use crate::error::Result;
use crate::fiber::{FiberId, FiberRecord, RunState};
use crate::poller::{DispatchGuard, EventMultiplexer, Interest, PollingMultiplexer};
use crate::stack::StackPool;
use crate::timer::{TimerHandle, TimerWheel};
use crate::worker::WorkerPool;

/// What the event loop does once a registered fd reports readiness.
pub(crate) struct IoWaiters {
    pub read: Option<Rc<BlockingReference>>,
    pub write: Option<Rc<BlockingReference>>,
}

struct Inner {
    stack_pools: RefCell<HashMap<usize, StackPool>>,
    default_stack_size: usize,
    arena: RefCell<Vec<Option<FiberRecord>>>,
    free_slots: RefCell<Vec<usize>>,
    ready_queue: RefCell<VecDeque<FiberId>>,
    current: Cell<Option<FiberId>>,
    scheduler_context: RefCell<Context>,
    poller: Box<dyn EventMultiplexer>,
    dispatch_guard: DispatchGuard,
    timers: TimerWheel,
    workers: WorkerPool,
    io_waiters: RefCell<HashMap<RawFd, IoWaiters>>,
    /// Mask most recently passed to `add`/`modify` for each fd, so
    /// `reconcile_descriptors` only touches the poller when something
    /// actually changed (§8 invariant 5).
    registered: RefCell<HashMap<RawFd, Interest>>,
}

/// A handle to a single-OS-thread fiber scheduler. Cloning is an `Rc` bump,
/// not a deep copy: all clones refer to the same arena, ready queue and
/// event loop.
#[derive(Clone)]
pub struct Scheduler(Rc<Inner>);

/// Alias used throughout the crate at call sites that only need to talk to
/// a scheduler, not construct or run one.
pub type Handle = Scheduler;

impl Scheduler {
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(mut config: Config) -> Result<Self> {
        let poller = config
            .multiplexer
            .take()
            .map(Ok)
            .unwrap_or_else(|| PollingMultiplexer::new().map(|p| Box::new(p) as Box<dyn EventMultiplexer>))?;
        let workers = WorkerPool::new(config.worker_pool_size)?;
        poller.add(workers.reply_fd(), Interest::READABLE)?;
        let mut pools = HashMap::new();
        pools.insert(config.stack_size, StackPool::new(config.stack_size, config.stacks_per_pool));
        Ok(Self(Rc::new(Inner {
            stack_pools: RefCell::new(pools),
            default_stack_size: config.stack_size,
            arena: RefCell::new(Vec::new()),
            free_slots: RefCell::new(Vec::new()),
            ready_queue: RefCell::new(VecDeque::new()),
            current: Cell::new(None),
            scheduler_context: RefCell::new(Context::default()),
            poller,
            dispatch_guard: DispatchGuard::default(),
            timers: TimerWheel::new(),
            workers,
            io_waiters: RefCell::new(HashMap::new()),
            registered: RefCell::new(HashMap::new()),
        })))
    }

    fn as_raw(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }

    /// Reconstructs a `Scheduler` handle from a raw `Inner` pointer obtained
    /// via [`as_raw`], bumping the strong count to account for the new
    /// owning handle.
    ///
    /// # Safety
    /// `ptr` must have come from `as_raw` on a `Scheduler` that is still
    /// alive (true for the lifetime of every fiber, since a scheduler is
    /// never dropped while it has fibers outstanding).
    unsafe fn from_raw(ptr: *const ()) -> Self {
        let ptr = ptr as *const Inner;
        unsafe { Rc::increment_strong_count(ptr) };
        Self(unsafe { Rc::from_raw(ptr) })
    }

    // ---- fiber arena -----------------------------------------------------

    fn alloc_slot(&self, record: FiberRecord) -> FiberId {
        if let Some(index) = self.0.free_slots.borrow_mut().pop() {
            self.0.arena.borrow_mut()[index] = Some(record);
            FiberId(index)
        } else {
            let mut arena = self.0.arena.borrow_mut();
            arena.push(Some(record));
            FiberId(arena.len() - 1)
        }
    }

    fn with_record<R>(&self, id: FiberId, f: impl FnOnce(&mut FiberRecord) -> R) -> R {
        let mut arena = self.0.arena.borrow_mut();
        let record = arena[id.0].as_mut().expect("fiber id used after being reaped");
        f(record)
    }

    fn stack_pool_for(&self, requested: Option<usize>) -> std::cell::RefMut<'_, StackPool> {
        let size = requested.unwrap_or(self.0.default_stack_size);
        let mut pools = self.0.stack_pools.borrow_mut();
        pools
            .entry(size)
            .or_insert_with(|| StackPool::new(size, 32));
        std::cell::RefMut::map(pools, |p| p.get_mut(&size).unwrap())
    }

    /// Constructs a new fiber and bootstraps its context, but does not run
    /// it: the caller is responsible for placing it on the ready queue (the
    /// one exception being [`crate::fiber::Builder`], which always does).
    pub fn spawn_fiber(
        &self,
        name: String,
        stack_size: Option<usize>,
        joinable: bool,
        joiner: Option<Rc<BlockingReference>>,
        body: Box<dyn FnOnce()>,
    ) -> FiberId {
        let stack_top = {
            let mut pool = self.stack_pool_for(stack_size);
            pool.acquire_stack().expect("stack pool exhausted")
        };
        let id = self.alloc_slot(FiberRecord {
            context: Context::default(),
            stack_top,
            name,
            joinable,
            state: RunState::Ready,
            in_ready_queue: true,
            joiner,
            blocker: None,
            body: Some(body),
        });
        self.bootstrap(id, stack_top);
        self.0.ready_queue.borrow_mut().push_back(id);
        id
    }

    /// One-time bootstrap (§4.3): switch to the new stack, run the
    /// trampoline just long enough for it to capture its own resume point,
    /// then switch straight back here. After this returns, `id`'s context
    /// is ready to be `restore_context`ed into like any other fiber.
    fn bootstrap(&self, id: FiberId, stack_top: std::ptr::NonNull<u8>) {
        let mut return_ctx = Context::default();
        BOOTSTRAP_RETURN_CTX.with(|cell| cell.set(&mut return_ctx as *mut Context));
        if context::save_context(&mut return_ctx) == 0 {
            // `stack_top` is page- (so 16-byte-) aligned; `switch_stack_and_call`
            // itself reserves the word the link address is pushed into via its
            // own `sub rsp, 8`, landing `rsp` at SysV's required `8 mod 16` on
            // entry to `fiber_trampoline`. Passing `stack_top - 8` here would
            // double that reservation and misalign every fiber's entry.
            // SAFETY: `stack_top` was just acquired from this scheduler's
            // pool and is used by no one else yet.
            unsafe {
                context::switch_stack_and_call(stack_top.as_ptr() as usize, self.as_raw() as usize, id.0, fiber_trampoline);
            }
        }
    }

    pub fn current_fiber(&self) -> FiberId {
        self.0.current.get().expect("no fiber is currently running on this scheduler")
    }

    pub fn fiber_name(&self, id: FiberId) -> String {
        self.with_record(id, |r| r.name.clone())
    }

    /// The blocking reference currently holding `id`, if any. Exposed for
    /// the §8 invariant-1 test (`r.thread == f ⟺ f.blocker == r`); no
    /// production code path needs to read this back.
    #[cfg(test)]
    pub(crate) fn fiber_blocker(&self, id: FiberId) -> Option<Rc<BlockingReference>> {
        self.with_record(id, |r| r.blocker.clone())
    }

    pub fn fiber_finished(&self, id: FiberId) -> bool {
        let arena = self.0.arena.borrow();
        match arena[id.0].as_ref() {
            Some(r) => r.state == RunState::Finished,
            None => true,
        }
    }

    pub fn take_fiber_body(&self, id: FiberId) -> Option<Box<dyn FnOnce()>> {
        self.with_record(id, |r| r.body.take())
    }

    /// Parks `id` on `reference` without enqueuing it anywhere: it becomes
    /// runnable again only via `reference.unblock`. Stashes `reference` as
    /// `id`'s `blocker` back-pointer, paired with `reference`'s own `held`
    /// slot (§3 invariant (a)); `unpark` is the only place that clears it.
    pub fn park_current_on(&self, id: FiberId, reference: Rc<BlockingReference>) {
        self.with_record(id, |r| {
            r.state = RunState::Blocked;
            r.in_ready_queue = false;
            r.blocker = Some(reference);
        });
    }

    /// Moves `id` back onto the ready queue, clearing its `blocker`
    /// back-pointer. No-op if it's already there or already finished.
    pub fn unpark(&self, id: FiberId) {
        let should_enqueue = {
            let mut arena = self.0.arena.borrow_mut();
            match arena[id.0].as_mut() {
                Some(r) if r.state != RunState::Finished && !r.in_ready_queue => {
                    r.state = RunState::Ready;
                    r.in_ready_queue = true;
                    r.blocker = None;
                    true
                }
                _ => false,
            }
        };
        if should_enqueue {
            self.0.ready_queue.borrow_mut().push_back(id);
        }
    }

    /// Suspends the running fiber and hands control back to the scheduler's
    /// own stack. Returns once some later `unpark` places this fiber back
    /// on the ready queue and the event loop dispatches it again.
    pub fn yield_to_scheduler(&self) {
        let id = self.current_fiber();
        let ctx_ptr: *mut Context = self.with_record(id, |r| &mut r.context as *mut Context);
        // SAFETY: only the fiber that owns `id` ever touches its own
        // context cell, and it does so only while it is the one running.
        let retval = unsafe { context::save_context(&mut *ctx_ptr) };
        if retval == 0 {
            let sched_ctx_ptr = self.0.scheduler_context.as_ptr();
            unsafe { context::restore_context(&*sched_ctx_ptr, 1) };
        }
    }

    /// Marks the current fiber finished, releases its stack, wakes its
    /// joiner if any, and jumps back to the scheduler without ever
    /// returning to the caller (there is no caller left to return to: the
    /// fiber's stack is being given back to the pool).
    fn finish_current(&self) -> ! {
        let id = self.current_fiber();
        let (stack_top, joiner, joinable) = self.with_record(id, |r| {
            r.state = RunState::Finished;
            r.in_ready_queue = false;
            (r.stack_top, r.joiner.take(), r.joinable)
        });
        if let Some(joiner) = joiner {
            joiner.unblock(UnblockResult::Unblocked);
        }
        // SAFETY: this stack is never touched again once the fiber is
        // marked finished; the jump below does not use it.
        unsafe {
            self.stack_pool_for(None).release_stack(stack_top);
        }
        if !joinable {
            self.reap(id);
        }
        self.0.current.set(None);
        let sched_ctx_ptr = self.0.scheduler_context.as_ptr();
        unsafe { context::restore_context(&*sched_ctx_ptr, 1) };
    }

    /// Frees a finished fiber's arena slot. Safe to call only after the
    /// fiber's result (if any) has been retrieved.
    pub fn reap(&self, id: FiberId) {
        let mut arena = self.0.arena.borrow_mut();
        arena[id.0] = None;
        self.0.free_slots.borrow_mut().push(id.0);
    }

    // ---- timers ------------------------------------------------------

    pub fn arm_timer(&self, deadline_millis: u64, waiter: Rc<BlockingReference>) -> TimerHandle {
        self.0.timers.arm(deadline_millis, waiter)
    }

    pub fn cancel_timer(&self, handle: &TimerHandle) {
        handle.cancel(&self.0.timers);
    }

    pub fn sleep(&self, timeout: Duration) {
        crate::timer::sleep(self, timeout);
    }

    // ---- worker pool ---------------------------------------------------

    pub fn workers(&self) -> &WorkerPool {
        &self.0.workers
    }

    // ---- I/O readiness --------------------------------------------------

    pub(crate) fn poller(&self) -> &dyn EventMultiplexer {
        self.0.poller.as_ref()
    }

    pub(crate) fn dispatch_guard(&self) -> &DispatchGuard {
        &self.0.dispatch_guard
    }

    /// Arms the calling fiber's interest in `fd` becoming ready for
    /// `interest`. Per §4.8, "wanting to be woken when readable" is encoded
    /// solely by a waiter being present here; the actual `add`/`modify` call
    /// to the poller happens later, in [`Self::reconcile_descriptors`].
    pub(crate) fn arm_io_waiter(&self, fd: RawFd, interest: Interest, waiter: Rc<BlockingReference>) {
        let mut waiters = self.0.io_waiters.borrow_mut();
        let entry = waiters.entry(fd).or_insert(IoWaiters { read: None, write: None });
        if interest.contains(Interest::READABLE) {
            entry.read = Some(waiter.clone());
        }
        if interest.contains(Interest::WRITABLE) {
            entry.write = Some(waiter);
        }
    }

    /// Disarms a previously armed direction. Removes the fd's entry
    /// entirely once neither direction is armed, so
    /// [`Self::reconcile_descriptors`] knows to drop its registration.
    pub(crate) fn disarm_io_waiter(&self, fd: RawFd, interest: Interest) {
        let mut waiters = self.0.io_waiters.borrow_mut();
        let Some(entry) = waiters.get_mut(&fd) else { return };
        if interest.contains(Interest::READABLE) {
            entry.read = None;
        }
        if interest.contains(Interest::WRITABLE) {
            entry.write = None;
        }
        if entry.read.is_none() && entry.write.is_none() {
            waiters.remove(&fd);
        }
    }

    /// Unblocks any waiters parked on `fd` with `result`, without touching
    /// its poller registration (used by `close`/`shutdown`, §4.8).
    pub(crate) fn wake_io_waiters(&self, fd: RawFd, readable: bool, writable: bool, result: UnblockResult) {
        let (read, write) = {
            let waiters = self.0.io_waiters.borrow();
            match waiters.get(&fd) {
                Some(w) => (w.read.clone(), w.write.clone()),
                None => return,
            }
        };
        if readable {
            if let Some(w) = read {
                w.unblock(result);
            }
        }
        if writable {
            if let Some(w) = write {
                w.unblock(result);
            }
        }
    }

    /// Removes `fd` from the poller and closes it, or, if called from
    /// inside event dispatch, defers both until the current batch
    /// finishes (the deferred-destruction guarantee). Any fiber still
    /// parked on `fd` is woken with `Cancelled` first: a closed descriptor
    /// must not strand its waiter.
    pub(crate) fn close_fd(&self, fd: RawFd) {
        if let Some(waiters) = self.0.io_waiters.borrow_mut().remove(&fd) {
            if let Some(w) = waiters.read {
                w.unblock(UnblockResult::Cancelled);
            }
            if let Some(w) = waiters.write {
                w.unblock(UnblockResult::Cancelled);
            }
        }
        if self.0.dispatch_guard.destroy_or_defer(fd) {
            self.0.registered.borrow_mut().remove(&fd);
            let _ = self.0.poller.remove(fd);
            unsafe { libc::close(fd) };
        }
    }

    fn dispatch_io_ready(&self, fd: RawFd, interest: Interest) {
        self.wake_io_waiters(fd, interest.contains(Interest::READABLE), interest.contains(Interest::WRITABLE), UnblockResult::Unblocked);
    }

    /// Walks every fd with a live waiter and brings the poller's
    /// registration in line with what's currently wanted, adding, modifying
    /// or removing as needed (§4.5's "reconcile immediately before
    /// blocking").
    fn reconcile_descriptors(&self) {
        let mut registered = self.0.registered.borrow_mut();
        let waiters = self.0.io_waiters.borrow();

        let stale: Vec<RawFd> = registered.keys().filter(|fd| !waiters.contains_key(fd)).copied().collect();
        for fd in stale {
            let _ = self.0.poller.remove(fd);
            registered.remove(&fd);
        }

        for (&fd, w) in waiters.iter() {
            let mut desired = Interest::NONE;
            if w.read.is_some() {
                desired.insert(Interest::READABLE);
            }
            if w.write.is_some() {
                desired.insert(Interest::WRITABLE);
            }
            match registered.get(&fd).copied() {
                None => {
                    if self.0.poller.add(fd, desired).is_ok() {
                        registered.insert(fd, desired);
                    }
                }
                Some(current) if current != desired => {
                    if self.0.poller.modify(fd, desired).is_ok() {
                        registered.insert(fd, desired);
                    }
                }
                _ => {}
            }
        }
    }

    // ---- the event loop --------------------------------------------------

    fn should_exit(&self) -> bool {
        self.0.ready_queue.borrow().is_empty()
            && self.0.io_waiters.borrow().is_empty()
            && self.0.timers.is_empty()
            && !self.0.workers.has_outstanding_work()
    }

    /// Runs the scheduler until there is nothing left that could ever make
    /// it runnable again: an empty ready queue, no registered I/O interest,
    /// no outstanding timers, and no fiber parked on a worker-pool job
    /// (§4.5). The reply fd is always registered with the poller, so a
    /// pending job's completion is still delivered through the normal
    /// dispatch path; `should_exit` just has to know not to stop short of
    /// that delivery.
    pub fn run(&self) {
        loop {
            while let Some(id) = self.0.ready_queue.borrow_mut().pop_front() {
                self.with_record(id, |r| {
                    r.in_ready_queue = false;
                    r.state = RunState::Running;
                });
                self.0.current.set(Some(id));
                let ctx_ptr = self.0.scheduler_context.as_ptr();
                // SAFETY: nothing else touches `scheduler_context` while a
                // fiber is running, since only one fiber runs at a time.
                let retval = unsafe { context::save_context(&mut *ctx_ptr) };
                if retval == 0 {
                    let fiber_ctx_ptr: *const Context = self.with_record(id, |r| &r.context as *const Context);
                    unsafe { context::restore_context(&*fiber_ctx_ptr, 1) };
                }
                self.0.current.set(None);
            }

            if self.should_exit() {
                break;
            }

            self.reconcile_descriptors();
            let timeout = self.0.timers.next_timeout();
            let ready = self.0.poller.wait(timeout).unwrap_or_default();
            self.0.dispatch_guard.begin();
            for (fd, interest) in ready {
                // A handler earlier in this same batch may have destroyed
                // `fd`; its event must not be delivered (§4.6, §8 scenario 6).
                if self.0.dispatch_guard.is_pending_delete(fd) {
                    continue;
                }
                if fd == self.0.workers.reply_fd() {
                    self.0.workers.dispatch_completions();
                    continue;
                }
                self.dispatch_io_ready(fd, interest);
            }
            let deferred = self.0.dispatch_guard.end();
            for fd in deferred {
                self.0.registered.borrow_mut().remove(&fd);
                let _ = self.0.poller.remove(fd);
                unsafe { libc::close(fd) };
            }
            self.0.timers.fire_expired();
        }
    }

    /// Drives `future` to completion on this scheduler, parking the calling
    /// fiber between polls instead of busy-looping (the ambient bridge to
    /// the `futures` combinators used for fan-in/fan-out over several
    /// suspension points at once).
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        futures::pin_mut!(future);
        let waiter = Rc::new(BlockingReference::new(self.clone()));
        let waker = crate::waker::fiber_waker(waiter.clone());
        let mut cx = std::task::Context::from_waker(&waker);
        loop {
            match future.as_mut().poll(&mut cx) {
                std::task::Poll::Ready(v) => return v,
                std::task::Poll::Pending => {
                    waiter.block_current();
                }
            }
        }
    }
}

thread_local! {
    static BOOTSTRAP_RETURN_CTX: Cell<*mut Context> = Cell::new(std::ptr::null_mut());
}

extern "C" fn fiber_trampoline(scheduler_ptr: usize, id_raw: usize) -> ! {
    let mut my_ctx = Context::default();
    if context::save_context(&mut my_ctx) == 0 {
        let inner_ptr = scheduler_ptr as *const ();
        // SAFETY: the scheduler handle that spawned us is kept alive by its
        // caller for at least as long as `bootstrap` is on the stack below
        // us, which is exactly when this branch runs.
        let scheduler = unsafe { Scheduler::from_raw(inner_ptr) };
        scheduler.with_record(FiberId(id_raw), |r| r.context = my_ctx);
        let return_ctx_ptr = BOOTSTRAP_RETURN_CTX.with(|c| c.get());
        std::mem::forget(scheduler);
        let return_ctx = unsafe { &*return_ctx_ptr };
        unsafe { context::restore_context(return_ctx, 1) };
    }
    // Resumed for real: this is the first time the fiber's body runs.
    let inner_ptr = scheduler_ptr as *const ();
    // SAFETY: see above; the scheduler outlives every fiber spawned on it.
    let scheduler = unsafe { Scheduler::from_raw(inner_ptr) };
    let id = FiberId(id_raw);
    scheduler.0.current.set(Some(id));
    crate::fiber::run_body(&scheduler, id);
    scheduler.finish_current();
}
