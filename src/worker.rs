//! Blocking-I/O worker pool.
//!
//! A fixed set of OS threads perform operations that have no non-blocking
//! form (`opendir`, DNS lookups, anything the kernel only offers as a
//! synchronous call). Rendezvous between a fiber and its worker goes through
//! a pair of pipes rather than a mutex/condvar: the request pipe wakes the
//! worker thread, and the reply pipe is the one thing a cooperative,
//! single-threaded scheduler can actually wait on alongside every other
//! readiness source, through the same poller that watches sockets.
//!
//! Grounded on the `OpenDir`/`ReadDir`/`CloseDir` worked example in
//! `Dirent.h`: each directory call there is a small `Operation` performed on
//! a worker thread and its result read back by the calling fiber.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::blocking::{BlockingReference, UnblockResult};
use crate::error::{Error, Result};
use crate::scheduler::Handle;

/// Something a worker thread can run to completion while blocked. Results
/// are communicated back through whatever the closure itself captures
/// (typically an `Arc<Mutex<Option<T>>>` shared with the submitting fiber).
pub trait Operation: Send + 'static {
    fn perform(self: Box<Self>);
}

impl<F: FnOnce() + Send + 'static> Operation for F {
    fn perform(self: Box<Self>) {
        (*self)()
    }
}

struct Worker {
    request_tx: mpsc::Sender<(u64, Box<dyn Operation>)>,
    _thread: JoinHandle<()>,
}

/// The fixed-size pool of blocking-I/O worker threads belonging to one
/// scheduler. Workers are acquired and released as a unit with submission:
/// there is no separate "acquire a worker" API, so a fiber can never hold a
/// worker without having given it something to do.
pub struct WorkerPool {
    workers: Vec<Worker>,
    free: std::cell::RefCell<VecDeque<usize>>,
    waiters: std::cell::RefCell<VecDeque<Rc<BlockingReference>>>,
    pending: std::cell::RefCell<HashMap<u64, Rc<BlockingReference>>>,
    next_job_id: std::cell::Cell<u64>,
    reply_rx: RawFd,
    reply_tx_owned: RawFd,
}

/// The read end is registered with the scheduler's poller and must be
/// non-blocking; the write end is duplicated into every worker thread and
/// must stay blocking; `worker_loop`'s write loop doesn't retry on `EAGAIN`.
fn make_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL) };
    unsafe { libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) };
    Ok((fds[0], fds[1]))
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        let (reply_rx, reply_tx) = make_pipe()?;
        let mut workers = Vec::with_capacity(size);
        for index in 0..size.max(1) {
            let (request_tx, request_rx) = mpsc::channel::<(u64, Box<dyn Operation>)>();
            let reply_tx_dup = unsafe { libc::dup(reply_tx) };
            if reply_tx_dup < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            let thread = std::thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker_loop(request_rx, reply_tx_dup))
                .map_err(Error::Io)?;
            workers.push(Worker { request_tx, _thread: thread });
        }
        Ok(Self {
            free: std::cell::RefCell::new((0..workers.len()).collect()),
            workers,
            waiters: std::cell::RefCell::new(VecDeque::new()),
            pending: std::cell::RefCell::new(HashMap::new()),
            next_job_id: std::cell::Cell::new(0),
            reply_rx,
            reply_tx_owned: reply_tx,
        })
    }

    pub fn reply_fd(&self) -> RawFd {
        self.reply_rx
    }

    /// Whether any fiber is currently waiting on a worker (either holding
    /// one or queued behind a busy pool). The scheduler's exit condition
    /// must treat this the same as a registered I/O waiter or a pending
    /// timer: a fiber parked here is reachable only through a future
    /// `dispatch_completions` call, never through the ready queue directly.
    pub fn has_outstanding_work(&self) -> bool {
        !self.pending.borrow().is_empty() || !self.waiters.borrow().is_empty()
    }

    /// Submits `op` to the next free worker, or queues the calling fiber
    /// behind whoever's already waiting if every worker is busy. Blocks the
    /// calling fiber until the operation completes or is cancelled.
    pub fn execute(&self, scheduler: &Handle, op: impl Operation) -> Result<()> {
        let waiter = Rc::new(BlockingReference::new(scheduler.clone()));
        loop {
            if let Some(worker_index) = self.free.borrow_mut().pop_front() {
                let job_id = self.next_job_id.get();
                self.next_job_id.set(job_id + 1);
                self.pending.borrow_mut().insert(job_id, waiter.clone());
                self.workers[worker_index]
                    .request_tx
                    .send((job_id, Box::new(op)))
                    .map_err(|_| Error::WorkerProtocolViolation)?;
                let result = waiter.block_current();
                self.free.borrow_mut().push_back(worker_index);
                self.wake_next_waiter();
                return crate::blocking::to_result(result);
            }
            self.waiters.borrow_mut().push_back(waiter.clone());
            let result = waiter.block_current();
            if result == UnblockResult::Cancelled {
                self.waiters.borrow_mut().retain(|w| !Rc::ptr_eq(w, &waiter));
                return Err(Error::Cancelled);
            }
            // Woken because a worker freed up; loop around to claim it.
        }
    }

    fn wake_next_waiter(&self) {
        if let Some(waiter) = self.waiters.borrow_mut().pop_front() {
            waiter.unblock(UnblockResult::Unblocked);
        }
    }

    /// Drains completion notifications from the reply pipe, unblocking the
    /// fiber that submitted each finished job. Called by the scheduler's
    /// event loop whenever the reply fd is readable.
    pub fn dispatch_completions(&self) {
        let mut buf = [0u8; 8 * 64];
        loop {
            let read = {
                let mut file = std::mem::ManuallyDrop::new(unsafe {
                    <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(self.reply_rx)
                });
                file.read(&mut buf)
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            for chunk in buf[..n].chunks_exact(8) {
                let job_id = u64::from_ne_bytes(chunk.try_into().unwrap());
                if let Some(waiter) = self.pending.borrow_mut().remove(&job_id) {
                    waiter.unblock(UnblockResult::Unblocked);
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.reply_rx);
            libc::close(self.reply_tx_owned);
        }
    }
}

fn worker_loop(request_rx: mpsc::Receiver<(u64, Box<dyn Operation>)>, reply_tx: RawFd) {
    while let Ok((job_id, op)) = request_rx.recv() {
        op.perform();
        let bytes = job_id.to_ne_bytes();
        let mut remaining = &bytes[..];
        while !remaining.is_empty() {
            let written = unsafe {
                libc::write(reply_tx, remaining.as_ptr() as *const libc::c_void, remaining.len())
            };
            if written <= 0 {
                break;
            }
            remaining = &remaining[written as usize..];
        }
    }
    unsafe {
        libc::close(reply_tx);
    }
}

/// Runs an `opendir`-style worked example on a worker thread, mirroring the
/// `OpenDir` operation: opens `path` and returns the resulting directory
/// listing (or the `errno` the call failed with) back to the caller.
pub fn read_dir_blocking(scheduler: &Handle, path: impl Into<std::path::PathBuf>) -> Result<Vec<std::fs::DirEntry>> {
    let path = path.into();
    let slot: Arc<Mutex<Option<std::io::Result<Vec<std::fs::DirEntry>>>>> = Arc::new(Mutex::new(None));
    let slot_for_job = slot.clone();
    let op = move || {
        let result = std::fs::read_dir(&path).and_then(|rd| rd.collect::<std::io::Result<Vec<_>>>());
        *slot_for_job.lock().unwrap() = Some(result);
    };
    scheduler.workers().execute(scheduler, op)?;
    slot.lock()
        .unwrap()
        .take()
        .expect("worker completed without storing a result")
        .map_err(Error::Io)
}
