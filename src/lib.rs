//! A lightweight cooperative fiber runtime over non-blocking I/O.
//!
//! This crate multiplexes many user-level "fibers" over a single OS thread.
//! Each fiber gets its own stack and a blocking-style programming model on
//! top of non-blocking file descriptors: a fiber that would block on a
//! socket, a timer, or an explicit rendezvous yields implicitly, and the
//! [`Scheduler`](scheduler::Scheduler) resumes it once the underlying event
//! fires.
//!
//! - [Fibers, the ready queue and `join`](fiber)
//! - [The scheduler event loop](scheduler)
//! - [The blocking reference, the one suspension primitive everything else is built on](blocking)
//! - [The event multiplexer](poller)
//! - [Polled descriptors and the fiber-blocking I/O mixin](io)
//! - [TCP sockets and pipes](net)
//! - [Timers](timer)
//! - [The blocking-I/O worker pool](worker)
//! - [Stream buffering](stream) and the [typed codec](codec) built on it
//! - [Logging](log)
//! - [Error handling](error)
//!
//! ### Non-goals
//!
//! Multi-core parallelism within a single scheduler (it is single-threaded
//! cooperative by design), preemption, and portability beyond x86 and
//! x86-64; see [`context`].
//!
//! ### Example
//!
//! ```no_run
//! use microcord::fiber;
//! use microcord::scheduler::Scheduler;
//!
//! let scheduler = Scheduler::new().unwrap();
//! fiber::spawn(&scheduler, || {
//!     println!("hello from a fiber");
//! });
//! scheduler.run();
//! ```

pub mod blocking;
pub mod clock;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod io;
pub mod log;
pub mod net;
pub mod poller;
pub mod scheduler;
pub mod stack;
pub mod stream;
pub mod timer;
pub mod waker;
pub mod worker;

pub use error::{Error, Result};
pub use scheduler::Scheduler;
