//! Event multiplexer.
//!
//! Wraps the OS readiness interface (epoll, via the `polling` crate) behind
//! add/modify/remove/wait, plus the dispatch discipline that makes it safe
//! for a descriptor's own event handler to destroy another descriptor that's
//! still waiting to be dispatched in the same batch: a `pending_delete` set
//! absorbs destroy-during-dispatch until the batch ends.

use std::cell::RefCell;
use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::time::Duration;

use polling::{Event, Events, PollMode, Poller};

use crate::error::{Error, Result};

bitflags_like::bitflags! {
    /// Readiness directions a polled descriptor can request.
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

mod bitflags_like {
    // A tiny hand-rolled bitflags-style macro so the crate doesn't need to
    // pull in the `bitflags` crate for two bits worth of flags.
    macro_rules! bitflags {
        (
            $(#[$outer:meta])*
            pub struct $name:ident: $repr:ty {
                $(const $variant:ident = $value:expr;)*
            }
        ) => {
            $(#[$outer])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
            pub struct $name($repr);

            impl $name {
                $(pub const $variant: Self = Self($value);)*
                pub const NONE: Self = Self(0);

                pub fn contains(self, other: Self) -> bool {
                    self.0 & other.0 == other.0
                }

                pub fn is_empty(self) -> bool {
                    self.0 == 0
                }

                pub fn insert(&mut self, other: Self) {
                    self.0 |= other.0;
                }

                pub fn remove(&mut self, other: Self) {
                    self.0 &= !other.0;
                }
            }

            impl std::ops::BitOr for $name {
                type Output = Self;
                fn bitor(self, rhs: Self) -> Self {
                    Self(self.0 | rhs.0)
                }
            }
        };
    }
    pub(crate) use bitflags;
}

/// A trait over the event-multiplexer shape, so tests can inject a fake
/// implementation via [`crate::config::Config::multiplexer`].
pub trait EventMultiplexer {
    fn add(&self, fd: RawFd, interest: Interest) -> Result<()>;
    fn modify(&self, fd: RawFd, interest: Interest) -> Result<()>;
    fn remove(&self, fd: RawFd) -> Result<()>;
    /// Waits up to `timeout` (`None` = forever) and returns the set of fds
    /// that became ready, tagged with the direction(s) observed.
    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Interest)>>;
}

/// The default, `polling`-backed (epoll on Linux) multiplexer.
pub struct PollingMultiplexer {
    poller: Poller,
    events: RefCell<Events>,
    registered: RefCell<HashSet<RawFd>>,
}

impl PollingMultiplexer {
    pub fn new() -> Result<Self> {
        let poller = Poller::new().map_err(Error::Io)?;
        Ok(Self {
            poller,
            events: RefCell::new(Events::new()),
            registered: RefCell::new(HashSet::new()),
        })
    }

    fn to_event(fd: RawFd, interest: Interest) -> Event {
        let mut ev = Event::none(fd as usize);
        ev.readable = interest.contains(Interest::READABLE);
        ev.writable = interest.contains(Interest::WRITABLE);
        ev
    }
}

impl EventMultiplexer for PollingMultiplexer {
    fn add(&self, fd: RawFd, interest: Interest) -> Result<()> {
        // SAFETY: callers register only fds they own for the lifetime of
        // the registration, and remove them before closing (§4.7/§4.8).
        unsafe {
            self.poller
                .add_with_mode(fd, Self::to_event(fd, interest), PollMode::Level)
                .map_err(Error::Io)?;
        }
        self.registered.borrow_mut().insert(fd);
        Ok(())
    }

    fn modify(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.poller
            .modify_with_mode(
                &UnownedFd(fd),
                Self::to_event(fd, interest),
                PollMode::Level,
            )
            .map_err(Error::Io)
    }

    fn remove(&self, fd: RawFd) -> Result<()> {
        self.poller.delete(&UnownedFd(fd)).map_err(Error::Io)?;
        self.registered.borrow_mut().remove(&fd);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Interest)>> {
        let mut events = self.events.borrow_mut();
        events.clear();
        match self.poller.wait(&mut events, timeout) {
            Ok(_) => {}
            // EINTR is reported as zero events, not a failure (§4.6).
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        }
        let mut ready = Vec::new();
        for event in events.iter() {
            let mut interest = Interest::NONE;
            if event.readable {
                interest.insert(Interest::READABLE);
            }
            if event.writable {
                interest.insert(Interest::WRITABLE);
            }
            ready.push((event.key as RawFd, interest));
        }
        Ok(ready)
    }
}

/// `polling`'s `modify`/`delete` take a `&impl AsRawFd`; our registry only
/// has the bare fd at that point (the owning `PolledFd` may be mid-drop),
/// so this newtype hands back exactly that fd without claiming ownership.
struct UnownedFd(RawFd);

impl std::os::unix::io::AsRawFd for UnownedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Dispatch-time guard against use-after-free: while dispatching a batch of
/// events, any descriptor destruction is deferred into `pending_delete`
/// instead of happening immediately.
#[derive(Default)]
pub struct DispatchGuard {
    in_dispatch: std::cell::Cell<bool>,
    pending_delete: RefCell<HashSet<RawFd>>,
}

impl DispatchGuard {
    pub fn begin(&self) {
        self.in_dispatch.set(true);
    }

    pub fn end(&self) -> Vec<RawFd> {
        self.in_dispatch.set(false);
        self.pending_delete.borrow_mut().drain().collect()
    }

    /// Returns `true` if the destruction should proceed immediately, or
    /// `false` if it was deferred (caller must not touch the descriptor
    /// again until the batch ends).
    pub fn destroy_or_defer(&self, fd: RawFd) -> bool {
        if self.in_dispatch.get() {
            self.pending_delete.borrow_mut().insert(fd);
            false
        } else {
            true
        }
    }

    pub fn is_pending_delete(&self, fd: RawFd) -> bool {
        self.pending_delete.borrow().contains(&fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_flags_combine_and_query_correctly() {
        let mut mask = Interest::NONE;
        assert!(mask.is_empty());
        mask.insert(Interest::READABLE);
        assert!(mask.contains(Interest::READABLE));
        assert!(!mask.contains(Interest::WRITABLE));
        mask.insert(Interest::WRITABLE);
        assert!(mask.contains(Interest::READABLE | Interest::WRITABLE));
        mask.remove(Interest::READABLE);
        assert!(!mask.contains(Interest::READABLE));
        assert!(mask.contains(Interest::WRITABLE));
    }

    #[test]
    fn destroy_outside_dispatch_proceeds_immediately() {
        let guard = DispatchGuard::default();
        assert!(guard.destroy_or_defer(7));
        assert!(!guard.is_pending_delete(7));
    }

    #[test]
    fn destroy_during_dispatch_is_deferred_until_batch_ends() {
        let guard = DispatchGuard::default();
        guard.begin();
        assert!(!guard.destroy_or_defer(42));
        assert!(guard.is_pending_delete(42));

        let deferred = guard.end();
        assert_eq!(deferred, vec![42]);
        assert!(!guard.is_pending_delete(42));
    }

    #[test]
    fn a_descriptor_deleted_mid_batch_is_skipped_by_later_lookups() {
        // Mirrors the scheduler's own dispatch loop: it calls
        // `is_pending_delete` before delivering each batched event, so a
        // descriptor destroyed earlier in the same batch never reaches its
        // handler a second time.
        let guard = DispatchGuard::default();
        guard.begin();
        guard.destroy_or_defer(1);
        let ready = [1, 2];
        let delivered: Vec<RawFd> = ready.iter().copied().filter(|fd| !guard.is_pending_delete(*fd)).collect();
        assert_eq!(delivered, vec![2]);
        guard.end();
    }
}
