//! Level-triggered readiness reactor over `epoll`.
//!
//! Descriptors are registered with an empty interest set and get a
//! [`Token`]. Each [`Reactor::turn`] waits once, then hands every ready
//! token to a [`Dispatch`] implementation exactly once with the union of
//! its ready conditions. Hang-up and error are always reported, whatever
//! the interest set.
//!
//! Unregistering during a pass is deferred: the token is marked closing,
//! skipped for the rest of the pass, and its slot is reclaimed only after
//! the pass completes. A token therefore never names two descriptors
//! within one pass.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::{debug, trace};

/// Handle for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A set of readiness conditions.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(u32);

impl Events {
    pub const NONE: Events = Events(0);
    pub const READABLE: Events = Events(libc::EPOLLIN as u32);
    pub const WRITABLE: Events = Events(libc::EPOLLOUT as u32);
    pub const HANGUP: Events = Events(libc::EPOLLHUP as u32);
    pub const ERROR: Events = Events(libc::EPOLLERR as u32);

    const ALL: Events = Events(
        Self::READABLE.0 | Self::WRITABLE.0 | Self::HANGUP.0 | Self::ERROR.0,
    );

    fn from_epoll(bits: u32) -> Self {
        Events(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if any condition in `other` is also in `self`.
    pub fn intersects(self, other: Events) -> bool {
        self.0 & other.0 != 0
    }

    pub fn without(self, other: Events) -> Events {
        Events(self.0 & !other.0)
    }

    pub fn is_readable(self) -> bool {
        self.intersects(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE)
    }

    /// Hang-up or error.
    pub fn is_closed(self) -> bool {
        self.intersects(Self::HANGUP | Self::ERROR)
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::HANGUP, "HANGUP"),
            (Self::ERROR, "ERROR"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.intersects(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// Receives readiness notifications from [`Reactor::turn`].
pub trait Dispatch {
    /// Handle `events` for `token`. The reactor is lent back so the
    /// handler can change interest sets or register and unregister
    /// descriptors.
    fn dispatch(&mut self, reactor: &mut Reactor, token: Token, events: Events);

    /// Checked by [`Reactor::run`] after every pass.
    fn is_done(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct Hook {
    fd: RawFd,
    wanted: Events,
    closing: bool,
}

/// The readiness loop.
pub struct Reactor {
    epoll: OwnedFd,
    hooks: Vec<Option<Hook>>,
    free_slots: Vec<usize>,
    live: usize,
    events: Vec<libc::epoll_event>,
    ready: Vec<(Token, Events)>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 has no pointer arguments.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by the kernel and is owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            epoll,
            hooks: Vec::new(),
            free_slots: Vec::new(),
            live: 0,
            events: Vec::new(),
            ready: Vec::new(),
        })
    }

    /// Register `fd` with an empty interest set and switch it to
    /// non-blocking mode.
    ///
    /// The descriptor must stay open until [`Reactor::unregister`] is
    /// called for the returned token.
    pub fn register(&mut self, fd: BorrowedFd<'_>) -> io::Result<Token> {
        serimux_transport::set_nonblocking(fd)?;

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.hooks.push(None);
                self.hooks.len() - 1
            }
        };
        let token = Token(slot);

        let mut event = libc::epoll_event {
            events: 0,
            u64: slot as u64,
        };
        // SAFETY: event points to a valid epoll_event for the call's duration.
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd.as_raw_fd(),
                &mut event,
            )
        };
        if rc < 0 {
            self.free_slots.push(slot);
            return Err(io::Error::last_os_error());
        }

        self.hooks[slot] = Some(Hook {
            fd: fd.as_raw_fd(),
            wanted: Events::NONE,
            closing: false,
        });
        self.live += 1;
        trace!(%token, fd = fd.as_raw_fd(), "registered descriptor");
        Ok(token)
    }

    /// Stop watching `token`. Takes effect immediately for dispatching;
    /// the slot is reused only after the current pass.
    pub fn unregister(&mut self, token: Token) {
        let epoll = self.epoll.as_raw_fd();
        let Some(hook) = self.live_hook_mut(token) else {
            return;
        };
        hook.closing = true;
        let fd = hook.fd;
        // SAFETY: a null event pointer is permitted for EPOLL_CTL_DEL.
        let rc = unsafe { libc::epoll_ctl(epoll, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            debug!(%token, error = %io::Error::last_os_error(), "epoll delete failed");
        }
        self.live -= 1;
        trace!(%token, fd, "unregistered descriptor");
    }

    /// Add conditions to the interest set.
    pub fn enable(&mut self, token: Token, events: Events) -> io::Result<()> {
        self.update(token, |wanted| wanted | events)
    }

    /// Remove conditions from the interest set.
    pub fn disable(&mut self, token: Token, events: Events) -> io::Result<()> {
        self.update(token, |wanted| wanted.without(events))
    }

    /// Current interest set, if `token` is registered.
    pub fn interest(&self, token: Token) -> Option<Events> {
        self.hooks
            .get(token.0)
            .and_then(Option::as_ref)
            .filter(|hook| !hook.closing)
            .map(|hook| hook.wanted)
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.interest(token).is_some()
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Wait once for readiness and dispatch. Returns the number of
    /// dispatched tokens. An interrupted wait ends the pass with nothing
    /// dispatched.
    pub fn turn<D>(&mut self, timeout: Option<Duration>, dispatcher: &mut D) -> io::Result<usize>
    where
        D: Dispatch + ?Sized,
    {
        let capacity = self.live.max(1);
        self.events.clear();
        self.events
            .resize(capacity, libc::epoll_event { events: 0, u64: 0 });

        // SAFETY: events holds `capacity` initialized entries.
        let rc = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                capacity as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        for event in &self.events[..rc as usize] {
            let token = Token(event.u64 as usize);
            let events = Events::from_epoll(event.events);
            match ready.iter_mut().find(|(t, _)| *t == token) {
                Some((_, merged)) => *merged |= events,
                None => ready.push((token, events)),
            }
        }

        let mut dispatched = 0;
        for &(token, events) in &ready {
            if self.live_hook_mut(token).is_some() {
                dispatcher.dispatch(self, token, events);
                dispatched += 1;
            }
        }
        self.ready = ready;
        self.reclaim();
        Ok(dispatched)
    }

    /// Run passes until the dispatcher reports it is done.
    pub fn run<D>(&mut self, dispatcher: &mut D) -> io::Result<()>
    where
        D: Dispatch + ?Sized,
    {
        while !dispatcher.is_done() {
            self.turn(None, dispatcher)?;
        }
        Ok(())
    }

    fn update(&mut self, token: Token, change: impl FnOnce(Events) -> Events) -> io::Result<()> {
        let epoll = self.epoll.as_raw_fd();
        let Some(hook) = self.live_hook_mut(token) else {
            return Ok(());
        };
        let wanted = change(hook.wanted);
        if wanted == hook.wanted {
            return Ok(());
        }
        let mut event = libc::epoll_event {
            events: wanted.bits(),
            u64: token.0 as u64,
        };
        // SAFETY: event points to a valid epoll_event for the call's duration.
        let rc = unsafe { libc::epoll_ctl(epoll, libc::EPOLL_CTL_MOD, hook.fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        hook.wanted = wanted;
        Ok(())
    }

    fn live_hook_mut(&mut self, token: Token) -> Option<&mut Hook> {
        self.hooks
            .get_mut(token.0)
            .and_then(Option::as_mut)
            .filter(|hook| !hook.closing)
    }

    fn reclaim(&mut self) {
        for (slot, entry) in self.hooks.iter_mut().enumerate() {
            if entry.as_ref().is_some_and(|hook| hook.closing) {
                *entry = None;
                self.free_slots.push(slot);
            }
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("epoll", &self.epoll.as_raw_fd())
            .field("live", &self.live)
            .finish()
    }
}

fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
