//! Single-threaded readiness reactor.
//!
//! A thin event loop over `mio`: poll registrations keyed by descriptor, one-shot or
//! repeating timers, and a `turn` that waits for readiness and hands back everything
//! that happened. Dispatch is the caller's job, so callbacks never borrow the loop.
//!
//! mio registrations are edge-triggered. Every poll that fired is re-armed at the
//! start of the next turn, which makes readiness behave level-triggered: a socket the
//! engine only partially drained keeps reporting until it is empty.

use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use stable_vec::ExternStableVec;
use std::{
    io,
    os::fd::RawFd,
    time::{Duration, Instant},
};
use tracing::{trace, warn};

const EVENTS_CAPACITY: usize = 256;

/// Poll registration. Indices are never reused, so a stale handle cannot alias a new poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

/// Interest mask for a poll registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mask {
    pub readable: bool,
    pub writable: bool,
}

impl Mask {
    pub const NONE: Mask = Mask { readable: false, writable: false };
    pub const READABLE: Mask = Mask { readable: true, writable: false };
    pub const WRITABLE: Mask = Mask { readable: false, writable: true };
    pub const BOTH: Mask = Mask { readable: true, writable: true };

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    fn interest(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// What the OS said about a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub const ERROR: Readiness = Readiness { readable: false, writable: false, error: true };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Block until a socket is ready or the nearest timer expires.
    Once,
    /// Collect whatever is ready right now and return.
    NoWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorEvent {
    Readiness {
        poll: PollHandle,
        fd: RawFd,
        readiness: Readiness,
    },
    Timer(TimerId),
}

struct PollSlot {
    fd: RawFd,
    armed: Option<Interest>,
    registered: bool,
    closing: bool,
}

struct TimerSlot {
    deadline: Option<Instant>,
    repeat: Option<Duration>,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    // Slots are cleared on close but never handed out again, so both tables grow by one
    // per init for the reactor's lifetime. Fine for a few phases of at most ten transfers.
    polls: ExternStableVec<PollSlot>,
    timers: ExternStableVec<TimerSlot>,
    closing: Vec<usize>,
    fired: Vec<usize>,
    turns: u64,
    timers_created: usize,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            polls: ExternStableVec::new(),
            timers: ExternStableVec::new(),
            closing: Vec::new(),
            fired: Vec::new(),
            turns: 0,
            timers_created: 0,
        })
    }

    /// Monotonic clock sample.
    #[inline(always)]
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Bind a new poll registration to `fd`. Nothing is watched until [`Reactor::poll_start`].
    pub fn poll_init(&mut self, fd: RawFd) -> io::Result<PollHandle> {
        // Refuse descriptors the kernel has never heard of.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let index = self.polls.push(PollSlot {
            fd,
            armed: None,
            registered: false,
            closing: false,
        });
        trace!("Poll init FD:{fd} -> #{index}");
        Ok(PollHandle(index))
    }

    /// Arm (or re-arm) a registration. An empty mask stops polling but keeps the handle.
    pub fn poll_start(&mut self, handle: PollHandle, mask: Mask) -> io::Result<()> {
        let Some(interest) = mask.interest() else {
            return self.poll_stop(handle);
        };
        let slot = self
            .polls
            .get_mut(handle.0)
            .filter(|slot| !slot.closing)
            .ok_or_else(|| unknown_handle(handle))?;
        let registry = self.poll.registry();
        if slot.registered {
            registry.reregister(&mut SourceFd(&slot.fd), Token(handle.0), interest)?;
        } else {
            registry.register(&mut SourceFd(&slot.fd), Token(handle.0), interest)?;
            slot.registered = true;
        }
        slot.armed = Some(interest);
        trace!("Poll start FD:{} mask {:?}", slot.fd, mask);
        Ok(())
    }

    pub fn poll_stop(&mut self, handle: PollHandle) -> io::Result<()> {
        let slot = self
            .polls
            .get_mut(handle.0)
            .ok_or_else(|| unknown_handle(handle))?;
        if slot.registered {
            // The engine may have closed the socket already; epoll forgot it on its own then.
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&slot.fd)) {
                trace!("Deregister FD:{} ignored: {err}", slot.fd);
            }
            slot.registered = false;
        }
        slot.armed = None;
        Ok(())
    }

    /// Stop and release a registration. The slot itself is freed on the next turn.
    pub fn poll_close(&mut self, handle: PollHandle) -> io::Result<()> {
        self.poll_stop(handle)?;
        if let Some(slot) = self.polls.get_mut(handle.0) {
            if !slot.closing {
                slot.closing = true;
                self.closing.push(handle.0);
            }
        }
        Ok(())
    }

    pub fn timer_init(&mut self) -> TimerId {
        self.timers_created += 1;
        let index = self.timers.push(TimerSlot {
            deadline: None,
            repeat: None,
        });
        trace!("Timer init #{index}");
        TimerId(index)
    }

    /// Fire once after `delay`, then every `repeat` if given. Restarting replaces the schedule.
    pub fn timer_start(
        &mut self,
        id: TimerId,
        delay: Duration,
        repeat: Option<Duration>,
    ) -> io::Result<()> {
        let timer = self.timers.get_mut(id.0).ok_or_else(|| unknown_timer(id))?;
        timer.deadline = Some(Instant::now() + delay);
        timer.repeat = repeat.filter(|every| !every.is_zero());
        trace!("Timer #{} start in {:?} (repeat {:?})", id.0, delay, timer.repeat);
        Ok(())
    }

    pub fn timer_stop(&mut self, id: TimerId) {
        if let Some(timer) = self.timers.get_mut(id.0) {
            timer.deadline = None;
        }
    }

    pub fn timer_close(&mut self, id: TimerId) {
        if self.timers.remove(id.0).is_some() {
            trace!("Timer #{} closed", id.0);
        }
    }

    pub fn timer_is_active(&self, id: TimerId) -> bool {
        self.timers
            .get(id.0)
            .is_some_and(|timer| timer.deadline.is_some())
    }

    /// Anything left that could ever produce an event.
    pub fn is_alive(&self) -> bool {
        self.active_polls() > 0
            || self.timers.values().any(|timer| timer.deadline.is_some())
            || !self.closing.is_empty()
    }

    pub fn active_polls(&self) -> usize {
        self.polls
            .values()
            .filter(|slot| slot.armed.is_some())
            .count()
    }

    /// Poll slots still allocated, closing ones included.
    pub fn poll_slots(&self) -> usize {
        self.polls.num_elements()
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    pub fn timers_created(&self) -> usize {
        self.timers_created
    }

    /// One pass of the loop: reap closed polls, wait, and append what happened to `out`.
    /// Timers are reported after socket readiness, earliest deadline first.
    pub fn turn(&mut self, mode: RunMode, out: &mut Vec<ReactorEvent>) -> io::Result<usize> {
        self.turns += 1;
        self.reap_closed();
        self.rearm_fired();
        let timeout: Option<Duration> = match mode {
            RunMode::NoWait => Some(Duration::ZERO),
            RunMode::Once => self.next_timeout(),
        };
        trace!("Reactor turn #{} ({:?}, timeout {:?})", self.turns, mode, timeout);
        let before: usize = out.len();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // A signal woke us up. Nobody is ready, go around again.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                trace!("Reactor wait interrupted");
            }
            Err(err) => return Err(err),
        }
        for event in self.events.iter() {
            let index: usize = event.token().0;
            let Some(slot) = self.polls.get(index) else {
                continue;
            };
            if slot.closing || slot.armed.is_none() {
                continue;
            }
            self.fired.push(index);
            out.push(ReactorEvent::Readiness {
                poll: PollHandle(index),
                fd: slot.fd,
                readiness: Readiness {
                    readable: event.is_readable() || event.is_read_closed(),
                    writable: event.is_writable() || event.is_write_closed(),
                    error: event.is_error(),
                },
            });
        }
        self.expire_timers(out);
        Ok(out.len() - before)
    }

    /// Final non-blocking pass before the loop goes away.
    pub fn shutdown(&mut self) -> io::Result<()> {
        let mut leftovers: Vec<ReactorEvent> = Vec::new();
        self.turn(RunMode::NoWait, &mut leftovers)?;
        if self.is_alive() {
            warn!(
                "Reactor closed with {} armed polls still around",
                self.active_polls()
            );
        }
        Ok(())
    }

    fn next_timeout(&self) -> Option<Duration> {
        let now: Instant = Instant::now();
        match self.timers.values().filter_map(|timer| timer.deadline).min() {
            Some(deadline) => Some(deadline.saturating_duration_since(now)),
            // Sockets armed and no timers: sleep until the OS has news.
            None if self.active_polls() > 0 => None,
            // Nothing armed at all. Blocking now would be forever.
            None => Some(Duration::ZERO),
        }
    }

    fn reap_closed(&mut self) {
        for index in self.closing.drain(..) {
            self.polls.remove(index);
        }
    }

    fn rearm_fired(&mut self) {
        for index in self.fired.drain(..) {
            let Some(slot) = self.polls.get_mut(index) else {
                continue;
            };
            let Some(interest) = slot.armed.filter(|_| slot.registered && !slot.closing) else {
                continue;
            };
            let rearm = self
                .poll
                .registry()
                .reregister(&mut SourceFd(&slot.fd), Token(index), interest);
            if let Err(err) = rearm {
                // Socket vanished under us; the engine will say so on its own.
                trace!("Re-arm FD:{} failed: {err}", slot.fd);
                slot.registered = false;
                slot.armed = None;
            }
        }
    }

    fn expire_timers(&mut self, out: &mut Vec<ReactorEvent>) {
        let now: Instant = Instant::now();
        let mut due: Vec<(Instant, usize)> = self
            .timers
            .iter()
            .filter_map(|(index, timer)| {
                timer
                    .deadline
                    .filter(|deadline| *deadline <= now)
                    .map(|deadline| (deadline, index))
            })
            .collect();
        due.sort_unstable();
        for (_, index) in due {
            if let Some(timer) = self.timers.get_mut(index) {
                timer.deadline = timer.repeat.map(|every| now + every);
                out.push(ReactorEvent::Timer(TimerId(index)));
            }
        }
    }
}

fn unknown_handle(handle: PollHandle) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("poll registration #{} is gone", handle.0),
    )
}

fn unknown_timer(id: TimerId) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("timer #{} is gone", id.0))
}
