use crate::library::{
    engine::SocketInterest,
    reactor::{Mask, PollHandle, Reactor},
};
use std::{collections::HashMap, io, os::fd::RawFd};
use tracing::trace;

/// One engine socket the reactor is watching for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketRegistration {
    pub fd: RawFd,
    pub poll: PollHandle,
    pub armed: Mask,
}

/// At most one registration per live descriptor.
#[derive(Debug, Default)]
pub struct RegistrationTable {
    entries: HashMap<RawFd, SocketRegistration>,
}

impl RegistrationTable {
    pub fn new() -> RegistrationTable {
        RegistrationTable::default()
    }

    /// Apply one interest change. An error means the socket cannot be watched at all.
    pub fn apply(
        &mut self,
        reactor: &mut Reactor,
        fd: RawFd,
        interest: SocketInterest,
    ) -> io::Result<()> {
        match interest {
            SocketInterest::Watch(mask) => self.watch(reactor, fd, mask),
            SocketInterest::Remove => {
                self.remove(reactor, fd);
                Ok(())
            }
        }
    }

    fn watch(&mut self, reactor: &mut Reactor, fd: RawFd, mask: Mask) -> io::Result<()> {
        if let Some(entry) = self.entries.get_mut(&fd) {
            reactor.poll_start(entry.poll, mask)?;
            entry.armed = mask;
            trace!("Re-armed FD:{fd} {:?}", mask);
            return Ok(());
        }
        let poll: PollHandle = reactor.poll_init(fd)?;
        if let Err(err) = reactor.poll_start(poll, mask) {
            // Never leave a half-bound poll behind.
            let _ = reactor.poll_close(poll);
            return Err(err);
        }
        self.entries.insert(fd, SocketRegistration { fd, poll, armed: mask });
        trace!("Registered FD:{fd} {:?}", mask);
        Ok(())
    }

    fn remove(&mut self, reactor: &mut Reactor, fd: RawFd) {
        let Some(entry) = self.entries.remove(&fd) else {
            trace!("Removal of unknown FD:{fd} ignored");
            return;
        };
        if let Err(err) = reactor.poll_close(entry.poll) {
            trace!("Closing poll for FD:{fd} failed: {err}");
        }
        trace!("Unregistered FD:{fd}");
    }

    pub fn get(&self, fd: RawFd) -> Option<&SocketRegistration> {
        self.entries.get(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close whatever the engine forgot to remove.
    pub fn release_all(&mut self, reactor: &mut Reactor) -> usize {
        let released: usize = self.entries.len();
        for (fd, entry) in self.entries.drain() {
            if let Err(err) = reactor.poll_close(entry.poll) {
                trace!("Closing poll for FD:{fd} failed: {err}");
            }
        }
        released
    }
}
