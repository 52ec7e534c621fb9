//! The pull-based transfer engine the session drives.
//!
//! An engine never calls back into the session directly. Whatever it wants from the
//! reactor (watch this socket, wake me up in 40ms) goes through an [`EngineListener`]
//! that the session injected with [`Engine::attach`], and is applied once the engine
//! call that produced it has returned.

pub mod libcurl;

use crate::library::{
    config::TransferPlan,
    error::SpeedTestError,
    reactor::{Mask, Readiness},
    upload::UploadStream,
};
use std::{
    os::fd::RawFd,
    sync::mpsc::{self, Receiver, Sender},
    time::Duration,
};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketInterest {
    /// Watch for these directions. An empty mask means "keep the socket, stop polling".
    Watch(Mask),
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    Cancel,
    Immediate,
    After(Duration),
}

impl From<Option<Duration>> for TimerRequest {
    fn from(delay: Option<Duration>) -> TimerRequest {
        match delay {
            None => TimerRequest::Cancel,
            Some(delay) if delay.is_zero() => TimerRequest::Immediate,
            Some(delay) => TimerRequest::After(delay),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSignal {
    Socket { fd: RawFd, interest: SocketInterest },
    Timer(TimerRequest),
}

pub trait EngineListener {
    fn on_socket_interest(&self, fd: RawFd, interest: SocketInterest);
    fn on_timer_request(&self, request: TimerRequest);
}

/// Listener that queues every request for the session to apply later.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: Sender<EngineSignal>,
}

impl SignalSender {
    pub fn channel() -> (SignalSender, Receiver<EngineSignal>) {
        let (tx, rx) = mpsc::channel();
        (SignalSender { tx }, rx)
    }

    fn send(&self, signal: EngineSignal) {
        // Session already gone; nobody is left to care.
        if self.tx.send(signal).is_err() {
            trace!("Dropped engine signal {:?}", signal);
        }
    }
}

impl EngineListener for SignalSender {
    fn on_socket_interest(&self, fd: RawFd, interest: SocketInterest) {
        self.send(EngineSignal::Socket { fd, interest });
    }

    fn on_timer_request(&self, request: TimerRequest) {
        self.send(EngineSignal::Timer(request));
    }
}

/// A finished transfer, identified by the token it was submitted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub token: usize,
    pub outcome: Result<(), String>,
}

/// Byte sink or source of one transfer.
#[derive(Debug)]
pub enum TransferBody {
    Download { received: u64 },
    Upload(UploadStream),
}

impl TransferBody {
    pub fn download() -> TransferBody {
        TransferBody::Download { received: 0 }
    }

    /// Count incoming payload and throw it away.
    pub fn absorb(&mut self, data: &[u8]) -> usize {
        if let TransferBody::Download { received } = self {
            *received += data.len() as u64;
        }
        data.len()
    }

    /// Fill `dst` with the next slice of upload data. Downloads have nothing to say.
    pub fn fill(&mut self, dst: &mut [u8]) -> usize {
        match self {
            TransferBody::Upload(stream) => stream.pull(dst),
            TransferBody::Download { .. } => 0,
        }
    }

    pub fn bytes(&self) -> u64 {
        match self {
            TransferBody::Download { received } => *received,
            TransferBody::Upload(stream) => stream.sent() as u64,
        }
    }
}

pub trait Engine {
    /// A configured transfer that the engine does not currently drive.
    type Detached;
    /// A transfer inside the engine's active set.
    type Active;

    fn attach<L>(&mut self, listener: L) -> Result<(), SpeedTestError>
    where
        L: EngineListener + Clone + Send + 'static;

    fn configure(
        &mut self,
        slot: usize,
        plan: &TransferPlan,
        body: TransferBody,
    ) -> Result<Self::Detached, SpeedTestError>;

    fn submit(
        &mut self,
        transfer: Self::Detached,
        token: usize,
    ) -> Result<Self::Active, SpeedTestError>;

    fn withdraw(&mut self, transfer: Self::Active) -> Result<Self::Detached, SpeedTestError>;

    /// Tell the engine a socket is ready. Returns the number of transfers still running.
    fn socket_action(&mut self, fd: RawFd, readiness: Readiness) -> Result<u32, SpeedTestError>;

    fn timeout_action(&mut self) -> Result<u32, SpeedTestError>;

    /// Move every finished-transfer notice into `out`.
    fn drain(&mut self, out: &mut Vec<Completion>);

    fn bytes(&self, transfer: &Self::Detached) -> u64;

    /// Where the transfer actually ended up, for error reports.
    fn target(&self, transfer: &mut Self::Detached) -> String;
}
