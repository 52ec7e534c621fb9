//! One measurement phase: N transfers, one reactor, one engine.
//!
//! The session owns everything that lives exactly as long as a phase does: the live
//! transfer counter, the socket registrations, the engine's timer and the transfer
//! slots. Every engine call is followed by [`Session::settle`], which drains finished
//! transfers and applies whatever the engine asked for, until neither has anything left.

use crate::library::{
    bridge::{
        registrations::RegistrationTable,
        timer::{TimerAction, TimerBridge},
    },
    config::{Direction, KEEP_ALIVE_GRACE, TransferPlan},
    engine::{Completion, Engine, EngineSignal, SignalSender, TransferBody},
    error::SpeedTestError,
    reactor::{Reactor, ReactorEvent, Readiness, RunMode, TimerId},
    stats::{AggregateStats, PhaseReport, TransferFailure},
    upload::UploadBuffer,
};
use std::{
    mem,
    os::fd::RawFd,
    sync::mpsc::Receiver,
    time::{Duration, Instant},
};
use tracing::{error, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Succeeded,
    Failed(String),
}

enum Link<E: Engine> {
    Active(E::Active),
    Detached(E::Detached),
    Reclaimed,
}

struct TransferHandle<E: Engine> {
    slot: usize,
    link: Link<E>,
    status: TransferStatus,
    bytes: u64,
}

pub struct Session<'r, E: Engine> {
    reactor: &'r mut Reactor,
    engine: E,
    signals: Receiver<EngineSignal>,
    sockets: RegistrationTable,
    timer: TimerBridge,
    keep_alive: Option<TimerId>,
    transfers: Vec<TransferHandle<E>>,
    failures: Vec<TransferFailure>,
    live: usize,
    direction: Direction,
    started: Option<Instant>,
    finished: Option<Instant>,
    events: Vec<ReactorEvent>,
    completions: Vec<Completion>,
}

impl<'r, E: Engine> Session<'r, E> {
    pub fn new(reactor: &'r mut Reactor, mut engine: E) -> Result<Self, SpeedTestError> {
        let (listener, signals) = SignalSender::channel();
        engine.attach(listener)?;
        Ok(Session {
            reactor,
            engine,
            signals,
            sockets: RegistrationTable::new(),
            timer: TimerBridge::new(),
            keep_alive: None,
            transfers: Vec::new(),
            failures: Vec::new(),
            live: 0,
            direction: Direction::Download,
            started: None,
            finished: None,
            events: Vec::new(),
            completions: Vec::new(),
        })
    }

    #[inline(always)]
    pub fn live(&self) -> usize {
        self.live
    }

    #[inline(always)]
    pub fn registered(&self) -> usize {
        self.sockets.len()
    }

    pub fn statuses(&self) -> Vec<TransferStatus> {
        self.transfers
            .iter()
            .map(|handle| handle.status.clone())
            .collect()
    }

    /// Failed transfers so far, in the order they were reported.
    pub fn failures(&self) -> &[TransferFailure] {
        &self.failures
    }

    /// Configure and submit up to `plan.connections` transfers.
    /// Returns how many made it into the engine.
    pub fn launch(
        &mut self,
        plan: &TransferPlan,
        upload: Option<&UploadBuffer>,
    ) -> Result<usize, SpeedTestError> {
        plan.validate()?;
        self.direction = plan.direction;
        if plan.direction == Direction::Upload && upload.is_none() {
            return Err(SpeedTestError::ResourceExhaustion(
                "upload phase started without upload data".to_string(),
            ));
        }
        self.started = Some(self.reactor.now());
        for slot in 0..plan.connections {
            let body: TransferBody = match upload {
                Some(buffer) if plan.direction == Direction::Upload => {
                    TransferBody::Upload(buffer.stream())
                }
                _ => TransferBody::download(),
            };
            let detached = match self.engine.configure(slot, plan, body) {
                Ok(detached) => detached,
                Err(err) => {
                    error!("{err}. Skipping.");
                    continue;
                }
            };
            match self.engine.submit(detached, slot) {
                Ok(active) => {
                    self.transfers.push(TransferHandle {
                        slot,
                        link: Link::Active(active),
                        status: TransferStatus::Pending,
                        bytes: 0,
                    });
                    self.live += 1;
                }
                Err(err) => error!("{err}. Skipping."),
            }
        }
        if self.live == 0 {
            // Nothing to drive. Whatever the engine queued is moot.
            while self.signals.try_recv().is_ok() {}
            return Err(SpeedTestError::BatchAbort {
                direction: plan.direction,
            });
        }
        // Holds the loop open for the phase's whole timeout ceiling.
        let keep_alive: TimerId = self.reactor.timer_init();
        self.reactor
            .timer_start(keep_alive, plan.timeout + KEEP_ALIVE_GRACE, None)?;
        self.keep_alive = Some(keep_alive);
        info!(
            "{} transfers added. Starting event loop for {}...",
            self.live, plan.direction
        );
        Ok(self.live)
    }

    /// Run the reactor until every submitted transfer has finished.
    pub fn drive(&mut self) -> Result<(), SpeedTestError> {
        self.settle()?;
        while self.live > 0 {
            if !self.reactor.is_alive() {
                warn!(
                    "Reactor ran dry with {} {} transfers still live",
                    self.live, self.direction
                );
                break;
            }
            let mut events: Vec<ReactorEvent> = mem::take(&mut self.events);
            events.clear();
            let outcome = self.reactor.turn(RunMode::Once, &mut events);
            if let Err(err) = outcome {
                self.events = events;
                return Err(err.into());
            }
            for event in events.iter() {
                self.dispatch(*event)?;
            }
            self.events = events;
        }
        self.finished = Some(self.reactor.now());
        info!("Event loop finished for {} test.", self.direction);
        self.close_timers();
        let mut leftovers: Vec<ReactorEvent> = Vec::new();
        self.reactor.turn(RunMode::NoWait, &mut leftovers)?;
        if !leftovers.is_empty() {
            trace!("{} events after the last transfer, ignored", leftovers.len());
        }
        Ok(())
    }

    fn dispatch(&mut self, event: ReactorEvent) -> Result<(), SpeedTestError> {
        match event {
            ReactorEvent::Readiness { fd, readiness, .. } => {
                trace!("FD:{fd} ready {:?}", readiness);
                self.socket_action(fd, readiness);
                self.settle()
            }
            ReactorEvent::Timer(id) if self.timer.owns(id) => {
                // Re-armed by an earlier event in this batch; that deadline is the real one.
                if self.timer.is_active(self.reactor) {
                    trace!("Stale engine timer event skipped");
                    return Ok(());
                }
                self.timeout_action();
                self.settle()
            }
            ReactorEvent::Timer(id) if self.keep_alive == Some(id) => {
                warn!(
                    "{} phase outlived its timeout ceiling with {} transfers live",
                    self.direction, self.live
                );
                Ok(())
            }
            ReactorEvent::Timer(_) => Ok(()),
        }
    }

    fn socket_action(&mut self, fd: RawFd, readiness: Readiness) {
        if let Err(err) = self.engine.socket_action(fd, readiness) {
            warn!("Socket action on FD:{fd} failed: {err}");
        }
    }

    fn timeout_action(&mut self) {
        if let Err(err) = self.engine.timeout_action() {
            warn!("Timeout action failed: {err}");
        }
    }

    /// Drain completions and apply engine requests until both queues are empty.
    pub fn settle(&mut self) -> Result<(), SpeedTestError> {
        loop {
            self.collect_completions();
            let Ok(signal) = self.signals.try_recv() else {
                return Ok(());
            };
            match signal {
                EngineSignal::Socket { fd, interest } => {
                    if let Err(err) = self.sockets.apply(self.reactor, fd, interest) {
                        error!(
                            "{}",
                            SpeedTestError::ResourceExhaustion(format!(
                                "cannot watch FD:{fd}: {err}"
                            ))
                        );
                        // Let the engine fail whichever transfer owns it.
                        self.socket_action(fd, Readiness::ERROR);
                    }
                }
                EngineSignal::Timer(request) => {
                    if self.timer.schedule(self.reactor, request)? == TimerAction::RunNow {
                        self.timeout_action();
                    }
                }
            }
        }
    }

    fn collect_completions(&mut self) {
        let mut completions: Vec<Completion> = mem::take(&mut self.completions);
        self.engine.drain(&mut completions);
        for completion in completions.drain(..) {
            let Some(handle) = self
                .transfers
                .iter_mut()
                .find(|handle| handle.slot == completion.token)
            else {
                warn!("Completion for unknown transfer #{} ignored", completion.token);
                continue;
            };
            if handle.status != TransferStatus::Pending {
                warn!("Duplicate completion for transfer #{} ignored", handle.slot);
                continue;
            }
            handle.link = match mem::replace(&mut handle.link, Link::Reclaimed) {
                Link::Active(active) => match self.engine.withdraw(active) {
                    Ok(detached) => Link::Detached(detached),
                    Err(err) => {
                        warn!("Withdrawing transfer #{} failed: {err}", handle.slot);
                        Link::Reclaimed
                    }
                },
                other => other,
            };
            handle.status = match completion.outcome {
                Ok(()) => TransferStatus::Succeeded,
                Err(reason) => {
                    let target: String = match &mut handle.link {
                        Link::Detached(detached) => self.engine.target(detached),
                        _ => format!("transfer #{}", handle.slot),
                    };
                    error!(
                        "{}",
                        SpeedTestError::Transfer {
                            target: target.clone(),
                            reason: reason.clone()
                        }
                    );
                    self.failures.push(TransferFailure {
                        slot: handle.slot,
                        target,
                        reason: reason.clone(),
                    });
                    TransferStatus::Failed(reason)
                }
            };
            self.live = self.live.saturating_sub(1);
            trace!("Transfer #{} done, {} live", handle.slot, self.live);
        }
        self.completions = completions;
        if self.live == 0 {
            self.timer.cancel(self.reactor);
            if let Some(keep_alive) = self.keep_alive {
                self.reactor.timer_stop(keep_alive);
            }
        }
    }

    fn close_timers(&mut self) {
        self.timer.close(self.reactor);
        if let Some(keep_alive) = self.keep_alive.take() {
            self.reactor.timer_stop(keep_alive);
            self.reactor.timer_close(keep_alive);
        }
    }

    /// Withdraw and reclaim every transfer. Returns (total bytes, successes).
    fn reclaim(&mut self) -> (u64, usize) {
        let mut total: u64 = 0;
        let mut succeeded: usize = 0;
        for handle in self.transfers.iter_mut() {
            let mut detached: Option<E::Detached> =
                match mem::replace(&mut handle.link, Link::Reclaimed) {
                    Link::Active(active) => match self.engine.withdraw(active) {
                        Ok(detached) => Some(detached),
                        Err(err) => {
                            warn!("Withdrawing transfer #{} failed: {err}", handle.slot);
                            None
                        }
                    },
                    Link::Detached(detached) => Some(detached),
                    // Counted on an earlier pass.
                    Link::Reclaimed => None,
                };
            if handle.status == TransferStatus::Pending {
                let reason: String = "withdrawn before completion".to_string();
                let target: String = match detached.as_mut() {
                    Some(detached) => self.engine.target(detached),
                    None => format!("transfer #{}", handle.slot),
                };
                self.failures.push(TransferFailure {
                    slot: handle.slot,
                    target,
                    reason: reason.clone(),
                });
                handle.status = TransferStatus::Failed(reason);
            }
            if let Some(detached) = detached {
                handle.bytes = self.engine.bytes(&detached);
            }
            total += handle.bytes;
            if handle.status == TransferStatus::Succeeded {
                succeeded += 1;
            }
        }
        self.live = 0;
        let released: usize = self.sockets.release_all(self.reactor);
        if released > 0 {
            trace!("Released {released} leftover socket registrations");
        }
        self.close_timers();
        (total, succeeded)
    }

    /// Reclaim everything and compute the phase's numbers.
    pub fn finish(&mut self) -> PhaseReport {
        let (total_bytes, succeeded) = self.reclaim();
        let end: Instant = self.finished.unwrap_or_else(|| self.reactor.now());
        let elapsed: Duration = self
            .started
            .map(|started| end.saturating_duration_since(started))
            .unwrap_or_default();
        PhaseReport {
            direction: self.direction,
            stats: AggregateStats::new(self.transfers.len(), succeeded, total_bytes, elapsed),
            failures: self.failures.clone(),
        }
    }
}

impl<'r, E: Engine> Drop for Session<'r, E> {
    fn drop(&mut self) {
        self.reclaim();
    }
}

/// Run one complete phase against a fresh engine.
pub fn run_phase<E: Engine>(
    reactor: &mut Reactor,
    engine: E,
    plan: &TransferPlan,
) -> Result<PhaseReport, SpeedTestError> {
    plan.validate()?;
    info!(
        "Starting {} test: {} connection(s) to {}",
        plan.direction, plan.connections, plan.url
    );
    let upload: Option<UploadBuffer> = match plan.direction {
        Direction::Upload => Some(UploadBuffer::generate(plan.upload_size)?),
        Direction::Download => None,
    };
    let mut session: Session<'_, E> = Session::new(reactor, engine)?;
    session.launch(plan, upload.as_ref())?;
    // Streams hold their own references; the data goes away with the last of them.
    drop(upload);
    session.drive()?;
    Ok(session.finish())
}
