use crate::library::{
    engine::TimerRequest,
    reactor::{Reactor, TimerId},
};
use std::io;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Engine wants its timeout action right now.
    RunNow,
    Armed,
    Stopped,
}

/// The single reactor timer that runs the engine's schedule for a whole phase.
#[derive(Debug, Default)]
pub struct TimerBridge {
    timer: Option<TimerId>,
}

impl TimerBridge {
    pub fn new() -> TimerBridge {
        TimerBridge::default()
    }

    pub fn schedule(
        &mut self,
        reactor: &mut Reactor,
        request: TimerRequest,
    ) -> io::Result<TimerAction> {
        match request {
            TimerRequest::Cancel => {
                self.cancel(reactor);
                Ok(TimerAction::Stopped)
            }
            TimerRequest::Immediate => {
                // A stale deadline would fire a second, pointless timeout action.
                self.cancel(reactor);
                Ok(TimerAction::RunNow)
            }
            TimerRequest::After(delay) => {
                let timer: TimerId = match self.timer {
                    Some(timer) => timer,
                    None => {
                        let timer = reactor.timer_init();
                        self.timer = Some(timer);
                        timer
                    }
                };
                reactor.timer_start(timer, delay, None)?;
                trace!("Engine timer armed for {:?}", delay);
                Ok(TimerAction::Armed)
            }
        }
    }

    /// Stop the timer if it is running. Safe to call any number of times.
    pub fn cancel(&mut self, reactor: &mut Reactor) {
        if let Some(timer) = self.timer {
            if reactor.timer_is_active(timer) {
                reactor.timer_stop(timer);
                trace!("Engine timer stopped");
            }
        }
    }

    pub fn owns(&self, id: TimerId) -> bool {
        self.timer == Some(id)
    }

    pub fn is_active(&self, reactor: &Reactor) -> bool {
        self.timer.is_some_and(|timer| reactor.timer_is_active(timer))
    }

    pub fn close(&mut self, reactor: &mut Reactor) {
        if let Some(timer) = self.timer.take() {
            reactor.timer_stop(timer);
            reactor.timer_close(timer);
        }
    }
}
