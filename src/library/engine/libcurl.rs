use crate::library::{
    config::{Direction, TransferPlan},
    engine::{
        Completion, Engine, EngineListener, SocketInterest, TimerRequest, TransferBody,
    },
    error::SpeedTestError,
    network::socket_helpers::prepare_outgoing_socket,
    reactor::{Mask, Readiness},
};
use curl::{
    easy::{Easy2, Handler, ReadError, WriteError},
    multi::{Easy2Handle, Events, Multi, SocketEvents},
};
use libc::c_int;
use std::{os::fd::RawFd, time::Duration};
use tracing::{trace, warn};

/// Per-transfer state libcurl calls into.
pub struct Transfer {
    body: TransferBody,
    url: String,
    direction: Direction,
    socket_buffer: Option<usize>,
}

impl Handler for Transfer {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        Ok(self.body.absorb(data))
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, ReadError> {
        Ok(self.body.fill(data))
    }

    fn open_socket(&mut self, family: c_int, socktype: c_int, protocol: c_int) -> Option<c_int> {
        match prepare_outgoing_socket(family, socktype, protocol, self.socket_buffer, self.direction)
        {
            Ok(fd) => Some(fd),
            Err(err) => {
                warn!("Could not open {} socket for {}: {err}", self.direction, self.url);
                None
            }
        }
    }
}

/// libcurl multi interface driven socket by socket.
pub struct CurlEngine {
    multi: Multi,
}

impl CurlEngine {
    pub fn new() -> CurlEngine {
        CurlEngine {
            multi: Multi::new(),
        }
    }
}

impl Default for CurlEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn interest_of(events: &SocketEvents) -> SocketInterest {
    if events.remove() {
        return SocketInterest::Remove;
    }
    let both: bool = events.input_and_output();
    SocketInterest::Watch(Mask {
        readable: both || events.input(),
        writable: both || events.output(),
    })
}

fn misconfigured(slot: usize, err: curl::Error) -> SpeedTestError {
    SpeedTestError::Configuration {
        slot,
        reason: err.to_string(),
    }
}

impl Engine for CurlEngine {
    type Detached = Easy2<Transfer>;
    type Active = Easy2Handle<Transfer>;

    fn attach<L>(&mut self, listener: L) -> Result<(), SpeedTestError>
    where
        L: EngineListener + Clone + Send + 'static,
    {
        let sockets: L = listener.clone();
        self.multi
            .socket_function(move |fd: RawFd, events: SocketEvents, _token: usize| {
                let interest: SocketInterest = interest_of(&events);
                trace!("Engine wants FD:{fd} {:?}", interest);
                sockets.on_socket_interest(fd, interest);
            })
            .map_err(|err| SpeedTestError::Engine(err.to_string()))?;
        self.multi
            .timer_function(move |delay: Option<Duration>| {
                trace!("Engine timer request {:?}", delay);
                listener.on_timer_request(TimerRequest::from(delay));
                true
            })
            .map_err(|err| SpeedTestError::Engine(err.to_string()))?;
        Ok(())
    }

    fn configure(
        &mut self,
        slot: usize,
        plan: &TransferPlan,
        body: TransferBody,
    ) -> Result<Self::Detached, SpeedTestError> {
        let mut easy: Easy2<Transfer> = Easy2::new(Transfer {
            body,
            url: plan.url.clone(),
            direction: plan.direction,
            socket_buffer: plan.socket_buffer,
        });
        easy.url(&plan.url).map_err(|err| misconfigured(slot, err))?;
        easy.timeout(plan.timeout)
            .map_err(|err| misconfigured(slot, err))?;
        easy.verbose(false).map_err(|err| misconfigured(slot, err))?;
        // Timeouts go through the multi timer, not SIGALRM.
        easy.signal(false).map_err(|err| misconfigured(slot, err))?;
        match plan.direction {
            Direction::Download => {
                easy.follow_location(true)
                    .map_err(|err| misconfigured(slot, err))?;
            }
            Direction::Upload => {
                easy.upload(true).map_err(|err| misconfigured(slot, err))?;
                easy.in_filesize(plan.upload_size as u64)
                    .map_err(|err| misconfigured(slot, err))?;
            }
        }
        if plan.bypass_proxy {
            easy.noproxy("*").map_err(|err| misconfigured(slot, err))?;
        }
        Ok(easy)
    }

    fn submit(
        &mut self,
        transfer: Self::Detached,
        token: usize,
    ) -> Result<Self::Active, SpeedTestError> {
        let rejected = |err: String| SpeedTestError::Submission {
            slot: token,
            reason: err,
        };
        let mut handle: Easy2Handle<Transfer> = self
            .multi
            .add2(transfer)
            .map_err(|err| rejected(err.to_string()))?;
        handle
            .set_token(token)
            .map_err(|err| rejected(err.to_string()))?;
        Ok(handle)
    }

    fn withdraw(&mut self, transfer: Self::Active) -> Result<Self::Detached, SpeedTestError> {
        self.multi
            .remove2(transfer)
            .map_err(|err| SpeedTestError::Engine(err.to_string()))
    }

    fn socket_action(&mut self, fd: RawFd, readiness: Readiness) -> Result<u32, SpeedTestError> {
        let mut events: Events = Events::new();
        events
            .input(readiness.readable)
            .output(readiness.writable)
            .error(readiness.error);
        self.multi
            .action(fd, &events)
            .map_err(|err| SpeedTestError::Engine(err.to_string()))
    }

    fn timeout_action(&mut self) -> Result<u32, SpeedTestError> {
        self.multi
            .timeout()
            .map_err(|err| SpeedTestError::Engine(err.to_string()))
    }

    fn drain(&mut self, out: &mut Vec<Completion>) {
        self.multi.messages(|message| {
            let Some(result) = message.result() else {
                return;
            };
            match message.token() {
                Ok(token) => out.push(Completion {
                    token,
                    outcome: result.map_err(|err| err.to_string()),
                }),
                Err(err) => warn!("Finished transfer without a token: {err}"),
            }
        });
    }

    fn bytes(&self, transfer: &Self::Detached) -> u64 {
        transfer.get_ref().body.bytes()
    }

    fn target(&self, transfer: &mut Self::Detached) -> String {
        let effective: Option<String> = transfer
            .effective_url()
            .ok()
            .flatten()
            .map(str::to_string);
        effective.unwrap_or_else(|| transfer.get_ref().url.clone())
    }
}
