//! Fakes shared by the session tests.

use crate::library::{
    config::TransferPlan,
    engine::{
        Completion, Engine, EngineListener, SocketInterest, TimerRequest, TransferBody,
    },
    error::SpeedTestError,
    reactor::{Mask, Readiness},
};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io::{ErrorKind, Read, Write},
    net::{TcpListener, TcpStream},
    os::fd::{AsRawFd, RawFd},
    os::unix::net::UnixStream,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

type Listener = Box<dyn EngineListener + Send>;
pub type Journal = Rc<RefCell<Vec<&'static str>>>;

/// What a scripted transfer does once the engine gets around to it.
#[derive(Debug, Clone)]
pub struct Script {
    pub bytes: u64,
    pub outcome: Result<(), String>,
}

impl Script {
    pub fn ok(bytes: u64) -> Script {
        Script { bytes, outcome: Ok(()) }
    }

    pub fn fail(reason: &str) -> Script {
        Script {
            bytes: 0,
            outcome: Err(reason.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct ScriptedTransfer {
    pub slot: usize,
    pub bytes: u64,
}

/// Completes one transfer per timer tick, asking for a fresh tick while work remains.
pub struct ScriptedEngine {
    listener: Option<Listener>,
    scripts: Vec<Script>,
    running: Vec<usize>,
    finished: Vec<Completion>,
    reject_submit: bool,
    broken_slots: Vec<usize>,
    pub journal: Journal,
}

impl ScriptedEngine {
    pub fn new(scripts: Vec<Script>) -> ScriptedEngine {
        ScriptedEngine {
            listener: None,
            scripts,
            running: Vec::new(),
            finished: Vec::new(),
            reject_submit: false,
            broken_slots: Vec::new(),
            journal: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn uniform(n: usize, bytes: u64) -> ScriptedEngine {
        ScriptedEngine::new(vec![Script::ok(bytes); n])
    }

    pub fn rejecting(mut self) -> ScriptedEngine {
        self.reject_submit = true;
        self
    }

    pub fn misconfigure(mut self, slot: usize) -> ScriptedEngine {
        self.broken_slots.push(slot);
        self
    }

    fn tick(&self, request: TimerRequest) {
        if let Some(listener) = &self.listener {
            listener.on_timer_request(request);
        }
    }
}

impl Engine for ScriptedEngine {
    type Detached = ScriptedTransfer;
    type Active = ScriptedTransfer;

    fn attach<L>(&mut self, listener: L) -> Result<(), SpeedTestError>
    where
        L: EngineListener + Clone + Send + 'static,
    {
        self.journal.borrow_mut().push("attach");
        self.listener = Some(Box::new(listener));
        Ok(())
    }

    fn configure(
        &mut self,
        slot: usize,
        _plan: &TransferPlan,
        _body: TransferBody,
    ) -> Result<ScriptedTransfer, SpeedTestError> {
        self.journal.borrow_mut().push("configure");
        if self.broken_slots.contains(&slot) {
            return Err(SpeedTestError::Configuration {
                slot,
                reason: "scripted misconfiguration".to_string(),
            });
        }
        Ok(ScriptedTransfer { slot, bytes: 0 })
    }

    fn submit(
        &mut self,
        transfer: ScriptedTransfer,
        token: usize,
    ) -> Result<ScriptedTransfer, SpeedTestError> {
        self.journal.borrow_mut().push("submit");
        if self.reject_submit {
            return Err(SpeedTestError::Submission {
                slot: token,
                reason: "scripted rejection".to_string(),
            });
        }
        self.running.push(token);
        self.tick(TimerRequest::After(Duration::from_millis(1)));
        Ok(transfer)
    }

    fn withdraw(&mut self, mut transfer: ScriptedTransfer) -> Result<ScriptedTransfer, SpeedTestError> {
        self.journal.borrow_mut().push("withdraw");
        self.running.retain(|token| *token != transfer.slot);
        transfer.bytes = self
            .scripts
            .get(transfer.slot)
            .map(|script| script.bytes)
            .unwrap_or(0);
        Ok(transfer)
    }

    fn socket_action(&mut self, _fd: RawFd, _readiness: Readiness) -> Result<u32, SpeedTestError> {
        Ok(self.running.len() as u32)
    }

    fn timeout_action(&mut self) -> Result<u32, SpeedTestError> {
        self.journal.borrow_mut().push("timeout");
        if !self.running.is_empty() {
            let token: usize = self.running.remove(0);
            let outcome = self
                .scripts
                .get(token)
                .map(|script| script.outcome.clone())
                .unwrap_or(Ok(()));
            self.finished.push(Completion { token, outcome });
        }
        if self.running.is_empty() {
            self.tick(TimerRequest::Cancel);
        } else {
            self.tick(TimerRequest::After(Duration::from_millis(1)));
        }
        Ok(self.running.len() as u32)
    }

    fn drain(&mut self, out: &mut Vec<Completion>) {
        out.append(&mut self.finished);
    }

    fn bytes(&self, transfer: &ScriptedTransfer) -> u64 {
        transfer.bytes
    }

    fn target(&self, transfer: &mut ScriptedTransfer) -> String {
        format!("scripted://{}", transfer.slot)
    }
}

/// Never waits on the reactor. Slot 0 asks to watch a descriptor that does not exist;
/// every other slot asks for its timeout action right away.
pub struct InlineEngine {
    listener: Option<Listener>,
    bytes: u64,
    running: Vec<usize>,
    finished: Vec<Completion>,
    pub error_feeds: Rc<Cell<usize>>,
}

impl InlineEngine {
    pub const MISSING_FD: RawFd = -1;

    pub fn new(bytes: u64) -> InlineEngine {
        InlineEngine {
            listener: None,
            bytes,
            running: Vec::new(),
            finished: Vec::new(),
            error_feeds: Rc::new(Cell::new(0)),
        }
    }
}

impl Engine for InlineEngine {
    type Detached = ScriptedTransfer;
    type Active = ScriptedTransfer;

    fn attach<L>(&mut self, listener: L) -> Result<(), SpeedTestError>
    where
        L: EngineListener + Clone + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
        Ok(())
    }

    fn configure(
        &mut self,
        slot: usize,
        _plan: &TransferPlan,
        _body: TransferBody,
    ) -> Result<ScriptedTransfer, SpeedTestError> {
        Ok(ScriptedTransfer { slot, bytes: 0 })
    }

    fn submit(
        &mut self,
        transfer: ScriptedTransfer,
        token: usize,
    ) -> Result<ScriptedTransfer, SpeedTestError> {
        self.running.push(token);
        if let Some(listener) = &self.listener {
            if token == 0 {
                listener.on_socket_interest(
                    InlineEngine::MISSING_FD,
                    SocketInterest::Watch(Mask::READABLE),
                );
            } else {
                listener.on_timer_request(TimerRequest::Immediate);
            }
        }
        Ok(transfer)
    }

    fn withdraw(&mut self, mut transfer: ScriptedTransfer) -> Result<ScriptedTransfer, SpeedTestError> {
        if transfer.slot != 0 {
            transfer.bytes = self.bytes;
        }
        Ok(transfer)
    }

    fn socket_action(&mut self, fd: RawFd, readiness: Readiness) -> Result<u32, SpeedTestError> {
        if fd == InlineEngine::MISSING_FD && readiness.error && self.running.contains(&0) {
            self.error_feeds.set(self.error_feeds.get() + 1);
            self.running.retain(|token| *token != 0);
            self.finished.push(Completion {
                token: 0,
                outcome: Err("bad fd".to_string()),
            });
        }
        Ok(self.running.len() as u32)
    }

    fn timeout_action(&mut self) -> Result<u32, SpeedTestError> {
        let (done, waiting): (Vec<usize>, Vec<usize>) =
            self.running.iter().partition(|token| **token != 0);
        self.running = waiting;
        for token in done {
            self.finished.push(Completion { token, outcome: Ok(()) });
        }
        Ok(self.running.len() as u32)
    }

    fn drain(&mut self, out: &mut Vec<Completion>) {
        out.append(&mut self.finished);
    }

    fn bytes(&self, transfer: &ScriptedTransfer) -> u64 {
        transfer.bytes
    }

    fn target(&self, transfer: &mut ScriptedTransfer) -> String {
        format!("inline://{}", transfer.slot)
    }
}

/// Each transfer reads a pre-filled socket pair through real reactor readiness,
/// one small chunk per wakeup.
pub struct SocketEngine {
    listener: Option<Listener>,
    payload: usize,
    streams: HashMap<RawFd, (usize, UnixStream)>,
    received: HashMap<usize, u64>,
    finished: Vec<Completion>,
}

pub struct SocketTransfer {
    pub slot: usize,
    pub bytes: u64,
}

impl SocketEngine {
    pub fn new(payload: usize) -> SocketEngine {
        SocketEngine {
            listener: None,
            payload,
            streams: HashMap::new(),
            received: HashMap::new(),
            finished: Vec::new(),
        }
    }

    fn interest(&self, fd: RawFd, interest: SocketInterest) {
        if let Some(listener) = &self.listener {
            listener.on_socket_interest(fd, interest);
        }
    }
}

impl Engine for SocketEngine {
    type Detached = SocketTransfer;
    type Active = SocketTransfer;

    fn attach<L>(&mut self, listener: L) -> Result<(), SpeedTestError>
    where
        L: EngineListener + Clone + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
        Ok(())
    }

    fn configure(
        &mut self,
        slot: usize,
        _plan: &TransferPlan,
        _body: TransferBody,
    ) -> Result<SocketTransfer, SpeedTestError> {
        Ok(SocketTransfer { slot, bytes: 0 })
    }

    fn submit(&mut self, transfer: SocketTransfer, token: usize) -> Result<SocketTransfer, SpeedTestError> {
        let (near, mut far) = UnixStream::pair().map_err(|err| SpeedTestError::Submission {
            slot: token,
            reason: err.to_string(),
        })?;
        near.set_nonblocking(true)
            .and_then(|_| far.write_all(&vec![0xA5; self.payload]))
            .map_err(|err| SpeedTestError::Submission {
                slot: token,
                reason: err.to_string(),
            })?;
        // Hang up right away: EOF after the payload marks completion.
        drop(far);
        let fd: RawFd = near.as_raw_fd();
        self.streams.insert(fd, (token, near));
        self.interest(fd, SocketInterest::Watch(Mask::READABLE));
        Ok(transfer)
    }

    fn withdraw(&mut self, mut transfer: SocketTransfer) -> Result<SocketTransfer, SpeedTestError> {
        transfer.bytes = self.received.get(&transfer.slot).copied().unwrap_or(0);
        Ok(transfer)
    }

    fn socket_action(&mut self, fd: RawFd, readiness: Readiness) -> Result<u32, SpeedTestError> {
        let mut done: Option<(usize, Result<(), String>)> = None;
        if let Some((token, stream)) = self.streams.get_mut(&fd) {
            let mut chunk = [0u8; 1024];
            if readiness.error {
                done = Some((*token, Err("socket error".to_string())));
            } else {
                match stream.read(&mut chunk) {
                    Ok(0) => done = Some((*token, Ok(()))),
                    Ok(n) => *self.received.entry(*token).or_default() += n as u64,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => done = Some((*token, Err(err.to_string()))),
                }
            }
        }
        if let Some((token, outcome)) = done {
            self.interest(fd, SocketInterest::Remove);
            self.streams.remove(&fd);
            self.finished.push(Completion { token, outcome });
        }
        Ok(self.streams.len() as u32)
    }

    fn timeout_action(&mut self) -> Result<u32, SpeedTestError> {
        Ok(self.streams.len() as u32)
    }

    fn drain(&mut self, out: &mut Vec<Completion>) {
        out.append(&mut self.finished);
    }

    fn bytes(&self, transfer: &SocketTransfer) -> u64 {
        transfer.bytes
    }

    fn target(&self, transfer: &mut SocketTransfer) -> String {
        format!("socketpair://{}", transfer.slot)
    }
}

/// Minimal HTTP/1.1 origin on loopback: GET gets `body_size` bytes, PUT gets drained.
pub struct LoopbackServer {
    pub url: String,
    pub uploaded: Arc<AtomicU64>,
    accept: JoinHandle<()>,
}

impl LoopbackServer {
    pub fn start(connections: usize, body_size: usize) -> LoopbackServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/blob", listener.local_addr().unwrap());
        let uploaded = Arc::new(AtomicU64::new(0));
        let counter = uploaded.clone();
        let accept = thread::spawn(move || {
            let mut workers = Vec::new();
            for _ in 0..connections {
                let Ok((stream, _)) = listener.accept() else {
                    break;
                };
                let counter = counter.clone();
                workers.push(thread::spawn(move || serve(stream, body_size, &counter)));
            }
            for worker in workers {
                let _ = worker.join();
            }
        });
        LoopbackServer {
            url,
            uploaded,
            accept,
        }
    }

    pub fn join(self) -> u64 {
        let _ = self.accept.join();
        self.uploaded.load(Ordering::SeqCst)
    }
}

fn serve(mut stream: TcpStream, body_size: usize, uploaded: &AtomicU64) {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut head: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => return,
        }
    }
    let head = String::from_utf8_lossy(&head).to_ascii_lowercase();
    if head.starts_with("put") {
        let length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0);
        if head.contains("expect: 100-continue") {
            let _ = stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n");
        }
        let mut left: usize = length;
        let mut chunk = vec![0u8; 64 * 1024];
        while left > 0 {
            match stream.read(&mut chunk[..left.min(64 * 1024)]) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    left -= n;
                    uploaded.fetch_add(n as u64, Ordering::SeqCst);
                }
            }
        }
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    } else {
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {body_size}\r\nConnection: close\r\n\r\n"
        );
        let _ = stream.write_all(header.as_bytes());
        let _ = stream.write_all(&vec![0x5A; body_size]);
    }
    let _ = stream.flush();
}

/// A loopback URL nobody listens on.
pub fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/blob")
}
