//! In-process endpoint and completion doubles for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::Timeout;
use crate::error::{FabtestError, Result};
use crate::provider::{
    Caps, CompFlags, CompletionQueue, CompletionSource, Counter, CqEntry, CqErrEntry, CqRead, Endpoint, FabricInfo,
    FiAddr, Iov, MemoryRegion, MrAccess, MrDesc, Resources, RxRequest, TxOp, TxRequest,
};

type Completion = std::result::Result<CqEntry, CqErrEntry>;

#[derive(Default)]
struct MockState {
    tx_cq: VecDeque<Completion>,
    rx_cq: VecDeque<Completion>,
    posted: VecDeque<RxRequest>,
    unexpected: VecDeque<(Option<u64>, Vec<u8>)>,
    loopback: bool,
    busy_posts: usize,
    fail_post: Option<i32>,
    fail_next: Option<CqErrEntry>,
    corrupt: Option<usize>,
    registrations: Vec<MrAccess>,
    tx_posts: usize,
    last_tx_tag: Option<u64>,
    last_rx_tag: Option<u64>,
    av: Vec<Vec<u8>>,
}

fn read_iov(iov: Iov) -> Vec<u8> {
    if iov.len == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(iov.addr as *const u8, iov.len) }.to_vec()
}

fn write_at(addr: u64, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
}

impl MockState {
    fn deliver(&mut self, tag: Option<u64>, mut data: Vec<u8>) {
        if let Some(offset) = self.corrupt.take() {
            if let Some(b) = data.get_mut(offset) {
                *b ^= 0xff;
            }
        }
        match self.posted.iter().position(|r| r.tag == tag) {
            Some(index) => {
                let Some(req) = self.posted.remove(index) else { return };
                let len = data.len().min(req.iov.len);
                write_at(req.iov.addr, &data[..len]);
                let flags = if tag.is_some() { CompFlags::RECV | CompFlags::TAGGED } else { CompFlags::RECV | CompFlags::MSG };
                self.rx_cq.push_back(Ok(CqEntry { context: req.context, flags, len, data: 0, tag: tag.unwrap_or(0) }));
            }
            None => self.unexpected.push_back((tag, data)),
        }
    }

    fn complete_tx(&mut self, context: u64, flags: CompFlags, len: usize) {
        match self.fail_next.take() {
            Some(mut err) => {
                err.context = context;
                self.tx_cq.push_back(Err(err));
            }
            None => self.tx_cq.push_back(Ok(CqEntry { context, flags, len, ..Default::default() })),
        }
    }
}

pub struct MockEndpoint {
    info: FabricInfo,
    state: Rc<RefCell<MockState>>,
}

/// Test-side handle that stays valid after the endpoint moves into a session.
#[derive(Clone)]
pub struct MockControl {
    state: Rc<RefCell<MockState>>,
}

impl MockEndpoint {
    pub fn default_info(caps: Caps) -> FabricInfo {
        FabricInfo {
            provider_name: "mock".to_string(),
            fabric_name: "mock".to_string(),
            caps,
            max_msg_size: 1 << 16,
            msg_prefix_size: 16,
            inject_size: 64,
            tx_size: 64,
            rx_size: 64,
            cq_data_size: 8,
            ..Default::default()
        }
    }

    pub fn new(info: FabricInfo) -> MockEndpoint {
        MockEndpoint { info, state: Rc::new(RefCell::new(MockState::default())) }
    }

    /// Sends are delivered to this endpoint's own posted receives.
    pub fn loopback(info: FabricInfo) -> MockEndpoint {
        let ep = MockEndpoint::new(info);
        ep.state.borrow_mut().loopback = true;
        ep
    }

    pub fn control(&self) -> MockControl {
        MockControl { state: self.state.clone() }
    }

    pub fn registrations(&self) -> Vec<MrAccess> {
        self.state.borrow().registrations.clone()
    }

    pub fn into_resources(self) -> Resources {
        let tx = CompletionSource::Queue(Box::new(MockQueue { state: self.state.clone(), tx: true }));
        let rx = CompletionSource::Queue(Box::new(MockQueue { state: self.state.clone(), tx: false }));
        Resources { endpoint: Box::new(self), tx, rx }
    }
}

impl MockControl {
    pub fn set_busy_posts(&self, n: usize) {
        self.state.borrow_mut().busy_posts = n;
    }

    pub fn set_fail_post(&self, code: Option<i32>) {
        self.state.borrow_mut().fail_post = code;
    }

    pub fn fail_next_completion(&self, err: CqErrEntry) {
        self.state.borrow_mut().fail_next = Some(err);
    }

    /// Flips the byte at `offset` of the next delivered message.
    pub fn corrupt_next(&self, offset: usize) {
        self.state.borrow_mut().corrupt = Some(offset);
    }

    pub fn tx_posts(&self) -> usize {
        self.state.borrow().tx_posts
    }

    pub fn posted_receives(&self) -> usize {
        self.state.borrow().posted.len()
    }

    pub fn tx_queue_len(&self) -> usize {
        self.state.borrow().tx_cq.len()
    }

    pub fn last_tx_tag(&self) -> Option<u64> {
        self.state.borrow().last_tx_tag
    }

    pub fn last_rx_tag(&self) -> Option<u64> {
        self.state.borrow().last_rx_tag
    }
}

struct MockRegion {
    key: u64,
}

impl MemoryRegion for MockRegion {
    fn key(&self) -> u64 {
        self.key
    }

    fn desc(&self) -> MrDesc {
        MrDesc(Some(self.key))
    }
}

impl Endpoint for MockEndpoint {
    fn info(&self) -> &FabricInfo {
        &self.info
    }

    fn name(&self) -> Result<Vec<u8>> {
        Ok(b"mock".to_vec())
    }

    fn av_insert(&mut self, addr: &[u8]) -> Result<FiAddr> {
        let mut state = self.state.borrow_mut();
        state.av.push(addr.to_vec());
        Ok(FiAddr(state.av.len() as u64 - 1))
    }

    fn register(&mut self, _iov: Iov, access: MrAccess, requested_key: u64) -> Result<Box<dyn MemoryRegion>> {
        self.state.borrow_mut().registrations.push(access);
        Ok(Box::new(MockRegion { key: requested_key }))
    }

    fn post_tx(&mut self, req: TxRequest) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.busy_posts > 0 {
            state.busy_posts -= 1;
            return Err(FabtestError::TransientBusy);
        }
        if let Some(code) = state.fail_post {
            return Err(FabtestError::PostFailed { op: req.op.name(), code });
        }
        state.tx_posts += 1;
        state.last_tx_tag = req.tag;
        let loopback = state.loopback;
        match req.op {
            TxOp::Send | TxOp::Inject => {
                if loopback {
                    state.deliver(req.tag, read_iov(req.iov));
                }
                if !req.op.is_inject() {
                    state.complete_tx(req.context, CompFlags::SEND | CompFlags::MSG, req.iov.len);
                }
            }
            TxOp::Write(remote) | TxOp::InjectWrite(remote) => {
                if loopback {
                    write_at(remote.addr, &read_iov(req.iov));
                }
                if !req.op.is_inject() {
                    state.complete_tx(req.context, CompFlags::RMA | CompFlags::WRITE, req.iov.len);
                }
            }
            TxOp::WriteData(remote, data) | TxOp::InjectWriteData(remote, data) => {
                if loopback {
                    write_at(remote.addr, &read_iov(req.iov));
                    if let Some(rx) = state.posted.pop_front() {
                        state.rx_cq.push_back(Ok(CqEntry {
                            context: rx.context,
                            flags: CompFlags::RMA | CompFlags::REMOTE_WRITE | CompFlags::REMOTE_CQ_DATA,
                            len: 0,
                            data,
                            tag: 0,
                        }));
                    }
                }
                if !req.op.is_inject() {
                    state.complete_tx(req.context, CompFlags::RMA | CompFlags::WRITE, req.iov.len);
                }
            }
            TxOp::Read(remote) => {
                if loopback {
                    let data = read_iov(Iov { addr: remote.addr, len: req.iov.len });
                    write_at(req.iov.addr, &data);
                }
                state.complete_tx(req.context, CompFlags::RMA | CompFlags::READ, req.iov.len);
            }
        }
        Ok(())
    }

    fn post_rx(&mut self, req: RxRequest) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.busy_posts > 0 {
            state.busy_posts -= 1;
            return Err(FabtestError::TransientBusy);
        }
        state.last_rx_tag = req.tag;
        state.posted.push_back(req);
        if let Some(index) = state.unexpected.iter().position(|(tag, _)| *tag == req.tag) {
            if let Some((tag, data)) = state.unexpected.remove(index) {
                state.deliver(tag, data);
            }
        }
        Ok(())
    }
}

struct MockQueue {
    state: Rc<RefCell<MockState>>,
    tx: bool,
}

impl MockQueue {
    fn with_queue<T>(&self, f: impl FnOnce(&mut VecDeque<Completion>) -> T) -> T {
        let mut state = self.state.borrow_mut();
        if self.tx { f(&mut state.tx_cq) } else { f(&mut state.rx_cq) }
    }
}

impl CompletionQueue for MockQueue {
    fn read(&mut self) -> Result<CqRead> {
        Ok(self.with_queue(|q| match q.front() {
            None => CqRead::Empty,
            Some(Err(_)) => CqRead::ErrorAvailable,
            Some(Ok(_)) => match q.pop_front() {
                Some(Ok(entry)) => CqRead::Entry(entry),
                _ => CqRead::Empty,
            },
        }))
    }

    fn sread(&mut self, _timeout: Timeout) -> Result<CqRead> {
        self.read()
    }

    fn readerr(&mut self) -> Result<CqErrEntry> {
        self.with_queue(|q| match q.pop_front() {
            Some(Err(entry)) => Ok(entry),
            _ => Err(FabtestError::NoData("no error entry".to_string())),
        })
    }

    fn trywait(&mut self) -> Result<bool> {
        Ok(self.with_queue(|q| q.is_empty()))
    }

    fn wait_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Completion queue replaying events at fixed offsets from its creation.
/// `Some(err)` entries surface as error completions.
pub struct ScriptedQueue {
    start: Instant,
    events: VecDeque<(Duration, Option<CqErrEntry>)>,
    delivered: u64,
    // Never written; poll on it only ever times out.
    wait: (UnixStream, UnixStream),
}

impl ScriptedQueue {
    pub fn new(events: Vec<(Duration, Option<CqErrEntry>)>) -> ScriptedQueue {
        let wait = UnixStream::pair().expect("socketpair");
        ScriptedQueue { start: Instant::now(), events: events.into(), delivered: 0, wait }
    }

    fn due(&self) -> bool {
        self.events.front().is_some_and(|(at, _)| *at <= self.start.elapsed())
    }
}

impl CompletionQueue for ScriptedQueue {
    fn read(&mut self) -> Result<CqRead> {
        if !self.due() {
            return Ok(CqRead::Empty);
        }
        if matches!(self.events.front(), Some((_, Some(_)))) {
            return Ok(CqRead::ErrorAvailable);
        }
        self.events.pop_front();
        self.delivered += 1;
        Ok(CqRead::Entry(CqEntry { context: self.delivered, flags: CompFlags::SEND, ..Default::default() }))
    }

    fn sread(&mut self, timeout: Timeout) -> Result<CqRead> {
        let started = Instant::now();
        loop {
            let read = self.read()?;
            if read != CqRead::Empty {
                return Ok(read);
            }
            if timeout.0.is_some_and(|d| started.elapsed() >= d) {
                return Ok(CqRead::Empty);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn readerr(&mut self) -> Result<CqErrEntry> {
        match self.events.pop_front() {
            Some((_, Some(err))) => Ok(err),
            _ => Err(FabtestError::NoData("no error entry".to_string())),
        }
    }

    fn trywait(&mut self) -> Result<bool> {
        Ok(self.events.is_empty())
    }

    fn wait_fd(&self) -> Option<RawFd> {
        Some(self.wait.0.as_raw_fd())
    }
}

/// Counter whose value is the number of scripted offsets already elapsed.
pub struct ScriptedCounter {
    start: Instant,
    events: Vec<Duration>,
    failures: Vec<Duration>,
}

impl ScriptedCounter {
    pub fn new(events: Vec<Duration>) -> ScriptedCounter {
        ScriptedCounter { start: Instant::now(), events, failures: Vec::new() }
    }

    /// Error events, timed from creation like the successes.
    pub fn with_failures(mut self, failures: Vec<Duration>) -> ScriptedCounter {
        self.failures = failures;
        self
    }

    fn elapsed_count(&self, at: &[Duration]) -> u64 {
        let now = self.start.elapsed();
        at.iter().filter(|t| **t <= now).count() as u64
    }
}

impl Counter for ScriptedCounter {
    fn read(&mut self) -> Result<u64> {
        Ok(self.elapsed_count(&self.events))
    }

    fn read_err(&mut self) -> Result<u64> {
        Ok(self.elapsed_count(&self.failures))
    }

    fn wait(&mut self, threshold: u64, timeout: Timeout) -> Result<()> {
        let started = Instant::now();
        let errors = self.elapsed_count(&self.failures);
        loop {
            if self.read()? >= threshold {
                return Ok(());
            }
            if self.read_err()? > errors {
                return Err(FabtestError::Completion(CqErrEntry { err: libc::EIO, ..Default::default() }));
            }
            if timeout.0.is_some_and(|d| started.elapsed() >= d) {
                return Err(FabtestError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
