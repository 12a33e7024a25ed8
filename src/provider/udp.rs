//! Software provider over a single non-blocking UDP socket.
//!
//! Every peer gets a go-back-N link with cumulative acks, so messages and
//! RMA operations arrive in order and exactly once. Progress is driven by
//! the caller: reading a queue or counter, posting, or waiting all pump the
//! socket and retransmit stale frames.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::{Timeout, DEFAULT_DATA_PORT};
use crate::error::{FabtestError, Result};
use crate::provider::{
    poll_fd, AvType, Caps, CompFlags, CompletionKind, CompletionQueue, CompletionSource, Counter, CqEntry, CqErrEntry,
    CqRead, EpType, FabricInfo, FiAddr, Hints, InfoFlags, Iov, MemoryRegion, Mode, MrAccess, MrDesc, MrMode, OpFlags,
    Provider, ResourceRequest, Resources, RxRequest, TxOp, TxRequest, WaitObj,
};

pub const PROVIDER_NAME: &str = "udp";
pub const MAX_MSG_SIZE: usize = 60 * 1024;
const PREFIX_SIZE: usize = 16;
const INJECT_SIZE: usize = 64;
const QUEUE_SIZE: usize = 256;
const WINDOW: usize = 64;
const MAX_UNEXPECTED: usize = 1024;
const CQ_DATA_SIZE: usize = 8;
const RTO: Duration = Duration::from_millis(20);
const LINGER: Duration = Duration::from_millis(200);
const SOCKET_BUFFER: libc::c_int = 4 << 20;
const DATAGRAM_MAX: usize = 65507;

/// Wire form of a socket address, as carried in `src_addr`/`dest_addr` and
/// in the address exchange.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct UdpAddressHandle {
    ipv6_address: [u8; 16],
    ipv4_address: [u8; 4],
    family: u8,
    port: u16,
}

impl UdpAddressHandle {
    pub fn encode(addr: SocketAddr) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&UdpAddressHandle::from(addr))?)
    }

    pub fn decode(raw: &[u8]) -> Result<SocketAddr> {
        let handle: UdpAddressHandle = bincode::deserialize(raw)
            .map_err(|e| FabtestError::setup(format!("malformed udp address: {}", e), -libc::EINVAL))?;
        Ok(handle.socket_addr())
    }

    fn socket_addr(&self) -> SocketAddr {
        match self.family {
            6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(self.ipv6_address)), self.port),
            _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::from(self.ipv4_address)), self.port),
        }
    }
}

impl From<SocketAddr> for UdpAddressHandle {
    fn from(addr: SocketAddr) -> Self {
        let mut handle = UdpAddressHandle { port: addr.port(), ..Default::default() };
        match addr.ip() {
            IpAddr::V4(ip) => {
                handle.family = 4;
                handle.ipv4_address = ip.octets();
            }
            IpAddr::V6(ip) => {
                handle.family = 6;
                handle.ipv6_address = ip.octets();
            }
        }
        handle
    }
}

#[derive(Serialize, Deserialize, Debug)]
enum Frame {
    Data { seq: u64, body: Body },
    Ack { next: u64 },
}

#[derive(Serialize, Deserialize, Debug)]
enum Body {
    Msg { tag: Option<u64>, data: Vec<u8> },
    Write { addr: u64, key: u64, data: Vec<u8>, cq_data: Option<u64> },
    ReadReq { id: u64, addr: u64, key: u64, len: u64 },
    ReadResp { id: u64, status: i32, data: Vec<u8> },
}

type Completion = std::result::Result<CqEntry, CqErrEntry>;

struct InFlight {
    seq: u64,
    frame: Vec<u8>,
    on_ack: Option<CqEntry>,
}

#[derive(Default)]
struct Link {
    next_seq: u64,
    expected: u64,
    unacked: VecDeque<InFlight>,
    sent_at: Option<Instant>,
}

#[derive(Default)]
struct CounterState {
    value: u64,
    errors: u64,
}

/// Where completions of one direction land.
struct Sink {
    cq: Option<VecDeque<Completion>>,
    cntr: Option<CounterState>,
}

impl Sink {
    fn new(kind: Option<CompletionKind>) -> Sink {
        match kind {
            Some(CompletionKind::Queue) => Sink { cq: Some(VecDeque::new()), cntr: None },
            Some(CompletionKind::Counter) => Sink { cq: None, cntr: Some(CounterState::default()) },
            None => Sink { cq: None, cntr: None },
        }
    }

    fn push(&mut self, completion: Completion) {
        if let Some(cntr) = self.cntr.as_mut() {
            match completion {
                Ok(_) => cntr.value += 1,
                Err(_) => cntr.errors += 1,
            }
            return;
        }
        if let Some(cq) = self.cq.as_mut() {
            cq.push_back(completion);
        }
    }

    /// Inject: counted, never queued.
    fn count(&mut self) {
        if let Some(cntr) = self.cntr.as_mut() {
            cntr.value += 1;
        }
    }

    fn peek(&mut self) -> CqRead {
        let Some(cq) = self.cq.as_mut() else {
            return CqRead::Empty;
        };
        match cq.front() {
            None => CqRead::Empty,
            Some(Err(_)) => CqRead::ErrorAvailable,
            Some(Ok(_)) => match cq.pop_front() {
                Some(Ok(entry)) => CqRead::Entry(entry),
                _ => CqRead::Empty,
            },
        }
    }

    fn is_empty(&self) -> bool {
        self.cq.as_ref().map_or(true, |cq| cq.is_empty())
    }
}

struct PostedRecv {
    iov: Iov,
    context: u64,
    tag: Option<u64>,
}

enum Arrival {
    Msg { tag: Option<u64>, data: Vec<u8> },
    CqData(u64),
}

struct Region {
    addr: u64,
    len: usize,
    access: MrAccess,
}

struct PendingRead {
    iov: Iov,
    context: u64,
}

struct Core {
    socket: UdpSocket,
    info: FabricInfo,
    scratch: Vec<u8>,
    av: Vec<SocketAddr>,
    links: HashMap<SocketAddr, Link>,
    regions: HashMap<u64, Region>,
    next_key: u64,
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Arrival>,
    reads: HashMap<u64, PendingRead>,
    next_read: u64,
    tx: Sink,
    rx: Sink,
}

fn copy_out(iov: Iov) -> Vec<u8> {
    if iov.len == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(iov.addr as *const u8, iov.len) }.to_vec()
}

fn copy_in(addr: u64, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
}

fn remaining(start: Instant, timeout: Timeout) -> Option<Duration> {
    timeout.0.map(|t| t.saturating_sub(start.elapsed()))
}

impl Core {
    fn new(socket: UdpSocket, info: FabricInfo, req: &ResourceRequest) -> Core {
        Core {
            socket,
            info,
            scratch: vec![0u8; DATAGRAM_MAX],
            av: Vec::new(),
            links: HashMap::new(),
            regions: HashMap::new(),
            next_key: rand::random::<u32>() as u64 | 1,
            posted: VecDeque::new(),
            unexpected: VecDeque::new(),
            reads: HashMap::new(),
            next_read: 0,
            tx: Sink::new(req.tx),
            rx: Sink::new(req.rx),
        }
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn has_unacked(&self) -> bool {
        self.links.values().any(|l| !l.unacked.is_empty())
    }

    fn progress(&mut self) -> Result<()> {
        loop {
            let (n, src) = match self.socket.recv_from(&mut self.scratch) {
                Ok(r) => r,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(e.into()),
            };
            let frame: Frame = match bincode::deserialize(&self.scratch[..n]) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("dropping malformed frame from {}: {}", src, e);
                    continue;
                }
            };
            self.handle(src, frame)?;
        }
        self.retransmit();
        Ok(())
    }

    fn handle(&mut self, src: SocketAddr, frame: Frame) -> Result<()> {
        match frame {
            Frame::Ack { next } => self.acked(src, next),
            Frame::Data { seq, body } => {
                let expected = self.links.entry(src).or_default().expected;
                if seq == expected && self.accept(src, body)? {
                    if let Some(link) = self.links.get_mut(&src) {
                        link.expected += 1;
                    }
                }
                let next = self.links.get(&src).map_or(0, |l| l.expected);
                self.send_frame(src, &Frame::Ack { next });
            }
        }
        Ok(())
    }

    fn acked(&mut self, src: SocketAddr, next: u64) {
        let Some(link) = self.links.get_mut(&src) else {
            return;
        };
        let mut done = Vec::new();
        while link.unacked.front().map_or(false, |f| f.seq < next) {
            if let Some(InFlight { on_ack: Some(entry), .. }) = link.unacked.pop_front() {
                done.push(entry);
            }
        }
        link.sent_at = if link.unacked.is_empty() { None } else { Some(Instant::now()) };
        for entry in done {
            self.tx.push(Ok(entry));
        }
    }

    fn retransmit(&mut self) {
        for (addr, link) in self.links.iter_mut() {
            let stale = link.sent_at.map_or(false, |t| t.elapsed() >= RTO);
            if !stale {
                continue;
            }
            log::trace!("retransmitting {} frames to {}", link.unacked.len(), addr);
            for frame in &link.unacked {
                if let Err(e) = self.socket.send_to(&frame.frame, addr) {
                    log::trace!("retransmit to {}: {}", addr, e);
                    break;
                }
            }
            link.sent_at = Some(Instant::now());
        }
    }

    fn send_frame(&self, dest: SocketAddr, frame: &Frame) {
        match bincode::serialize(frame) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, dest) {
                    log::trace!("send to {}: {}", dest, e);
                }
            }
            Err(e) => log::warn!("encoding frame: {}", e),
        }
    }

    /// Returns false when the body cannot be taken yet; the sender retransmits.
    fn accept(&mut self, src: SocketAddr, body: Body) -> Result<bool> {
        match body {
            Body::Msg { tag, data } => Ok(self.deliver(Arrival::Msg { tag, data })),
            Body::Write { addr, key, data, cq_data } => {
                match self.resolve(addr, key, data.len(), MrAccess::REMOTE_WRITE) {
                    Ok(target) => copy_in(target, &data),
                    Err(errno) => {
                        log::warn!("rejecting remote write from {} key {:#x}: errno {}", src, key, errno);
                        return Ok(true);
                    }
                }
                match cq_data {
                    Some(value) => Ok(self.deliver(Arrival::CqData(value))),
                    None => Ok(true),
                }
            }
            Body::ReadReq { id, addr, key, len } => {
                let len = len as usize;
                let (status, data) = match self.resolve(addr, key, len, MrAccess::REMOTE_READ) {
                    Ok(source) => (0, copy_out(Iov { addr: source, len })),
                    Err(errno) => (errno, Vec::new()),
                };
                match self.enqueue(src, Body::ReadResp { id, status, data }, None) {
                    Ok(()) => Ok(true),
                    Err(FabtestError::TransientBusy) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Body::ReadResp { id, status, data } => {
                if let Some(read) = self.reads.remove(&id) {
                    let flags = CompFlags::RMA | CompFlags::READ;
                    if status == 0 {
                        let n = data.len().min(read.iov.len);
                        copy_in(read.iov.addr, &data[..n]);
                        self.tx.push(Ok(CqEntry { context: read.context, flags, len: n, ..Default::default() }));
                    } else {
                        self.tx.push(Err(CqErrEntry {
                            context: read.context,
                            flags,
                            err: status,
                            prov_errno: status,
                            message: "remote read rejected".to_string(),
                            ..Default::default()
                        }));
                    }
                }
                Ok(true)
            }
        }
    }

    fn resolve(&self, addr: u64, key: u64, len: usize, access: MrAccess) -> std::result::Result<u64, i32> {
        let region = self.regions.get(&key).ok_or(libc::EACCES)?;
        if !region.access.contains(access) {
            return Err(libc::EACCES);
        }
        let target = match self.info.mr_mode {
            MrMode::Scalable => region.addr.checked_add(addr).ok_or(libc::EINVAL)?,
            MrMode::Basic => addr,
        };
        let end = target.checked_add(len as u64).ok_or(libc::EINVAL)?;
        if target < region.addr || end > region.addr + region.len as u64 {
            return Err(libc::EINVAL);
        }
        Ok(target)
    }

    /// Matches an arrival against posted receives or parks it.
    fn deliver(&mut self, arrival: Arrival) -> bool {
        let pos = self.posted.iter().position(|p| match &arrival {
            Arrival::Msg { tag, .. } => p.tag == *tag,
            Arrival::CqData(_) => true,
        });
        match pos.and_then(|i| self.posted.remove(i)) {
            Some(recv) => {
                self.complete_receive(recv, arrival);
                true
            }
            None if self.unexpected.len() < MAX_UNEXPECTED => {
                self.unexpected.push_back(arrival);
                true
            }
            None => false,
        }
    }

    fn complete_receive(&mut self, recv: PostedRecv, arrival: Arrival) {
        match arrival {
            Arrival::Msg { tag, data } => {
                let prefix = self.info.rx_prefix_size();
                let capacity = recv.iov.len.saturating_sub(prefix);
                let n = data.len().min(capacity);
                copy_in(recv.iov.addr + prefix as u64, &data[..n]);
                let mut flags = CompFlags::RECV | CompFlags::MSG;
                if tag.is_some() {
                    flags |= CompFlags::TAGGED;
                }
                if data.len() > capacity {
                    self.rx.push(Err(CqErrEntry {
                        context: recv.context,
                        flags,
                        len: n + prefix,
                        err: libc::EMSGSIZE,
                        prov_errno: libc::EMSGSIZE,
                        message: format!("message of {} bytes truncated to {}", data.len(), capacity),
                    }));
                } else {
                    self.rx.push(Ok(CqEntry {
                        context: recv.context,
                        flags,
                        len: n + prefix,
                        data: 0,
                        tag: tag.unwrap_or(0),
                    }));
                }
            }
            Arrival::CqData(value) => {
                self.rx.push(Ok(CqEntry {
                    context: recv.context,
                    flags: CompFlags::RMA | CompFlags::REMOTE_WRITE | CompFlags::REMOTE_CQ_DATA,
                    len: 0,
                    data: value,
                    tag: 0,
                }));
            }
        }
    }

    fn enqueue(&mut self, dest: SocketAddr, body: Body, on_ack: Option<CqEntry>) -> Result<()> {
        let link = self.links.entry(dest).or_default();
        if link.unacked.len() >= WINDOW {
            return Err(FabtestError::TransientBusy);
        }
        let seq = link.next_seq;
        let frame = bincode::serialize(&Frame::Data { seq, body })?;
        if frame.len() > DATAGRAM_MAX {
            return Err(FabtestError::PostFailed { op: "udp send", code: -libc::EMSGSIZE });
        }
        link.next_seq += 1;
        if let Err(e) = self.socket.send_to(&frame, dest) {
            log::trace!("send to {}: {}", dest, e);
        }
        if link.unacked.is_empty() {
            link.sent_at = Some(Instant::now());
        }
        link.unacked.push_back(InFlight { seq, frame, on_ack });
        Ok(())
    }

    fn window_full(&self, dest: SocketAddr) -> bool {
        self.links.get(&dest).map_or(false, |l| l.unacked.len() >= WINDOW)
    }

    fn post_tx(&mut self, req: TxRequest) -> Result<()> {
        let op = req.op.name();
        let dest = *self
            .av
            .get(req.dest.0 as usize)
            .ok_or(FabtestError::PostFailed { op, code: -libc::EINVAL })?;
        if self.window_full(dest) {
            self.progress()?;
            if self.window_full(dest) {
                return Err(FabtestError::TransientBusy);
            }
        }
        if req.op.is_inject() && req.iov.len > self.info.inject_size {
            return Err(FabtestError::PostFailed { op, code: -libc::EMSGSIZE });
        }
        let transmit_complete = req.flags.contains(OpFlags::TRANSMIT_COMPLETE);
        let (body, flags, len) = match req.op {
            TxOp::Send | TxOp::Inject => {
                let prefix = self.info.tx_prefix_size();
                let payload = Iov { addr: req.iov.addr + prefix as u64, len: req.iov.len.saturating_sub(prefix) };
                if payload.len > self.info.max_msg_size {
                    return Err(FabtestError::PostFailed { op, code: -libc::EMSGSIZE });
                }
                let mut flags = CompFlags::SEND | CompFlags::MSG;
                if req.tag.is_some() {
                    flags |= CompFlags::TAGGED;
                }
                (Body::Msg { tag: req.tag, data: copy_out(payload) }, flags, req.iov.len)
            }
            TxOp::Write(rma) | TxOp::InjectWrite(rma) => (
                Body::Write { addr: rma.addr, key: rma.key, data: copy_out(req.iov), cq_data: None },
                CompFlags::RMA | CompFlags::WRITE,
                req.iov.len,
            ),
            TxOp::WriteData(rma, data) | TxOp::InjectWriteData(rma, data) => (
                Body::Write { addr: rma.addr, key: rma.key, data: copy_out(req.iov), cq_data: Some(data) },
                CompFlags::RMA | CompFlags::WRITE,
                req.iov.len,
            ),
            TxOp::Read(rma) => {
                let id = self.next_read;
                let body = Body::ReadReq { id, addr: rma.addr, key: rma.key, len: req.iov.len as u64 };
                self.enqueue(dest, body, None)?;
                self.next_read += 1;
                self.reads.insert(id, PendingRead { iov: req.iov, context: req.context });
                return Ok(());
            }
        };
        let entry = CqEntry { context: req.context, flags, len, data: 0, tag: req.tag.unwrap_or(0) };
        let is_write = matches!(req.op, TxOp::Write(_) | TxOp::WriteData(..));
        if req.op.is_inject() {
            let on_ack = if transmit_complete { Some(entry) } else { None };
            self.enqueue(dest, body, on_ack)?;
            if !transmit_complete {
                self.tx.count();
            }
        } else if transmit_complete || is_write {
            self.enqueue(dest, body, Some(entry))?;
        } else {
            self.enqueue(dest, body, None)?;
            self.tx.push(Ok(entry));
        }
        Ok(())
    }

    fn post_rx(&mut self, req: RxRequest) -> Result<()> {
        let recv = PostedRecv { iov: req.iov, context: req.context, tag: req.tag };
        let pos = self.unexpected.iter().position(|a| match a {
            Arrival::Msg { tag, .. } => *tag == recv.tag,
            Arrival::CqData(_) => true,
        });
        if let Some(arrival) = pos.and_then(|i| self.unexpected.remove(i)) {
            self.complete_receive(recv, arrival);
            return Ok(());
        }
        if self.posted.len() >= self.info.rx_size {
            return Err(FabtestError::TransientBusy);
        }
        self.posted.push_back(recv);
        Ok(())
    }

    /// Progress until readable or `wait` passes.
    fn idle(&mut self, wait: Duration) -> Result<()> {
        let wait = wait.min(RTO);
        poll_fd(self.fd(), Timeout(Some(wait)))?;
        Ok(())
    }
}

pub struct UdpEndpoint {
    core: Rc<RefCell<Core>>,
    info: FabricInfo,
}

impl crate::provider::Endpoint for UdpEndpoint {
    fn info(&self) -> &FabricInfo {
        &self.info
    }

    fn name(&self) -> Result<Vec<u8>> {
        let local = self.core.borrow().socket.local_addr()?;
        UdpAddressHandle::encode(local)
    }

    fn av_insert(&mut self, addr: &[u8]) -> Result<FiAddr> {
        let peer = UdpAddressHandle::decode(addr)?;
        let mut core = self.core.borrow_mut();
        if let Some(i) = core.av.iter().position(|a| *a == peer) {
            return Ok(FiAddr(i as u64));
        }
        core.av.push(peer);
        log::debug!("udp av: {} -> {}", core.av.len() - 1, peer);
        Ok(FiAddr((core.av.len() - 1) as u64))
    }

    fn register(&mut self, iov: Iov, access: MrAccess, requested_key: u64) -> Result<Box<dyn MemoryRegion>> {
        let mut core = self.core.borrow_mut();
        let key = match core.info.mr_mode {
            MrMode::Scalable => requested_key,
            MrMode::Basic => {
                let key = core.next_key;
                core.next_key += 1;
                key
            }
        };
        if core.regions.contains_key(&key) {
            return Err(FabtestError::Registration { code: -libc::EEXIST });
        }
        core.regions.insert(key, Region { addr: iov.addr, len: iov.len, access });
        Ok(Box::new(UdpRegion { core: self.core.clone(), key }))
    }

    fn post_tx(&mut self, req: TxRequest) -> Result<()> {
        self.core.borrow_mut().post_tx(req)
    }

    fn post_rx(&mut self, req: RxRequest) -> Result<()> {
        self.core.borrow_mut().post_rx(req)
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        let Ok(mut core) = self.core.try_borrow_mut() else {
            return;
        };
        let deadline = Instant::now() + LINGER;
        while core.has_unacked() && Instant::now() < deadline {
            if core.progress().is_err() || core.idle(Duration::from_millis(5)).is_err() {
                break;
            }
        }
        core.posted.clear();
        core.reads.clear();
    }
}

pub struct UdpRegion {
    core: Rc<RefCell<Core>>,
    key: u64,
}

impl MemoryRegion for UdpRegion {
    fn key(&self) -> u64 {
        self.key
    }

    fn desc(&self) -> MrDesc {
        MrDesc(Some(self.key))
    }
}

impl Drop for UdpRegion {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            core.regions.remove(&self.key);
        }
    }
}

pub struct UdpQueue {
    core: Rc<RefCell<Core>>,
    rx: bool,
}

impl UdpQueue {
    fn with_sink<T>(&self, f: impl FnOnce(&mut Sink) -> T) -> T {
        let mut core = self.core.borrow_mut();
        if self.rx { f(&mut core.rx) } else { f(&mut core.tx) }
    }
}

impl CompletionQueue for UdpQueue {
    fn read(&mut self) -> Result<CqRead> {
        self.core.borrow_mut().progress()?;
        Ok(self.with_sink(|s| s.peek()))
    }

    fn sread(&mut self, timeout: Timeout) -> Result<CqRead> {
        let start = Instant::now();
        loop {
            let read = self.read()?;
            if read != CqRead::Empty {
                return Ok(read);
            }
            let wait = match remaining(start, timeout) {
                Some(left) if left.is_zero() => return Ok(CqRead::Empty),
                Some(left) => left,
                None => RTO,
            };
            self.core.borrow_mut().idle(wait)?;
        }
    }

    fn readerr(&mut self) -> Result<CqErrEntry> {
        self.with_sink(|s| match s.cq.as_mut().and_then(|cq| cq.pop_front()) {
            Some(Err(entry)) => Ok(entry),
            Some(Ok(entry)) => {
                if let Some(cq) = s.cq.as_mut() {
                    cq.push_front(Ok(entry));
                }
                Err(FabtestError::NoData("no error entry at the head of the queue".to_string()))
            }
            None => Err(FabtestError::NoData("completion queue is empty".to_string())),
        })
    }

    /// Blocking on the socket is only safe once nothing needs retransmitting.
    fn trywait(&mut self) -> Result<bool> {
        let mut core = self.core.borrow_mut();
        core.progress()?;
        let sink = if self.rx { &core.rx } else { &core.tx };
        Ok(sink.is_empty() && !core.has_unacked())
    }

    fn wait_fd(&self) -> Option<RawFd> {
        Some(self.core.borrow().fd())
    }
}

pub struct UdpCounter {
    core: Rc<RefCell<Core>>,
    rx: bool,
}

impl UdpCounter {
    fn values(&self) -> (u64, u64) {
        let core = self.core.borrow();
        let sink = if self.rx { &core.rx } else { &core.tx };
        sink.cntr.as_ref().map_or((0, 0), |c| (c.value, c.errors))
    }
}

impl Counter for UdpCounter {
    fn read(&mut self) -> Result<u64> {
        self.core.borrow_mut().progress()?;
        Ok(self.values().0)
    }

    fn read_err(&mut self) -> Result<u64> {
        self.core.borrow_mut().progress()?;
        Ok(self.values().1)
    }

    fn wait(&mut self, threshold: u64, timeout: Timeout) -> Result<()> {
        let start = Instant::now();
        let mut errors = self.values().1;
        loop {
            self.core.borrow_mut().progress()?;
            let (value, err) = self.values();
            if value >= threshold {
                return Ok(());
            }
            if err > errors {
                return Err(FabtestError::Completion(CqErrEntry {
                    err: libc::EIO,
                    message: "counter error".to_string(),
                    ..Default::default()
                }));
            }
            errors = err;
            let wait = match remaining(start, timeout) {
                Some(left) if left.is_zero() => return Err(FabtestError::Timeout),
                Some(left) => left,
                None => RTO,
            };
            self.core.borrow_mut().idle(wait)?;
        }
    }
}

/// The always-available software provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpProvider;

impl UdpProvider {
    const CAPS: Caps = Caps::MSG
        .union(Caps::TAGGED)
        .union(Caps::RMA)
        .union(Caps::READ)
        .union(Caps::WRITE)
        .union(Caps::RECV)
        .union(Caps::SEND)
        .union(Caps::REMOTE_READ)
        .union(Caps::REMOTE_WRITE);
}

fn resolve(node: &str, service: &str) -> Result<SocketAddr> {
    let port: u16 = service
        .parse()
        .map_err(|_| FabtestError::Config(format!("service {:?} is not a port number", service)))?;
    let mut addrs: Vec<SocketAddr> = (node, port)
        .to_socket_addrs()
        .map_err(|e| FabtestError::setup(format!("resolving {}:{}: {}", node, port, e), -libc::ENODATA))?
        .collect();
    addrs.sort_by_key(|a| !a.is_ipv4());
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| FabtestError::setup(format!("{} has no addresses", node), -libc::ENODATA))
}

/// Local address the kernel would route `dest` from.
fn route_source(dest: SocketAddr) -> Result<IpAddr> {
    let any: SocketAddr = match dest {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let probe = UdpSocket::bind(any)?;
    probe.connect(dest)?;
    Ok(probe.local_addr()?.ip())
}

fn set_buffer_sizes(socket: &UdpSocket) {
    for opt in [libc::SO_RCVBUF, libc::SO_SNDBUF] {
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                opt,
                &SOCKET_BUFFER as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            log::warn!("setsockopt {}: {}", opt, std::io::Error::last_os_error());
        }
    }
}

impl Provider for UdpProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn getinfo(&self, node: Option<&str>, service: Option<&str>, flags: InfoFlags, hints: &Hints) -> Result<Vec<FabricInfo>> {
        if !UdpProvider::CAPS.contains(hints.caps) {
            return Ok(Vec::new());
        }
        match hints.ep_type {
            EpType::Msg => return Ok(Vec::new()),
            EpType::Dgram if hints.caps.contains(Caps::RMA) => return Ok(Vec::new()),
            _ => {}
        }
        if hints.fabric_name.as_deref().map_or(false, |f| !f.is_empty() && f != PROVIDER_NAME) {
            return Ok(Vec::new());
        }
        let (src_addr, dest_addr) = if flags.contains(InfoFlags::SOURCE) {
            let addr = resolve(node.unwrap_or("0.0.0.0"), service.unwrap_or(DEFAULT_DATA_PORT))?;
            (Some(UdpAddressHandle::encode(addr)?), None)
        } else if let Some(node) = node {
            let addr = resolve(node, service.unwrap_or(DEFAULT_DATA_PORT))?;
            (None, Some(UdpAddressHandle::encode(addr)?))
        } else {
            (None, None)
        };
        let caps = if hints.caps.is_empty() { UdpProvider::CAPS } else { hints.caps };
        Ok(vec![FabricInfo {
            provider_name: PROVIDER_NAME.to_string(),
            fabric_name: PROVIDER_NAME.to_string(),
            caps,
            mode: hints.mode & (Mode::MSG_PREFIX | Mode::LOCAL_MR),
            ep_type: hints.ep_type,
            av_type: if hints.av_type == AvType::Unspec { AvType::Map } else { hints.av_type },
            mr_mode: hints.mr_mode,
            protocol: hints.protocol,
            protocol_version: 1,
            max_msg_size: MAX_MSG_SIZE,
            msg_prefix_size: PREFIX_SIZE,
            inject_size: INJECT_SIZE,
            tx_size: QUEUE_SIZE,
            rx_size: QUEUE_SIZE,
            cq_data_size: CQ_DATA_SIZE,
            src_addr,
            dest_addr,
        }])
    }

    fn open(&self, info: &FabricInfo, req: &ResourceRequest) -> Result<Resources> {
        if matches!(req.wait_obj, WaitObj::Set | WaitObj::MutexCond) {
            return Err(FabtestError::NotImplemented(format!("udp wait object {:?}", req.wait_obj)));
        }
        let bind: SocketAddr = match (&info.src_addr, &info.dest_addr) {
            (Some(src), _) => UdpAddressHandle::decode(src)?,
            (None, Some(dest)) => (route_source(UdpAddressHandle::decode(dest)?)?, 0).into(),
            (None, None) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)
            .map_err(|e| FabtestError::setup(format!("binding udp endpoint to {}: {}", bind, e), -e.raw_os_error().unwrap_or(libc::EIO)))?;
        socket.set_nonblocking(true)?;
        set_buffer_sizes(&socket);
        log::debug!("udp endpoint bound to {}", socket.local_addr()?);

        let core = Rc::new(RefCell::new(Core::new(socket, info.clone(), req)));
        let source = |kind: Option<CompletionKind>, rx: bool| match kind {
            Some(CompletionKind::Queue) => CompletionSource::Queue(Box::new(UdpQueue { core: core.clone(), rx })),
            Some(CompletionKind::Counter) => CompletionSource::Counter(Box::new(UdpCounter { core: core.clone(), rx })),
            None => CompletionSource::Absent,
        };
        let tx = source(req.tx, false);
        let rx = source(req.rx, true);
        Ok(Resources { endpoint: Box::new(UdpEndpoint { core: core.clone(), info: info.clone() }), tx, rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Endpoint, RmaIov};

    struct Side {
        ep: Box<dyn Endpoint>,
        tx: CompletionSource,
        rx: CompletionSource,
        buf: Vec<u8>,
    }

    fn open(hints: &Hints, kind: CompletionKind) -> Side {
        let info = UdpProvider.getinfo(Some("127.0.0.1"), Some("0"), InfoFlags::SOURCE, hints).unwrap().remove(0);
        let req = ResourceRequest { tx: Some(kind), rx: Some(kind), wait_obj: WaitObj::None };
        let Resources { endpoint, tx, rx } = UdpProvider.open(&info, &req).unwrap();
        Side { ep: endpoint, tx, rx, buf: vec![0u8; 4096] }
    }

    fn pair(hints: &Hints) -> (Side, Side, FiAddr, FiAddr) {
        let mut a = open(hints, CompletionKind::Queue);
        let mut b = open(hints, CompletionKind::Queue);
        let b_at_a = a.ep.av_insert(&b.ep.name().unwrap()).unwrap();
        let a_at_b = b.ep.av_insert(&a.ep.name().unwrap()).unwrap();
        (a, b, b_at_a, a_at_b)
    }

    fn iov(buf: &mut [u8], offset: usize, len: usize) -> Iov {
        Iov { addr: buf.as_mut_ptr() as u64 + offset as u64, len }
    }

    fn wait_entry(source: &mut CompletionSource) -> std::result::Result<CqEntry, CqErrEntry> {
        let CompletionSource::Queue(cq) = source else { panic!("not a queue") };
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match cq.sread(Timeout::from_millis(50)).unwrap() {
                CqRead::Entry(entry) => return Ok(entry),
                CqRead::ErrorAvailable => return Err(cq.readerr().unwrap()),
                CqRead::Empty => assert!(Instant::now() < deadline, "no completion"),
            }
        }
    }

    /// Waits on `source` while driving the idle peer so it answers.
    fn wait_pumping(source: &mut CompletionSource, peer: &mut CompletionSource) -> CqEntry {
        let (CompletionSource::Queue(cq), CompletionSource::Queue(peer)) = (source, peer) else { panic!("not queues") };
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert_eq!(peer.read().unwrap(), CqRead::Empty);
            if let CqRead::Entry(entry) = cq.sread(Timeout::from_millis(10)).unwrap() {
                return entry;
            }
            assert!(Instant::now() < deadline, "no completion");
        }
    }

    fn send(side: &mut Side, dest: FiAddr, len: usize, tag: Option<u64>) {
        let iov = iov(&mut side.buf, 0, len);
        let req = TxRequest { op: TxOp::Send, iov, desc: MrDesc::NONE, dest, context: 7, tag, flags: OpFlags::empty() };
        side.ep.post_tx(req).unwrap();
    }

    fn recv(side: &mut Side, offset: usize, len: usize, tag: Option<u64>) {
        let iov = iov(&mut side.buf, offset, len);
        side.ep.post_rx(RxRequest { iov, desc: MrDesc::NONE, context: offset as u64, tag }).unwrap();
    }

    #[test]
    fn address_handle_keeps_family_and_port() {
        let addr: SocketAddr = "10.1.2.3:9228".parse().unwrap();
        assert_eq!(UdpAddressHandle::decode(&UdpAddressHandle::encode(addr).unwrap()).unwrap(), addr);
        let v6: SocketAddr = "[fe80::1]:2710".parse().unwrap();
        assert_eq!(UdpAddressHandle::decode(&UdpAddressHandle::encode(v6).unwrap()).unwrap(), v6);
    }

    #[test]
    fn getinfo_filters_unsupported_requests() {
        let msg_ep = Hints { ep_type: EpType::Msg, ..Default::default() };
        assert!(UdpProvider.getinfo(None, None, InfoFlags::empty(), &msg_ep).unwrap().is_empty());
        let atomics = Hints { caps: Caps::ATOMIC, ..Default::default() };
        assert!(UdpProvider.getinfo(None, None, InfoFlags::empty(), &atomics).unwrap().is_empty());
        let prefixed = Hints { caps: Caps::MSG, mode: Mode::MSG_PREFIX | Mode::CONTEXT, ..Default::default() };
        let info = UdpProvider.getinfo(Some("127.0.0.1"), None, InfoFlags::empty(), &prefixed).unwrap().remove(0);
        assert_eq!(info.mode, Mode::MSG_PREFIX);
        assert!(info.dest_addr.is_some());
        assert!(info.src_addr.is_none());
    }

    #[test]
    fn messages_arrive_in_order() {
        let (mut a, mut b, to_b, _) = pair(&Hints { caps: Caps::MSG, ..Default::default() });
        for i in 0..4u8 {
            a.buf[0] = i;
            send(&mut a, to_b, 1, None);
            assert!(wait_entry(&mut a.tx).is_ok());
        }
        for i in 0..4u8 {
            recv(&mut b, 0, 16, None);
            let entry = wait_entry(&mut b.rx).unwrap();
            assert_eq!(entry.len, 1);
            assert_eq!(b.buf[0], i);
        }
    }

    #[test]
    fn tags_select_the_matching_receive() {
        let (mut a, mut b, to_b, _) = pair(&Hints { caps: Caps::TAGGED, ..Default::default() });
        recv(&mut b, 0, 8, Some(2));
        recv(&mut b, 64, 8, Some(1));
        a.buf[0] = 0xaa;
        send(&mut a, to_b, 1, Some(1));
        let entry = wait_entry(&mut b.rx).unwrap();
        assert_eq!(entry.context, 64);
        assert_eq!(entry.tag, 1);
        assert_eq!(b.buf[64], 0xaa);
    }

    #[test]
    fn oversized_message_is_reported_truncated() {
        let (mut a, mut b, to_b, _) = pair(&Hints { caps: Caps::MSG, ..Default::default() });
        recv(&mut b, 0, 4, None);
        send(&mut a, to_b, 32, None);
        let err = wait_entry(&mut b.rx).unwrap_err();
        assert_eq!(err.err, libc::EMSGSIZE);
        assert_eq!(err.len, 4);
    }

    #[test]
    fn remote_write_needs_a_valid_key() {
        let hints = Hints { caps: Caps::MSG | Caps::RMA, ..Default::default() };
        let (mut a, mut b, to_b, _) = pair(&hints);
        let target = iov(&mut b.buf, 128, 64);
        let region = b.ep.register(target, MrAccess::REMOTE_WRITE, 0).unwrap();

        a.buf[..4].copy_from_slice(b"data");
        let bad = RmaIov { addr: target.addr, key: region.key() + 1 };
        let req = TxRequest {
            op: TxOp::Write(bad),
            iov: iov(&mut a.buf, 0, 4),
            desc: MrDesc::NONE,
            dest: to_b,
            context: 1,
            tag: None,
            flags: OpFlags::empty(),
        };
        a.ep.post_tx(req).unwrap();
        assert_eq!(wait_pumping(&mut a.tx, &mut b.tx).context, 1);
        assert_ne!(&b.buf[128..132], b"data");

        let good = RmaIov { addr: target.addr, key: region.key() };
        a.ep.post_tx(TxRequest { op: TxOp::WriteData(good, 99), ..req }).unwrap();
        recv(&mut b, 0, 16, None);
        let entry = wait_entry(&mut b.rx).unwrap();
        assert_eq!(entry.data, 99);
        assert!(entry.flags.contains(CompFlags::REMOTE_CQ_DATA));
        assert_eq!(&b.buf[128..132], b"data");
    }

    #[test]
    fn read_pulls_remote_memory() {
        let hints = Hints { caps: Caps::MSG | Caps::RMA, ..Default::default() };
        let (mut a, mut b, to_b, _) = pair(&hints);
        b.buf[256..260].copy_from_slice(b"pull");
        let source = iov(&mut b.buf, 256, 4);
        let region = b.ep.register(source, MrAccess::REMOTE_READ, 0).unwrap();
        let req = TxRequest {
            op: TxOp::Read(RmaIov { addr: source.addr, key: region.key() }),
            iov: iov(&mut a.buf, 0, 4),
            desc: MrDesc::NONE,
            dest: to_b,
            context: 5,
            tag: None,
            flags: OpFlags::empty(),
        };
        a.ep.post_tx(req).unwrap();
        let entry = wait_pumping(&mut a.tx, &mut b.tx);
        assert_eq!(entry.context, 5);
        assert!(entry.flags.contains(CompFlags::READ));
        assert_eq!(&a.buf[..4], b"pull");
    }

    #[test]
    fn full_window_reports_busy() {
        let (mut a, _b, to_b, _) = pair(&Hints { caps: Caps::MSG, ..Default::default() });
        // peer never progresses, so nothing is acknowledged
        let mut busy = false;
        for _ in 0..WINDOW + 1 {
            let iov = iov(&mut a.buf, 0, 8);
            let req = TxRequest { op: TxOp::Send, iov, desc: MrDesc::NONE, dest: to_b, context: 0, tag: None, flags: OpFlags::empty() };
            if let Err(e) = a.ep.post_tx(req) {
                assert!(matches!(e, FabtestError::TransientBusy));
                busy = true;
            }
        }
        assert!(busy);
    }

    #[test]
    fn inject_bumps_counter_without_queue_entry() {
        let hints = Hints { caps: Caps::MSG, ..Default::default() };
        let mut a = open(&hints, CompletionKind::Counter);
        let mut b = open(&hints, CompletionKind::Queue);
        let to_b = a.ep.av_insert(&b.ep.name().unwrap()).unwrap();
        let iov = iov(&mut a.buf, 0, 8);
        let req = TxRequest { op: TxOp::Inject, iov, desc: MrDesc::NONE, dest: to_b, context: 0, tag: None, flags: OpFlags::empty() };
        a.ep.post_tx(req).unwrap();
        let CompletionSource::Counter(cntr) = &mut a.tx else { panic!() };
        assert_eq!(cntr.read().unwrap(), 1);
        recv(&mut b, 0, 16, None);
        assert_eq!(wait_entry(&mut b.rx).unwrap().len, 8);
    }

    #[test]
    fn set_wait_object_is_not_implemented() {
        let info = UdpProvider.getinfo(None, None, InfoFlags::empty(), &Hints::default()).unwrap().remove(0);
        let req = ResourceRequest { tx: None, rx: None, wait_obj: WaitObj::Set };
        assert!(matches!(UdpProvider.open(&info, &req), Err(FabtestError::NotImplemented(_))));
    }
}
