//! Transport provider seam.
//!
//! The engine only talks to these traits. A provider resolves capability
//! descriptions into [`FabricInfo`] records and opens an endpoint with one
//! completion source per direction.

use std::fmt::Display;
use std::os::fd::RawFd;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::config::Timeout;
use crate::error::{FabtestError, Result};

pub mod udp;
#[cfg(feature = "verbs")]
pub mod verbs;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Caps: u64 {
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const TAGGED = 1 << 3;
        const ATOMIC = 1 << 4;
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
        const REMOTE_READ = 1 << 12;
        const REMOTE_WRITE = 1 << 13;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Mode: u64 {
        const LOCAL_MR = 1 << 55;
        const MSG_PREFIX = 1 << 58;
        const CONTEXT = 1 << 59;
    }
}

bitflags! {
    /// Access rights requested for a memory registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MrAccess: u64 {
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
        const REMOTE_READ = 1 << 12;
        const REMOTE_WRITE = 1 << 13;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u64 {
        const REMOTE_CQ_DATA = 1 << 24;
        const TRANSMIT_COMPLETE = 1 << 27;
        const INJECT = 1 << 30;
    }
}

bitflags! {
    /// Flags reported on a completion entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CompFlags: u64 {
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const TAGGED = 1 << 3;
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
        const REMOTE_READ = 1 << 12;
        const REMOTE_WRITE = 1 << 13;
        const REMOTE_CQ_DATA = 1 << 24;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InfoFlags: u64 {
        /// node/service name the local address instead of the peer's.
        const SOURCE = 1 << 57;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpType {
    Msg,
    #[default]
    Rdm,
    Dgram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvType {
    #[default]
    Unspec,
    Map,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MrMode {
    #[default]
    Basic,
    Scalable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitObj {
    #[default]
    None,
    Unspec,
    Set,
    Fd,
    MutexCond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionKind {
    #[default]
    Queue,
    Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Tx,
    Rx,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Tx => write!(f, "TX"),
            Direction::Rx => write!(f, "RX"),
        }
    }
}

/// Address-vector handle of a resolved peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiAddr(pub u64);

impl FiAddr {
    pub const UNSPEC: FiAddr = FiAddr(u64::MAX);
}

/// Remote access descriptor exchanged before RMA traffic.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RmaIov {
    pub addr: u64,
    pub key: u64,
}

/// Local memory span handed to a post call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iov {
    pub addr: u64,
    pub len: usize,
}

/// Local registration descriptor; `NONE` when memory was not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrDesc(pub Option<u64>);

impl MrDesc {
    pub const NONE: MrDesc = MrDesc(None);
}

#[derive(Debug, Clone, Default)]
pub struct Hints {
    pub caps: Caps,
    pub mode: Mode,
    pub ep_type: EpType,
    pub av_type: AvType,
    pub mr_mode: MrMode,
    pub provider_name: Option<String>,
    pub fabric_name: Option<String>,
    pub protocol: u32,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FabricInfo {
    pub provider_name: String,
    pub fabric_name: String,
    pub caps: Caps,
    pub mode: Mode,
    pub ep_type: EpType,
    pub av_type: AvType,
    pub mr_mode: MrMode,
    pub protocol: u32,
    pub protocol_version: u32,
    pub max_msg_size: usize,
    pub msg_prefix_size: usize,
    pub inject_size: usize,
    pub tx_size: usize,
    pub rx_size: usize,
    pub cq_data_size: usize,
    pub src_addr: Option<Vec<u8>>,
    pub dest_addr: Option<Vec<u8>>,
}

impl FabricInfo {
    pub fn tx_prefix_size(&self) -> usize {
        if self.mode.contains(Mode::MSG_PREFIX) { self.msg_prefix_size } else { 0 }
    }

    pub fn rx_prefix_size(&self) -> usize {
        if self.mode.contains(Mode::MSG_PREFIX) { self.msg_prefix_size } else { 0 }
    }

    /// Immediate data carried by write-with-data, masked to what the provider can hold.
    pub fn remote_cq_data(&self) -> u64 {
        let data = 0x0123_4567_89ab_cdef_u64;
        match self.cq_data_size {
            0 => 0,
            n if n >= 8 => data,
            n => data & ((1u64 << (n * 8)) - 1),
        }
    }

    pub fn hints(&self) -> Hints {
        Hints {
            caps: self.caps,
            mode: self.mode,
            ep_type: self.ep_type,
            av_type: self.av_type,
            mr_mode: self.mr_mode,
            provider_name: Some(self.provider_name.clone()),
            fabric_name: Some(self.fabric_name.clone()),
            protocol: self.protocol,
            protocol_version: self.protocol_version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Send,
    Inject,
    Write(RmaIov),
    WriteData(RmaIov, u64),
    Read(RmaIov),
    InjectWrite(RmaIov),
    InjectWriteData(RmaIov, u64),
}

impl TxOp {
    /// Inject variants never produce a completion queue entry.
    pub fn is_inject(&self) -> bool {
        matches!(self, TxOp::Inject | TxOp::InjectWrite(_) | TxOp::InjectWriteData(..))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxOp::Send => "fi_send",
            TxOp::Inject => "fi_inject",
            TxOp::Write(_) => "fi_write",
            TxOp::WriteData(..) => "fi_writedata",
            TxOp::Read(_) => "fi_read",
            TxOp::InjectWrite(_) => "fi_inject_write",
            TxOp::InjectWriteData(..) => "fi_inject_writedata",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TxRequest {
    pub op: TxOp,
    pub iov: Iov,
    pub desc: MrDesc,
    pub dest: FiAddr,
    pub context: u64,
    pub tag: Option<u64>,
    pub flags: OpFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct RxRequest {
    pub iov: Iov,
    pub desc: MrDesc,
    pub context: u64,
    pub tag: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CqEntry {
    pub context: u64,
    pub flags: CompFlags,
    pub len: usize,
    pub data: u64,
    pub tag: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CqErrEntry {
    pub context: u64,
    pub flags: CompFlags,
    pub len: usize,
    /// Positive errno value.
    pub err: i32,
    pub prov_errno: i32,
    pub message: String,
}

/// Result of one non-blocking completion queue read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqRead {
    Entry(CqEntry),
    Empty,
    /// An error entry heads the queue and must be taken with `readerr`.
    ErrorAvailable,
}

pub trait CompletionQueue {
    fn read(&mut self) -> Result<CqRead>;
    /// Blocks up to `timeout`; returns `Empty` when it expires.
    fn sread(&mut self, timeout: Timeout) -> Result<CqRead>;
    fn readerr(&mut self) -> Result<CqErrEntry>;
    /// True when nothing is pending and blocking on the fd is safe.
    fn trywait(&mut self) -> Result<bool>;
    fn wait_fd(&self) -> Option<RawFd>;
}

pub trait Counter {
    fn read(&mut self) -> Result<u64>;
    fn read_err(&mut self) -> Result<u64>;
    fn wait(&mut self, threshold: u64, timeout: Timeout) -> Result<()>;
}

/// Registered memory. Deregisters on drop.
pub trait MemoryRegion {
    fn key(&self) -> u64;
    fn desc(&self) -> MrDesc;
}

pub trait Endpoint {
    fn info(&self) -> &FabricInfo;

    /// Connection-oriented endpoints finish bring-up here.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Raw local address bytes, as a peer passes them to `av_insert`.
    fn name(&self) -> Result<Vec<u8>>;
    fn av_insert(&mut self, addr: &[u8]) -> Result<FiAddr>;
    fn register(&mut self, iov: Iov, access: MrAccess, requested_key: u64) -> Result<Box<dyn MemoryRegion>>;
    fn post_tx(&mut self, req: TxRequest) -> Result<()>;
    fn post_rx(&mut self, req: RxRequest) -> Result<()>;
}

/// Completion resource bound to one direction of an endpoint.
pub enum CompletionSource {
    Queue(Box<dyn CompletionQueue>),
    Counter(Box<dyn Counter>),
    Absent,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceRequest {
    pub tx: Option<CompletionKind>,
    pub rx: Option<CompletionKind>,
    pub wait_obj: WaitObj,
}

pub struct Resources {
    pub endpoint: Box<dyn Endpoint>,
    pub tx: CompletionSource,
    pub rx: CompletionSource,
}

pub trait Provider {
    fn name(&self) -> &str;
    fn getinfo(&self, node: Option<&str>, service: Option<&str>, flags: InfoFlags, hints: &Hints) -> Result<Vec<FabricInfo>>;
    fn open(&self, info: &FabricInfo, req: &ResourceRequest) -> Result<Resources>;
}

/// All providers compiled into the binary.
pub struct Registry {
    providers: Vec<Box<dyn Provider>>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut providers: Vec<Box<dyn Provider>> = vec![Box::new(udp::UdpProvider)];
        #[cfg(feature = "verbs")]
        providers.push(Box::new(verbs::VerbsProvider::default()));
        Registry { providers }
    }
}

impl Registry {
    pub fn new(providers: Vec<Box<dyn Provider>>) -> Registry {
        Registry { providers }
    }
}

impl Provider for Registry {
    fn name(&self) -> &str {
        "registry"
    }

    fn getinfo(&self, node: Option<&str>, service: Option<&str>, flags: InfoFlags, hints: &Hints) -> Result<Vec<FabricInfo>> {
        let mut infos = Vec::new();
        for provider in &self.providers {
            if let Some(name) = &hints.provider_name {
                if name != provider.name() {
                    continue;
                }
            }
            infos.extend(provider.getinfo(node, service, flags, hints)?);
        }
        if infos.is_empty() {
            return Err(FabtestError::NoData(format!(
                "no provider matches caps {:?} ep_type {:?}",
                hints.caps, hints.ep_type
            )));
        }
        Ok(infos)
    }

    fn open(&self, info: &FabricInfo, req: &ResourceRequest) -> Result<Resources> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.name() == info.provider_name)
            .ok_or_else(|| FabtestError::NoData(format!("provider {} not available", info.provider_name)))?;
        provider.open(info, req)
    }
}

/// Waits for `fd` to become readable. Returns false when the timeout expired.
///
/// Signals restart the poll with whatever is left of the window.
pub fn poll_fd(fd: RawFd, timeout: Timeout) -> Result<bool> {
    let start = std::time::Instant::now();
    loop {
        let left = match timeout.0 {
            None => Timeout::INFINITE,
            Some(window) => Timeout(Some(window.saturating_sub(start.elapsed()))),
        };
        let mut fds = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        let ret = unsafe { libc::poll(&mut fds, 1, left.as_poll_millis()) };
        if ret >= 0 {
            return Ok(ret > 0);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_cq_data_is_masked_to_provider_width() {
        let mut info = FabricInfo { cq_data_size: 8, ..Default::default() };
        assert_eq!(info.remote_cq_data(), 0x0123_4567_89ab_cdef);
        info.cq_data_size = 4;
        assert_eq!(info.remote_cq_data(), 0x89ab_cdef);
        info.cq_data_size = 0;
        assert_eq!(info.remote_cq_data(), 0);
    }

    #[test]
    fn prefix_only_in_prefix_mode() {
        let mut info = FabricInfo { msg_prefix_size: 16, ..Default::default() };
        assert_eq!(info.tx_prefix_size(), 0);
        info.mode |= Mode::MSG_PREFIX;
        assert_eq!(info.rx_prefix_size(), 16);
    }

    extern "C" fn ignore_signal(_: libc::c_int) {}

    #[test]
    fn interrupted_poll_keeps_waiting() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = ignore_signal as usize;
        assert_eq!(unsafe { libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()) }, 0);

        let waiter = unsafe { libc::pthread_self() } as usize;
        let writer = fds[1];
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            unsafe { libc::pthread_kill(waiter as libc::pthread_t, libc::SIGUSR1) };
            std::thread::sleep(std::time::Duration::from_millis(50));
            unsafe { libc::write(writer, b"x".as_ptr() as *const libc::c_void, 1) };
        });
        assert!(poll_fd(fds[0], Timeout::INFINITE).unwrap());
        t.join().unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn empty_registry_reports_no_data() {
        let registry = Registry::new(Vec::new());
        let err = registry.getinfo(None, None, InfoFlags::empty(), &Hints::default()).unwrap_err();
        assert!(matches!(err, FabtestError::NoData(_)));
    }
}
