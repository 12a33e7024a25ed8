//! Management channel between a driving client and a listening server.
//!
//! The client walks a test series. For every case it sends a fixed-size
//! descriptor record, runs the initiator side, then reads the server's
//! result word. The server mirrors this from the responder side.

use std::fmt::Display;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use serde::{Deserialize, Serialize};

use crate::completion::WaitStrategy;
use crate::config::{TestOptions, Timeout};
use crate::error::{ErrorClass, FabtestError, Result};
use crate::get_hostname;
use crate::provider::{AvType, Caps, CompletionKind, EpType, FabricInfo, Hints, InfoFlags, Mode, MrMode};
use crate::session::Role;
use crate::transfer::RmaOp;

/// Every descriptor occupies exactly this many bytes on the wire.
pub const DESCRIPTOR_WIRE_SIZE: usize = 512;
pub const NAME_MAX: usize = 63;
pub const SERVICE_MAX: usize = 31;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    #[default]
    Latency,
    Bandwidth,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClassFunction {
    #[default]
    Send,
    Inject,
    Rma,
}

/// One test case as carried over the management channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestDescriptor {
    pub test_index: u32,
    pub test_subindex: u32,
    pub test_type: TestType,
    pub class_function: ClassFunction,
    pub ep_type: EpType,
    pub av_type: AvType,
    pub comp_type: CompletionKind,
    pub cq_wait: WaitStrategy,
    pub rma_op: Option<RmaOp>,
    pub mr_mode: MrMode,
    pub caps: u64,
    pub mode: u64,
    pub protocol: u32,
    pub protocol_version: u32,
    pub transfer_size: u64,
    pub iterations: u64,
    pub verify_data: bool,
    pub timeout_ms: i32,
    prov_name: String,
    fabric_name: String,
    node: String,
    service: String,
}

impl Default for TestDescriptor {
    fn default() -> Self {
        TestDescriptor {
            test_index: 0,
            test_subindex: 0,
            test_type: TestType::Latency,
            class_function: ClassFunction::Send,
            ep_type: EpType::Rdm,
            av_type: AvType::Unspec,
            comp_type: CompletionKind::Queue,
            cq_wait: WaitStrategy::Spin,
            rma_op: None,
            mr_mode: MrMode::Basic,
            caps: Caps::MSG.bits(),
            mode: 0,
            protocol: 0,
            protocol_version: 0,
            transfer_size: 1024,
            iterations: 0,
            verify_data: false,
            timeout_ms: 10_000,
            prov_name: String::new(),
            fabric_name: String::new(),
            node: String::new(),
            service: String::new(),
        }
    }
}

fn bounded(s: &str, max: usize) -> String {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() { None } else { Some(s) }
}

impl TestDescriptor {
    pub fn prov_name(&self) -> Option<&str> {
        non_empty(&self.prov_name)
    }

    pub fn fabric_name(&self) -> Option<&str> {
        non_empty(&self.fabric_name)
    }

    pub fn node(&self) -> Option<&str> {
        non_empty(&self.node)
    }

    pub fn service(&self) -> Option<&str> {
        non_empty(&self.service)
    }

    pub fn set_prov_name(&mut self, name: &str) {
        self.prov_name = bounded(name, NAME_MAX);
    }

    pub fn set_fabric_name(&mut self, name: &str) {
        self.fabric_name = bounded(name, NAME_MAX);
    }

    pub fn set_node(&mut self, node: &str) {
        self.node = bounded(node, NAME_MAX);
    }

    pub fn set_service(&mut self, service: &str) {
        self.service = bounded(service, SERVICE_MAX);
    }

    pub fn caps(&self) -> Caps {
        Caps::from_bits_truncate(self.caps)
    }

    pub fn mode(&self) -> Mode {
        Mode::from_bits_truncate(self.mode)
    }

    pub fn to_hints(&self) -> Hints {
        Hints {
            caps: self.caps(),
            mode: self.mode(),
            ep_type: self.ep_type,
            av_type: self.av_type,
            mr_mode: self.mr_mode,
            provider_name: self.prov_name().map(str::to_string),
            fabric_name: self.fabric_name().map(str::to_string),
            protocol: self.protocol,
            protocol_version: self.protocol_version,
        }
    }

    /// Pins the descriptor to what the client resolved, so the server
    /// picks the same provider instance.
    pub fn update_from_info(&mut self, info: &FabricInfo, subindex: u32) {
        self.test_subindex = subindex;
        self.protocol = info.protocol;
        self.protocol_version = info.protocol_version;
        self.set_prov_name(&info.provider_name);
        self.set_fabric_name(&info.fabric_name);
    }

    pub fn options(&self, base: &TestOptions) -> TestOptions {
        TestOptions {
            transfer_size: self.transfer_size as usize,
            iterations: self.iterations as usize,
            verify_data: self.verify_data || base.verify_data,
            timeout: Timeout::from_millis(self.timeout_ms),
            comp_method: self.cq_wait,
            comp_type: self.comp_type,
            rma_op: self.rma_op,
            bandwidth: self.test_type == TestType::Bandwidth,
            ..base.clone()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut record = bincode::serialize(self)?;
        if record.len() > DESCRIPTOR_WIRE_SIZE {
            return Err(FabtestError::Protocol(format!("descriptor needs {} bytes", record.len())));
        }
        record.resize(DESCRIPTOR_WIRE_SIZE, 0);
        Ok(record)
    }

    pub fn decode(record: &[u8]) -> Result<TestDescriptor> {
        if record.len() != DESCRIPTOR_WIRE_SIZE {
            return Err(FabtestError::Protocol(format!("descriptor record of {} bytes", record.len())));
        }
        Ok(bincode::deserialize(record)?)
    }
}

impl Display for TestDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:?} {:?} {:?} caps {:?} mode {:?} {:?}/{} size {}",
            self.prov_name().unwrap_or("any"),
            self.ep_type,
            self.test_type,
            self.class_function,
            self.caps(),
            self.mode(),
            self.comp_type,
            self.cq_wait,
            self.transfer_size
        )?;
        if let Some(op) = self.rma_op {
            write!(f, " rma {}", op)?;
        }
        Ok(())
    }
}

/// Blocking byte stream with wait-all semantics in both directions.
pub struct ControlChannel {
    stream: TcpStream,
}

impl ControlChannel {
    pub fn connect(node: &str, service: &str) -> Result<ControlChannel> {
        let address = format!("{}:{}", node, service);
        let stream = TcpStream::connect(&address)
            .map_err(|e| FabtestError::setup(format!("connecting to {}: {}", address, e), -e.raw_os_error().unwrap_or(libc::ECONNREFUSED)))?;
        stream.set_nodelay(true)?;
        log::debug!("{} control channel connected to {}", get_hostname(), address);
        Ok(ControlChannel { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Result<ControlChannel> {
        stream.set_nodelay(true)?;
        Ok(ControlChannel { stream })
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Fills `buf` completely. A disconnect before the first byte is a clean
    /// close, anywhere later it is a truncated record.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Err(FabtestError::ConnectionClosed),
                Ok(0) => {
                    return Err(FabtestError::Protocol(format!(
                        "peer closed after {} of {} bytes",
                        filled,
                        buf.len()
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset && filled == 0 => {
                    return Err(FabtestError::ConnectionClosed)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn send_descriptor(&mut self, desc: &TestDescriptor) -> Result<()> {
        let record = desc.encode()?;
        self.send(&record)
    }

    pub fn recv_descriptor(&mut self) -> Result<TestDescriptor> {
        let mut record = vec![0u8; DESCRIPTOR_WIRE_SIZE];
        self.recv_exact(&mut record)?;
        TestDescriptor::decode(&record)
    }

    pub fn send_result(&mut self, code: i32) -> Result<()> {
        self.send(&code.to_ne_bytes())
    }

    pub fn recv_result(&mut self) -> Result<i32> {
        let mut word = [0u8; 4];
        self.recv_exact(&mut word)?;
        Ok(i32::from_ne_bytes(word))
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

pub struct ControlListener {
    listener: TcpListener,
}

impl ControlListener {
    pub fn bind(node: Option<&str>, service: &str) -> Result<ControlListener> {
        let address = format!("{}:{}", node.unwrap_or("0.0.0.0"), service);
        let listener = TcpListener::bind(&address)
            .map_err(|e| FabtestError::setup(format!("listening on {}: {}", address, e), -e.raw_os_error().unwrap_or(libc::EADDRINUSE)))?;
        log::info!("{} waiting for a client on {}", get_hostname(), address);
        Ok(ControlListener { listener })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn accept(&self) -> Result<ControlChannel> {
        let (stream, peer) = self.listener.accept()?;
        log::info!("{} accepted client {}", get_hostname(), peer);
        ControlChannel::from_stream(stream)
    }
}

/// Per-class count of finished test cases.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResultTally {
    pub success: usize,
    pub no_data: usize,
    pub not_implemented: usize,
    pub error: usize,
}

impl ResultTally {
    pub fn record(&mut self, class: ErrorClass) {
        match class {
            ErrorClass::Success => self.success += 1,
            ErrorClass::NoData => self.no_data += 1,
            ErrorClass::NotImplemented => self.not_implemented += 1,
            ErrorClass::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.no_data + self.not_implemented + self.error
    }

    pub fn merge(&mut self, other: &ResultTally) {
        self.success += other.success;
        self.no_data += other.no_data;
        self.not_implemented += other.not_implemented;
        self.error += other.error;
    }

    pub fn show(&self) {
        for line in self.to_string().lines() {
            log::info!("{}", line);
        }
    }
}

impl Display for ResultTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Success: {}", self.success)?;
        writeln!(f, "ENODATA: {}", self.no_data)?;
        writeln!(f, "ENOSYS : {}", self.not_implemented)?;
        write!(f, "ERROR  : {}", self.error)
    }
}

/// What the orchestrator needs from a test implementation.
pub trait TestRunner {
    fn getinfo(&self, node: Option<&str>, service: Option<&str>, flags: InfoFlags, hints: &Hints) -> Result<Vec<FabricInfo>>;
    fn run(&mut self, info: &FabricInfo, desc: &TestDescriptor, role: Role) -> Result<()>;
}

fn single_match(mut infos: Vec<FabricInfo>) -> Result<FabricInfo> {
    match infos.len() {
        1 => Ok(infos.remove(0)),
        0 => Err(FabtestError::NoData("no fabric info matched".to_string())),
        n => Err(FabtestError::Config(format!("{} fabric infos match, expected exactly one", n))),
    }
}

/// The resolved info may not demand modes the hints did not offer, and must
/// carry every requested capability.
pub fn check_info(hints: &Hints, info: &FabricInfo) -> Result<()> {
    if !hints.mode.contains(info.mode) {
        return Err(FabtestError::Protocol(format!(
            "provider requires mode {:?}, hints offer {:?}",
            info.mode, hints.mode
        )));
    }
    if !info.caps.contains(hints.caps) {
        return Err(FabtestError::Protocol(format!("provider lacks caps {:?}", hints.caps - info.caps)));
    }
    Ok(())
}

fn run_server_case<R: TestRunner + ?Sized>(runner: &mut R, desc: &TestDescriptor) -> Result<()> {
    let hints = desc.to_hints();
    let info = single_match(runner.getinfo(desc.node(), desc.service(), InfoFlags::SOURCE, &hints)?)?;
    runner.run(&info, desc, Role::Responder)
}

/// Serves test cases until the client disconnects between records.
pub fn serve_session<R: TestRunner + ?Sized>(channel: &mut ControlChannel, runner: &mut R, tally: &mut ResultTally) -> Result<()> {
    let hostname = get_hostname();
    loop {
        let desc = match channel.recv_descriptor() {
            Ok(desc) => desc,
            Err(FabtestError::ConnectionClosed) => {
                log::info!("{} client finished", hostname);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        log::info!("{} Starting test {}-{}: {}", hostname, desc.test_index, desc.test_subindex, desc);
        let result = run_server_case(runner, &desc);
        if let Err(e) = &result {
            log::error!("{} test {}-{}: {}", hostname, desc.test_index, desc.test_subindex, e);
        }
        let class = ErrorClass::of(&result);
        log::info!("{} Ending test {}-{}, result: {:?}", hostname, desc.test_index, desc.test_subindex, class);
        tally.record(class);
        let code = result.err().map_or(0, |e| e.code());
        channel.send_result(code)?;
    }
}

/// Runs one case from the client side. The outer error is a channel
/// failure that ends the run, the inner one is the case outcome.
fn run_client_case<R: TestRunner + ?Sized>(channel: &mut ControlChannel, runner: &mut R, desc: &mut TestDescriptor) -> Result<Result<()>> {
    let hints = desc.to_hints();
    let info = match runner.getinfo(desc.node(), desc.service(), InfoFlags::empty(), &hints).and_then(single_match) {
        Ok(info) => info,
        Err(e) => return Ok(Err(e)),
    };
    if let Err(e) = check_info(&hints, &info) {
        return Ok(Err(e));
    }
    desc.update_from_info(&info, 1);
    channel.send_descriptor(desc)?;
    let local = runner.run(&info, desc, Role::Initiator);
    let remote = channel.recv_result()?;
    Ok(match local {
        Err(e) => Err(e),
        Ok(()) if remote != 0 => Err(FabtestError::Peer(remote)),
        Ok(()) => Ok(()),
    })
}

/// Drives every case of `series` through the server.
pub fn run_client<R: TestRunner + ?Sized>(
    channel: &mut ControlChannel,
    runner: &mut R,
    series: &[TestDescriptor],
    tally: &mut ResultTally,
) -> Result<()> {
    let hostname = get_hostname();
    for template in series {
        let mut desc = template.clone();
        log::info!("{} Starting test {}: {}", hostname, desc.test_index, desc);
        let result = match run_client_case(channel, runner, &mut desc) {
            Ok(result) => result,
            Err(e) => {
                log::error!("{} control channel failed during test {}: {}", hostname, desc.test_index, e);
                tally.record(ErrorClass::Error);
                return Err(e);
            }
        };
        if let Err(e) = &result {
            log::error!("{} test {}: {}", hostname, desc.test_index, e);
        }
        let class = ErrorClass::of(&result);
        log::info!("{} Ending test {}, result: {:?}", hostname, desc.test_index, class);
        tally.record(class);
    }
    Ok(())
}
