//! RDMA verbs provider.
//!
//! Each endpoint owns one reliable-connected queue pair with separate send
//! and receive completion queues. Bring-up trades a [`RemoteHandle`] over a
//! TCP side channel, then walks the queue pair through RTR and RTS.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::CStr;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::RawFd;
use std::ptr::null_mut;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rdma_sys::*;
use serde::{Deserialize, Serialize};

use crate::config::Timeout;
use crate::error::{FabtestError, Result};
use crate::provider::udp::UdpAddressHandle;
use crate::provider::{
    poll_fd, Caps, CompFlags, CompletionKind, CompletionQueue, CompletionSource, CqEntry, CqErrEntry, CqRead, EpType,
    FabricInfo, FiAddr, Hints, InfoFlags, Iov, MemoryRegion, Mode, MrAccess, MrDesc, Provider, ResourceRequest,
    Resources, RxRequest, TxOp, TxRequest, WaitObj,
};

pub const PROVIDER_NAME: &str = "verbs";
const PORT_NUM: u8 = 1;
const GID_INDEX: i32 = 1;
const QUEUE_SIZE: usize = 4096;
const INLINE_SIZE: usize = 64;
const CQ_DATA_SIZE: usize = 4;
const MAX_MSG_SIZE: usize = 1 << 30;
const POLL_BATCH: usize = 16;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_RETRY: Duration = Duration::from_millis(50);
/// Marks work requests whose completion is reaped but never reported.
const INJECT_WR: u64 = 1 << 63;

/// Queue pair coordinates a peer needs to reach us.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemoteHandle {
    qpn: u32,
    gid_subnet_ids: u64,
    gid_interface_ids: u64,
    psn: u32,
}

impl RemoteHandle {
    fn gid(&self) -> ibv_gid {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&self.gid_subnet_ids.to_ne_bytes());
        raw[8..].copy_from_slice(&self.gid_interface_ids.to_ne_bytes());
        ibv_gid { raw }
    }

    fn wire_size() -> usize {
        bincode::serialized_size(&RemoteHandle::default()).map_or(24, |n| n as usize)
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn verbs_error(call: &str, ret: i32) -> FabtestError {
    let code = if ret > 0 { ret } else { errno() };
    FabtestError::setup(format!("{}: {}", call, std::io::Error::from_raw_os_error(code)), -code)
}

/// Opened device with its protection domain.
struct Device {
    context: *mut ibv_context,
    pd: *mut ibv_pd,
    name: String,
}

impl Device {
    fn open(device_name: &str) -> Result<Device> {
        let device_list = unsafe { ibv_get_device_list(null_mut()) };
        if device_list.is_null() {
            return Err(verbs_error("ibv_get_device_list", -1));
        }
        let mut context: *mut ibv_context = null_mut();
        let mut i = 0;
        loop {
            let device = unsafe { *device_list.wrapping_add(i) };
            if device.is_null() {
                break;
            }
            let name = unsafe { CStr::from_ptr((*device).name.as_ptr()) };
            if name.to_string_lossy() == device_name {
                context = unsafe { ibv_open_device(device) };
                break;
            }
            i += 1;
        }
        unsafe { ibv_free_device_list(device_list) };
        if context.is_null() {
            return Err(FabtestError::NoData(format!("rdma device {} not found", device_name)));
        }
        let pd = unsafe { ibv_alloc_pd(context) };
        if pd.is_null() {
            unsafe { ibv_close_device(context) };
            return Err(verbs_error("ibv_alloc_pd", -1));
        }
        Ok(Device { context, pd, name: device_name.to_string() })
    }

    fn gid(&self) -> Result<ibv_gid> {
        let mut gid: ibv_gid = unsafe { std::mem::zeroed() };
        let ret = unsafe { ibv_query_gid(self.context, PORT_NUM, GID_INDEX, &mut gid) };
        if ret != 0 {
            return Err(verbs_error("ibv_query_gid", ret));
        }
        Ok(gid)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            ibv_dealloc_pd(self.pd);
            ibv_close_device(self.context);
        }
    }
}

/// Names of devices whose first port is active.
fn active_devices() -> Result<Vec<String>> {
    let device_list = unsafe { ibv_get_device_list(null_mut()) };
    if device_list.is_null() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let mut i = 0;
    loop {
        let device = unsafe { *device_list.wrapping_add(i) };
        if device.is_null() {
            break;
        }
        i += 1;
        let name = unsafe { CStr::from_ptr((*device).name.as_ptr()) }.to_string_lossy().into_owned();
        let context = unsafe { ibv_open_device(device) };
        if context.is_null() {
            log::warn!("ibv_open_device {}: {}", name, std::io::Error::last_os_error());
            continue;
        }
        let mut port_attr: ibv_port_attr = unsafe { std::mem::zeroed() };
        let ret = unsafe { ___ibv_query_port(context, PORT_NUM, &mut port_attr) };
        unsafe { ibv_close_device(context) };
        if ret == 0 && port_attr.state == ibv_port_state::IBV_PORT_ACTIVE {
            names.push(name);
        }
    }
    unsafe { ibv_free_device_list(device_list) };
    Ok(names)
}

struct Cq {
    cq: *mut ibv_cq,
    channel: *mut ibv_comp_channel,
    _device: Rc<Device>,
}

impl Cq {
    fn new(device: Rc<Device>) -> Result<Cq> {
        let channel = unsafe { ibv_create_comp_channel(device.context) };
        if channel.is_null() {
            return Err(verbs_error("ibv_create_comp_channel", -1));
        }
        let fd = unsafe { (*channel).fd };
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            let err = verbs_error("fcntl O_NONBLOCK", -1);
            unsafe { ibv_destroy_comp_channel(channel) };
            return Err(err);
        }
        let cq = unsafe { ibv_create_cq(device.context, QUEUE_SIZE as i32, null_mut(), channel, 0) };
        if cq.is_null() {
            unsafe { ibv_destroy_comp_channel(channel) };
            return Err(verbs_error("ibv_create_cq", -1));
        }
        Ok(Cq { cq, channel, _device: device })
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_cq(self.cq);
            ibv_destroy_comp_channel(self.channel);
        }
    }
}

/// Completions of one direction, polled in batches and handed out one at a time.
struct CqLane {
    cq: Rc<Cq>,
    pending: VecDeque<std::result::Result<CqEntry, CqErrEntry>>,
    armed: bool,
}

impl CqLane {
    fn new(cq: Rc<Cq>) -> CqLane {
        CqLane { cq, pending: VecDeque::new(), armed: false }
    }

    /// Acknowledges channel events so the fd stops reporting readable.
    fn consume_events(&mut self) {
        if !self.armed {
            return;
        }
        let mut cq: *mut ibv_cq = null_mut();
        let mut context: *mut libc::c_void = null_mut();
        let mut events = 0;
        while unsafe { ibv_get_cq_event(self.cq.channel, &mut cq, &mut context) } == 0 {
            events += 1;
        }
        if events > 0 {
            unsafe { ibv_ack_cq_events(self.cq.cq, events) };
            self.armed = false;
        }
    }

    fn poll(&mut self) -> Result<usize> {
        self.consume_events();
        let mut wc: [ibv_wc; POLL_BATCH] = unsafe { std::mem::zeroed() };
        let ret = unsafe { ibv_poll_cq(self.cq.cq, POLL_BATCH as i32, wc.as_mut_ptr()) };
        if ret < 0 {
            return Err(verbs_error("ibv_poll_cq", ret));
        }
        for wc in &wc[..ret as usize] {
            if let Some(completion) = translate(wc) {
                self.pending.push_back(completion);
            }
        }
        Ok(ret as usize)
    }
}

fn translate(wc: &ibv_wc) -> Option<std::result::Result<CqEntry, CqErrEntry>> {
    let hidden = wc.wr_id & INJECT_WR != 0;
    let context = wc.wr_id & !INJECT_WR;
    if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
        let message = unsafe { CStr::from_ptr(ibv_wc_status_str(wc.status)) }.to_string_lossy().into_owned();
        return Some(Err(CqErrEntry {
            context,
            len: wc.byte_len as usize,
            err: libc::EIO,
            prov_errno: wc.vendor_err as i32,
            message,
            ..Default::default()
        }));
    }
    if hidden {
        return None;
    }
    let mut entry = CqEntry { context, len: wc.byte_len as usize, ..Default::default() };
    entry.flags = match wc.opcode {
        ibv_wc_opcode::IBV_WC_SEND => CompFlags::MSG | CompFlags::SEND,
        ibv_wc_opcode::IBV_WC_RDMA_WRITE => CompFlags::RMA | CompFlags::WRITE,
        ibv_wc_opcode::IBV_WC_RDMA_READ => CompFlags::RMA | CompFlags::READ,
        ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => CompFlags::RMA | CompFlags::REMOTE_WRITE,
        _ => CompFlags::MSG | CompFlags::RECV,
    };
    if wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0 {
        entry.flags |= CompFlags::REMOTE_CQ_DATA;
        entry.data = u32::from_be(unsafe { wc.__bindgen_anon_1.imm_data }) as u64;
    }
    Some(Ok(entry))
}

struct QueuePair {
    qp: *mut ibv_qp,
    _send_cq: Rc<Cq>,
    _recv_cq: Rc<Cq>,
}

impl QueuePair {
    fn new(device: &Device, send_cq: Rc<Cq>, recv_cq: Rc<Cq>) -> Result<QueuePair> {
        let mut qp_init_attr = ibv_qp_init_attr {
            qp_context: null_mut(),
            send_cq: send_cq.cq,
            recv_cq: recv_cq.cq,
            srq: null_mut(),
            cap: ibv_qp_cap {
                max_send_wr: QUEUE_SIZE as u32,
                max_recv_wr: QUEUE_SIZE as u32,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: INLINE_SIZE as u32,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
        };
        let qp = unsafe { ibv_create_qp(device.pd, &mut qp_init_attr) };
        if qp.is_null() {
            return Err(verbs_error("ibv_create_qp", -1));
        }
        let qp = QueuePair { qp, _send_cq: send_cq, _recv_cq: recv_cq };
        qp.init()?;
        Ok(qp)
    }

    fn qpn(&self) -> u32 {
        unsafe { (*self.qp).qp_num }
    }

    /// Receives may be posted from INIT on, sends need RTS.
    fn init(&self) -> Result<()> {
        let mut qp_attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        qp_attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        qp_attr.pkey_index = 0;
        qp_attr.port_num = PORT_NUM;
        qp_attr.qp_access_flags = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ.0
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        let ret = unsafe { ibv_modify_qp(self.qp, &mut qp_attr, mask.0 as i32) };
        if ret != 0 {
            return Err(verbs_error("ibv_modify_qp to init", ret));
        }
        Ok(())
    }

    fn connect(&self, remote: &RemoteHandle, my_psn: u32) -> Result<()> {
        let mut qp_attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        qp_attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        qp_attr.path_mtu = ibv_mtu::IBV_MTU_4096;
        qp_attr.dest_qp_num = remote.qpn;
        qp_attr.rq_psn = remote.psn;
        qp_attr.max_dest_rd_atomic = 1;
        qp_attr.min_rnr_timer = 12;
        qp_attr.ah_attr.port_num = PORT_NUM;
        qp_attr.ah_attr.is_global = 1;
        qp_attr.ah_attr.grh.dgid = remote.gid();
        qp_attr.ah_attr.grh.sgid_index = GID_INDEX as u8;
        qp_attr.ah_attr.grh.hop_limit = 10;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        let ret = unsafe { ibv_modify_qp(self.qp, &mut qp_attr, mask.0 as i32) };
        if ret != 0 {
            log::error!("rtr failed for remote qpn {} psn {}", remote.qpn, remote.psn);
            return Err(verbs_error("ibv_modify_qp to rtr", ret));
        }

        qp_attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        qp_attr.timeout = 14;
        qp_attr.retry_cnt = 7;
        qp_attr.rnr_retry = 7;
        qp_attr.sq_psn = my_psn;
        qp_attr.max_rd_atomic = 1;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        let ret = unsafe { ibv_modify_qp(self.qp, &mut qp_attr, mask.0 as i32) };
        if ret != 0 {
            return Err(verbs_error("ibv_modify_qp to rts", ret));
        }
        Ok(())
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        unsafe { ibv_destroy_qp(self.qp) };
    }
}

/// Side channel that carries the [`RemoteHandle`] trade.
enum Handshake {
    Listen(TcpListener),
    Dial(SocketAddr),
}

impl Handshake {
    fn stream(&self) -> Result<TcpStream> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        match self {
            Handshake::Listen(listener) => {
                listener.set_nonblocking(true)?;
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            log::debug!("verbs handshake from {}", peer);
                            stream.set_nonblocking(false)?;
                            return Ok(stream);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                            std::thread::sleep(CONNECT_RETRY);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Err(FabtestError::Timeout),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Handshake::Dial(addr) => loop {
                match TcpStream::connect(addr) {
                    Ok(stream) => return Ok(stream),
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused && Instant::now() < deadline => {
                        std::thread::sleep(CONNECT_RETRY);
                    }
                    Err(e) => return Err(FabtestError::setup(format!("verbs handshake to {}: {}", addr, e), -libc::ECONNREFUSED)),
                }
            },
        }
    }
}

pub struct VerbsEndpoint {
    info: FabricInfo,
    device: Rc<Device>,
    qp: QueuePair,
    psn: u32,
    tx_lane: Rc<RefCell<CqLane>>,
    handshake: Option<Handshake>,
}

impl VerbsEndpoint {
    fn local_handle(&self) -> Result<RemoteHandle> {
        let gid = self.device.gid()?;
        let (subnet, interface) = unsafe { (gid.global.subnet_prefix, gid.global.interface_id) };
        Ok(RemoteHandle { qpn: self.qp.qpn(), gid_subnet_ids: subnet, gid_interface_ids: interface, psn: self.psn })
    }

    fn try_post_send(&mut self, wr: &mut ibv_send_wr) -> i32 {
        let mut bad_wr: *mut ibv_send_wr = null_mut();
        unsafe { ibv_post_send(self.qp.qp, wr, &mut bad_wr) }
    }
}

impl crate::provider::Endpoint for VerbsEndpoint {
    fn info(&self) -> &FabricInfo {
        &self.info
    }

    fn connect(&mut self) -> Result<()> {
        let handshake = self
            .handshake
            .take()
            .ok_or_else(|| FabtestError::Protocol("verbs endpoint already connected".to_string()))?;
        let local = self.local_handle()?;
        let mut stream = handshake.stream()?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.write_all(&bincode::serialize(&local)?)?;
        let mut buffer = vec![0u8; RemoteHandle::wire_size()];
        stream.read_exact(&mut buffer)?;
        let remote: RemoteHandle = bincode::deserialize(&buffer)?;
        log::debug!("{} qpn {} connecting to remote qpn {}", self.device.name, local.qpn, remote.qpn);
        self.qp.connect(&remote, self.psn)?;
        // Neither side sends before the peer reached RTR.
        stream.write_all(&[1])?;
        stream.read_exact(&mut [0u8; 1])?;
        Ok(())
    }

    fn name(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.local_handle()?)?)
    }

    fn av_insert(&mut self, _addr: &[u8]) -> Result<FiAddr> {
        Err(FabtestError::NotImplemented("connected verbs endpoints have no address vector".to_string()))
    }

    fn register(&mut self, iov: Iov, access: MrAccess, _requested_key: u64) -> Result<Box<dyn MemoryRegion>> {
        let mut flags = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0;
        if access.contains(MrAccess::REMOTE_WRITE) {
            flags |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
        }
        if access.contains(MrAccess::REMOTE_READ) {
            flags |= ibv_access_flags::IBV_ACCESS_REMOTE_READ.0;
        }
        let mr = unsafe { ibv_reg_mr(self.device.pd, iov.addr as *mut libc::c_void, iov.len, flags as i32) };
        if mr.is_null() {
            return Err(FabtestError::Registration { code: -errno() });
        }
        Ok(Box::new(VerbsRegion { mr, _device: self.device.clone() }))
    }

    fn post_tx(&mut self, req: TxRequest) -> Result<()> {
        let lkey = req.desc.0.ok_or_else(|| FabtestError::PostFailed { op: req.op.name(), code: -libc::EINVAL })?;
        let mut sge = ibv_sge { addr: req.iov.addr, length: req.iov.len as u32, lkey: lkey as u32 };
        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = req.context;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        if req.op.is_inject() {
            wr.wr_id |= INJECT_WR;
            wr.send_flags |= ibv_send_flags::IBV_SEND_INLINE.0;
        }
        let remote = match req.op {
            TxOp::Send | TxOp::Inject => {
                wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
                None
            }
            TxOp::Write(remote) | TxOp::InjectWrite(remote) => {
                wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
                Some(remote)
            }
            TxOp::WriteData(remote, data) | TxOp::InjectWriteData(remote, data) => {
                wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
                wr.__bindgen_anon_1.imm_data = (data as u32).to_be();
                Some(remote)
            }
            TxOp::Read(remote) => {
                wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
                Some(remote)
            }
        };
        if let Some(remote) = remote {
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.key as u32;
        }

        let mut ret = self.try_post_send(&mut wr);
        if ret == libc::ENOMEM {
            // inject completions are never read by the caller, so reap them here
            self.tx_lane.borrow_mut().poll()?;
            ret = self.try_post_send(&mut wr);
        }
        match ret {
            0 => Ok(()),
            libc::ENOMEM => Err(FabtestError::TransientBusy),
            code => Err(FabtestError::PostFailed { op: req.op.name(), code: -code }),
        }
    }

    fn post_rx(&mut self, req: RxRequest) -> Result<()> {
        let lkey = req.desc.0.ok_or_else(|| FabtestError::PostFailed { op: "fi_recv", code: -libc::EINVAL })?;
        let mut sge = ibv_sge { addr: req.iov.addr, length: req.iov.len as u32, lkey: lkey as u32 };
        let mut wr = ibv_recv_wr { wr_id: req.context, next: null_mut(), sg_list: &mut sge, num_sge: 1 };
        let mut bad_wr: *mut ibv_recv_wr = null_mut();
        match unsafe { ibv_post_recv(self.qp.qp, &mut wr, &mut bad_wr) } {
            0 => Ok(()),
            libc::ENOMEM => Err(FabtestError::TransientBusy),
            code => Err(FabtestError::PostFailed { op: "fi_recv", code: -code }),
        }
    }
}

pub struct VerbsRegion {
    mr: *mut ibv_mr,
    _device: Rc<Device>,
}

impl MemoryRegion for VerbsRegion {
    fn key(&self) -> u64 {
        unsafe { (*self.mr).rkey as u64 }
    }

    fn desc(&self) -> MrDesc {
        MrDesc(Some(unsafe { (*self.mr).lkey as u64 }))
    }
}

impl Drop for VerbsRegion {
    fn drop(&mut self) {
        unsafe { ibv_dereg_mr(self.mr) };
    }
}

pub struct VerbsQueue {
    lane: Rc<RefCell<CqLane>>,
}

impl CompletionQueue for VerbsQueue {
    fn read(&mut self) -> Result<CqRead> {
        let mut lane = self.lane.borrow_mut();
        if lane.pending.is_empty() {
            lane.poll()?;
        }
        match lane.pending.front() {
            None => Ok(CqRead::Empty),
            Some(Err(_)) => Ok(CqRead::ErrorAvailable),
            Some(Ok(_)) => Ok(lane.pending.pop_front().and_then(|c| c.ok()).map_or(CqRead::Empty, CqRead::Entry)),
        }
    }

    fn sread(&mut self, timeout: Timeout) -> Result<CqRead> {
        let start = Instant::now();
        loop {
            let read = self.read()?;
            if read != CqRead::Empty {
                return Ok(read);
            }
            let left = match timeout.0 {
                None => Timeout::INFINITE,
                Some(window) if start.elapsed() >= window => return Ok(CqRead::Empty),
                Some(window) => Timeout(Some(window - start.elapsed())),
            };
            if self.trywait()? {
                if let Some(fd) = self.wait_fd() {
                    poll_fd(fd, left)?;
                }
            }
        }
    }

    fn readerr(&mut self) -> Result<CqErrEntry> {
        let mut lane = self.lane.borrow_mut();
        match lane.pending.pop_front() {
            Some(Err(entry)) => Ok(entry),
            Some(Ok(entry)) => {
                lane.pending.push_front(Ok(entry));
                Err(FabtestError::Protocol("no error entry at the head of the queue".to_string()))
            }
            None => Err(FabtestError::Protocol("no error entry available".to_string())),
        }
    }

    fn trywait(&mut self) -> Result<bool> {
        let mut lane = self.lane.borrow_mut();
        if !lane.pending.is_empty() {
            return Ok(false);
        }
        if !lane.armed {
            let ret = unsafe { ibv_req_notify_cq(lane.cq.cq, 0) };
            if ret != 0 {
                return Err(verbs_error("ibv_req_notify_cq", ret));
            }
            lane.armed = true;
        }
        // completions that raced the arm never raise an event
        Ok(lane.poll()? == 0 && lane.pending.is_empty())
    }

    fn wait_fd(&self) -> Option<RawFd> {
        Some(unsafe { (*self.lane.borrow().cq.channel).fd })
    }
}

/// Hardware provider over the first active port of each RDMA device.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerbsProvider;

impl VerbsProvider {
    const CAPS: Caps = Caps::MSG
        .union(Caps::RMA)
        .union(Caps::READ)
        .union(Caps::WRITE)
        .union(Caps::RECV)
        .union(Caps::SEND)
        .union(Caps::REMOTE_READ)
        .union(Caps::REMOTE_WRITE);
}

fn resolve(node: &str, service: &str) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    let port: u16 = service
        .parse()
        .map_err(|_| FabtestError::Config(format!("service {:?} is not a port number", service)))?;
    (node, port)
        .to_socket_addrs()
        .map_err(|e| FabtestError::setup(format!("resolving {}:{}: {}", node, port, e), -libc::ENODATA))?
        .next()
        .ok_or_else(|| FabtestError::setup(format!("{} has no addresses", node), -libc::ENODATA))
}

impl Provider for VerbsProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn getinfo(&self, node: Option<&str>, service: Option<&str>, flags: InfoFlags, hints: &Hints) -> Result<Vec<FabricInfo>> {
        if hints.ep_type != EpType::Msg || !VerbsProvider::CAPS.contains(hints.caps) {
            return Ok(Vec::new());
        }
        // every buffer handed to the device must be registered
        if !hints.mode.contains(Mode::LOCAL_MR) && !hints.caps.contains(Caps::RMA) {
            return Ok(Vec::new());
        }
        let service = service.unwrap_or(crate::config::DEFAULT_DATA_PORT);
        let (src_addr, dest_addr) = if flags.contains(InfoFlags::SOURCE) {
            (Some(UdpAddressHandle::encode(resolve(node.unwrap_or("0.0.0.0"), service)?)?), None)
        } else if let Some(node) = node {
            (None, Some(UdpAddressHandle::encode(resolve(node, service)?)?))
        } else {
            (None, None)
        };
        let caps = if hints.caps.is_empty() { VerbsProvider::CAPS } else { hints.caps };
        let infos = active_devices()?
            .into_iter()
            .filter(|name| hints.fabric_name.as_deref().map_or(true, |f| f.is_empty() || f == name))
            .map(|name| FabricInfo {
                provider_name: PROVIDER_NAME.to_string(),
                fabric_name: name,
                caps,
                mode: hints.mode & Mode::LOCAL_MR,
                ep_type: EpType::Msg,
                av_type: hints.av_type,
                mr_mode: hints.mr_mode,
                protocol: hints.protocol,
                protocol_version: 1,
                max_msg_size: MAX_MSG_SIZE,
                msg_prefix_size: 0,
                inject_size: INLINE_SIZE,
                tx_size: QUEUE_SIZE,
                rx_size: QUEUE_SIZE,
                cq_data_size: CQ_DATA_SIZE,
                src_addr: src_addr.clone(),
                dest_addr: dest_addr.clone(),
            })
            .collect();
        Ok(infos)
    }

    fn open(&self, info: &FabricInfo, req: &ResourceRequest) -> Result<Resources> {
        if matches!(req.wait_obj, WaitObj::Set | WaitObj::MutexCond) {
            return Err(FabtestError::NotImplemented(format!("verbs wait object {:?}", req.wait_obj)));
        }
        if req.tx == Some(CompletionKind::Counter) || req.rx == Some(CompletionKind::Counter) {
            return Err(FabtestError::NotImplemented("verbs completion counters".to_string()));
        }
        let handshake = match (&info.src_addr, &info.dest_addr) {
            (Some(src), _) => {
                let addr = UdpAddressHandle::decode(src)?;
                let listener = TcpListener::bind(addr)
                    .map_err(|e| FabtestError::setup(format!("binding verbs handshake to {}: {}", addr, e), -libc::EADDRINUSE))?;
                Handshake::Listen(listener)
            }
            (None, Some(dest)) => Handshake::Dial(UdpAddressHandle::decode(dest)?),
            (None, None) => return Err(FabtestError::setup("verbs endpoint needs a source or destination", -libc::EINVAL)),
        };

        let device = Rc::new(Device::open(&info.fabric_name)?);
        let send_cq = Rc::new(Cq::new(device.clone())?);
        let recv_cq = Rc::new(Cq::new(device.clone())?);
        let qp = QueuePair::new(&device, send_cq.clone(), recv_cq.clone())?;
        let psn = rand::random::<u32>() & 0xff_ffff;
        log::debug!("{} opened qpn {} psn {}", device.name, qp.qpn(), psn);

        let tx_lane = Rc::new(RefCell::new(CqLane::new(send_cq)));
        let rx_lane = Rc::new(RefCell::new(CqLane::new(recv_cq)));
        let source = |kind: Option<CompletionKind>, lane: &Rc<RefCell<CqLane>>| match kind {
            Some(_) => CompletionSource::Queue(Box::new(VerbsQueue { lane: lane.clone() })),
            None => CompletionSource::Absent,
        };
        let tx = source(req.tx, &tx_lane);
        let rx = source(req.rx, &rx_lane);
        let endpoint = VerbsEndpoint { info: info.clone(), device, qp, psn, tx_lane, handshake: Some(handshake) };
        Ok(Resources { endpoint: Box::new(endpoint), tx, rx })
    }
}
