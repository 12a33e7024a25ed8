use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{FabtestError, Result};
use crate::provider::{Caps, Endpoint, Iov, MemoryRegion, Mode, MrAccess, MrDesc, MrMode, RmaIov};

/// Largest in-band control message: address, key descriptor, sync byte, "fin".
pub const CTRL_MSG_MIN: usize = 64;
pub const MR_KEY: u64 = 0xC0DE;

const MSG_MR_ACCESS: MrAccess = MrAccess::SEND.union(MrAccess::RECV);
const RMA_MR_ACCESS: MrAccess = MrAccess::READ
    .union(MrAccess::WRITE)
    .union(MrAccess::REMOTE_READ)
    .union(MrAccess::REMOTE_WRITE);

/// Access rights implied by the capability set. Explicit access bits in
/// `caps` narrow the default for their class.
pub fn caps_to_mr_access(caps: Caps) -> MrAccess {
    let explicit = MrAccess::from_bits_truncate(caps.bits());
    let mut access = MrAccess::empty();
    if caps.intersects(Caps::MSG | Caps::TAGGED) {
        if explicit.intersects(MSG_MR_ACCESS) {
            access |= explicit & MSG_MR_ACCESS;
        } else {
            access |= MSG_MR_ACCESS;
        }
    }
    if caps.intersects(Caps::RMA | Caps::ATOMIC) {
        if explicit.intersects(RMA_MR_ACCESS) {
            access |= explicit & RMA_MR_ACCESS;
        } else {
            access |= RMA_MR_ACCESS;
        }
    }
    access
}

pub fn page_size() -> Result<usize> {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(ret as usize)
}

/// Zeroed heap allocation with a fixed alignment.
pub struct AlignedRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedRegion {
    pub fn new(size: usize, align: usize) -> Result<AlignedRegion> {
        let layout = Layout::from_size_align(size.max(1), align.max(1))
            .map_err(|_| FabtestError::Allocation { size })?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(FabtestError::Allocation { size })?;
        Ok(AlignedRegion { ptr, layout })
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedRegion {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Combined receive and transmit zones of one session.
///
/// The receive zone starts the region, the transmit zone follows it. Each
/// zone begins with the provider prefix when the endpoint runs in prefix mode.
pub struct MessageBuffers {
    // Deregistered before the memory it covers is freed.
    registration: Option<Box<dyn MemoryRegion>>,
    region: AlignedRegion,
    tx_offset: usize,
    tx_size: usize,
    rx_size: usize,
    tx_prefix: usize,
    rx_prefix: usize,
    scalable: bool,
}

impl MessageBuffers {
    pub fn allocate(ep: &mut dyn Endpoint, requested: usize, align: bool, skip_mr: bool) -> Result<MessageBuffers> {
        let info = ep.info().clone();
        let tx_prefix = info.tx_prefix_size();
        let rx_prefix = info.rx_prefix_size();

        let mut tx_size = requested.min(info.max_msg_size);
        let rx_size = tx_size + rx_prefix;
        tx_size += tx_prefix;

        let alignment = if align { page_size()? } else { 1 };
        let mut buf_size = tx_size.max(CTRL_MSG_MIN) + rx_size.max(CTRL_MSG_MIN);
        if align {
            buf_size += alignment;
        }
        let region = AlignedRegion::new(buf_size, alignment)?;

        let base = region.addr() as usize;
        let unaligned_tx = base + rx_size.max(CTRL_MSG_MIN);
        let tx_offset = ((unaligned_tx + alignment - 1) & !(alignment - 1)) - base;

        let registration = if !skip_mr && (info.mode.contains(Mode::LOCAL_MR) || info.caps.intersects(Caps::RMA | Caps::ATOMIC)) {
            let iov = Iov { addr: region.addr(), len: region.len() };
            let mr = ep
                .register(iov, caps_to_mr_access(info.caps), MR_KEY)
                .map_err(|e| FabtestError::Registration { code: e.code() })?;
            Some(mr)
        } else {
            None
        };

        log::debug!(
            "allocated {} bytes: rx 0..{} tx {}..{} registered {}",
            buf_size,
            rx_size.max(CTRL_MSG_MIN),
            tx_offset,
            buf_size,
            registration.is_some()
        );

        Ok(MessageBuffers {
            registration,
            region,
            tx_offset,
            tx_size,
            rx_size,
            tx_prefix,
            rx_prefix,
            scalable: info.mr_mode == MrMode::Scalable,
        })
    }

    /// Transmit size including the prefix.
    pub fn tx_size(&self) -> usize {
        self.tx_size
    }

    /// Receive size including the prefix.
    pub fn rx_size(&self) -> usize {
        self.rx_size
    }

    /// Largest payload a single message may carry.
    pub fn max_payload(&self) -> usize {
        self.tx_size - self.tx_prefix
    }

    pub fn tx_prefix(&self) -> usize {
        self.tx_prefix
    }

    pub fn rx_prefix(&self) -> usize {
        self.rx_prefix
    }

    pub fn desc(&self) -> MrDesc {
        self.registration.as_ref().map(|mr| mr.desc()).unwrap_or(MrDesc::NONE)
    }

    pub fn key(&self) -> u64 {
        self.registration.as_ref().map(|mr| mr.key()).unwrap_or(0)
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    fn tx_zone_len(&self) -> usize {
        self.region.len() - self.tx_offset
    }

    /// Payload bytes the transmit zone holds after the prefix.
    pub fn tx_payload_capacity(&self) -> usize {
        self.tx_zone_len().saturating_sub(self.tx_prefix)
    }

    fn rx_zone_len(&self) -> usize {
        self.rx_size.max(CTRL_MSG_MIN)
    }

    pub fn tx_addr(&self) -> u64 {
        self.region.addr() + self.tx_offset as u64
    }

    pub fn rx_addr(&self) -> u64 {
        self.region.addr()
    }

    /// Span posted for a send of `payload` bytes, prefix included.
    pub fn tx_iov(&self, payload: usize) -> Iov {
        Iov { addr: self.tx_addr(), len: (payload + self.tx_prefix).min(self.tx_zone_len()) }
    }

    /// Span posted for a receive of up to `size` bytes. Never smaller than a
    /// control message, never past the receive zone.
    pub fn rx_iov(&self, size: usize) -> Iov {
        Iov { addr: self.rx_addr(), len: (size.max(CTRL_MSG_MIN) + self.rx_prefix).min(self.rx_zone_len()) }
    }

    /// Local source of an RMA write.
    pub fn tx_rma_iov(&self, len: usize) -> Iov {
        Iov { addr: self.tx_addr(), len: len.min(self.tx_zone_len()) }
    }

    /// Local target of an RMA read.
    pub fn rx_rma_iov(&self, len: usize) -> Iov {
        Iov { addr: self.rx_addr(), len: len.min(self.rx_zone_len()) }
    }

    /// Descriptor the peer targets with RMA operations.
    pub fn local_rma_iov(&self) -> RmaIov {
        let addr = if self.scalable { 0 } else { self.rx_addr() + self.rx_prefix as u64 };
        RmaIov { addr, key: self.key() }
    }

    pub fn tx_payload_mut(&mut self, len: usize) -> &mut [u8] {
        let start = self.tx_offset + self.tx_prefix;
        let end = (start + len).min(self.region.len());
        &mut self.region.as_mut_slice()[start..end]
    }

    pub fn rx_payload(&self, len: usize) -> &[u8] {
        let start = self.rx_prefix;
        let end = (start + len).min(self.rx_zone_len());
        &self.region.as_slice()[start..end]
    }

    pub fn rx_payload_mut(&mut self, len: usize) -> &mut [u8] {
        let start = self.rx_prefix;
        let end = (start + len).min(self.rx_zone_len());
        &mut self.region.as_mut_slice()[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FabricInfo;
    use crate::testing::MockEndpoint;

    fn info(max_msg_size: usize, caps: Caps, mode: Mode) -> FabricInfo {
        FabricInfo { max_msg_size, caps, mode, msg_prefix_size: 16, ..Default::default() }
    }

    #[test]
    fn requested_size_is_clamped_to_max_msg() {
        let mut ep = MockEndpoint::new(info(4096, Caps::MSG, Mode::empty()));
        let bufs = MessageBuffers::allocate(&mut ep, 1 << 20, false, false).unwrap();
        assert_eq!(bufs.tx_size(), 4096);
        assert_eq!(bufs.rx_size(), 4096);
        assert_eq!(bufs.len(), 8192);
        assert!(!bufs.is_registered());
        assert_eq!(bufs.desc(), MrDesc::NONE);
    }

    #[test]
    fn small_transfers_still_fit_control_messages() {
        let mut ep = MockEndpoint::new(info(4096, Caps::MSG, Mode::empty()));
        let bufs = MessageBuffers::allocate(&mut ep, 1, false, false).unwrap();
        assert_eq!(bufs.len(), 2 * CTRL_MSG_MIN);
        assert_eq!(bufs.tx_addr() - bufs.rx_addr(), CTRL_MSG_MIN as u64);
        assert_eq!(bufs.rx_iov(bufs.rx_size()).len, CTRL_MSG_MIN);
    }

    #[test]
    fn prefix_space_is_reserved_in_both_zones() {
        let mut ep = MockEndpoint::new(info(4096, Caps::MSG, Mode::MSG_PREFIX));
        let bufs = MessageBuffers::allocate(&mut ep, 100, false, false).unwrap();
        assert_eq!(bufs.tx_size(), 116);
        assert_eq!(bufs.rx_size(), 116);
        assert_eq!(bufs.tx_iov(100).len, 116);
        assert_eq!(bufs.local_rma_iov().addr, bufs.rx_addr() + 16);
        assert_eq!(bufs.rx_payload(4).as_ptr() as u64, bufs.rx_addr() + 16);
    }

    #[test]
    fn aligned_transmit_zone_starts_on_a_page() {
        let mut ep = MockEndpoint::new(info(1 << 16, Caps::MSG, Mode::empty()));
        let bufs = MessageBuffers::allocate(&mut ep, 1000, true, false).unwrap();
        let page = page_size().unwrap() as u64;
        assert_eq!(bufs.rx_addr() % page, 0);
        assert_eq!(bufs.tx_addr() % page, 0);
        assert!(bufs.tx_addr() + bufs.tx_size() as u64 <= bufs.rx_addr() + bufs.len() as u64);
    }

    #[test]
    fn rma_caps_register_with_remote_access() {
        let mut ep = MockEndpoint::new(info(4096, Caps::MSG | Caps::RMA, Mode::empty()));
        let bufs = MessageBuffers::allocate(&mut ep, 64, false, false).unwrap();
        assert!(bufs.is_registered());
        assert_eq!(bufs.key(), MR_KEY);
        let regs = ep.registrations();
        assert_eq!(regs.len(), 1);
        assert!(regs[0].contains(MrAccess::REMOTE_WRITE | MrAccess::SEND));
        assert_eq!(bufs.local_rma_iov().addr, bufs.rx_addr());
    }

    #[test]
    fn skip_mr_leaves_memory_unregistered() {
        let mut ep = MockEndpoint::new(info(4096, Caps::RMA, Mode::LOCAL_MR));
        let bufs = MessageBuffers::allocate(&mut ep, 64, false, true).unwrap();
        assert!(!bufs.is_registered());
        assert_eq!(bufs.key(), 0);
    }

    #[test]
    fn explicit_access_bits_override_defaults() {
        let access = caps_to_mr_access(Caps::RMA | Caps::REMOTE_READ);
        assert_eq!(access, MrAccess::REMOTE_READ);
        let access = caps_to_mr_access(Caps::TAGGED | Caps::RMA);
        assert_eq!(access, MSG_MR_ACCESS | RMA_MR_ACCESS);
        assert!(caps_to_mr_access(Caps::empty()).is_empty());
    }
}
