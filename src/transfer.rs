use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::buffer::MessageBuffers;
use crate::config::Timeout;
use crate::error::{FabtestError, Result};
use crate::provider::{Caps, Direction, Endpoint, OpFlags, RmaIov, RxRequest, TxOp, TxRequest};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RmaOp {
    Write,
    WriteData,
    Read,
}

/// RMA operations that can be posted as inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmaInjectOp {
    Write,
    WriteData,
}

impl FromStr for RmaOp {
    type Err = FabtestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "write" => Ok(RmaOp::Write),
            "writedata" => Ok(RmaOp::WriteData),
            "read" => Ok(RmaOp::Read),
            other => Err(FabtestError::Config(format!("unknown rma op {}", other))),
        }
    }
}

impl Display for RmaOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RmaOp::Write => write!(f, "write"),
            RmaOp::WriteData => write!(f, "writedata"),
            RmaOp::Read => write!(f, "read"),
        }
    }
}

impl Session {
    /// Runs `post` until the provider accepts it. Resource exhaustion is
    /// resolved by reaping completed work on `dir`; any other failure is
    /// returned. Returns the issued sequence number.
    pub fn post_with_retry<F>(&mut self, dir: Direction, op: &'static str, mut post: F) -> Result<u64>
    where
        F: FnMut(&mut dyn Endpoint, &MessageBuffers) -> Result<()>,
    {
        loop {
            match post(self.endpoint.as_mut(), &self.buffers) {
                Ok(()) => break,
                Err(FabtestError::TransientBusy) => {
                    if let Err(e) = self.tracker.drain(dir) {
                        log::error!("Failed to get {} completion: {}", op, e);
                        return Err(e);
                    }
                }
                Err(e) => {
                    log::error!("{}: {}", op, e);
                    return Err(e);
                }
            }
        }
        Ok(self.tracker.issue(dir))
    }

    fn tag(&self, dir: Direction) -> Option<u64> {
        if self.info.caps.contains(Caps::TAGGED) {
            Some(self.tracker.issued(dir))
        } else {
            None
        }
    }

    fn remote_rma_iov(&self) -> Result<RmaIov> {
        self.remote_rma
            .ok_or_else(|| FabtestError::Protocol("RMA keys have not been exchanged".to_string()))
    }

    pub(crate) fn fill_tx(&mut self, size: usize) {
        if self.verifying() {
            let payload = self.buffers.tx_payload_mut(size);
            self.pattern.fill(payload);
        }
    }

    /// Posts a send of `size` payload bytes from the transmit zone.
    pub fn post_tx(&mut self, size: usize) -> Result<u64> {
        self.post_tx_flags(size, OpFlags::empty())
    }

    pub(crate) fn post_tx_flags(&mut self, size: usize, flags: OpFlags) -> Result<u64> {
        let tag = self.tag(Direction::Tx);
        let context = self.tracker.issued(Direction::Tx);
        let dest = self.remote_addr;
        self.post_with_retry(Direction::Tx, "transmit", |ep, bufs| {
            ep.post_tx(TxRequest {
                op: TxOp::Send,
                iov: bufs.tx_iov(size),
                desc: bufs.desc(),
                dest,
                context,
                tag,
                flags,
            })
        })
    }

    /// Sends `size` bytes and waits for the local completion.
    pub fn tx(&mut self, size: usize) -> Result<()> {
        self.fill_tx(size);
        let seq = self.post_tx(size)?;
        self.get_tx_comp(seq)
    }

    /// Inject send; the buffer is reusable on return and no completion is reported.
    pub fn post_inject(&mut self, size: usize) -> Result<()> {
        let tag = self.tag(Direction::Tx);
        let context = self.tracker.issued(Direction::Tx);
        let dest = self.remote_addr;
        self.post_with_retry(Direction::Tx, "inject", |ep, bufs| {
            ep.post_tx(TxRequest {
                op: TxOp::Inject,
                iov: bufs.tx_iov(size),
                desc: bufs.desc(),
                dest,
                context,
                tag,
                flags: OpFlags::INJECT,
            })
        })?;
        self.tracker.mark_completed(Direction::Tx);
        Ok(())
    }

    pub fn inject(&mut self, size: usize) -> Result<()> {
        self.fill_tx(size);
        self.post_inject(size)
    }

    pub fn post_rma(&mut self, op: RmaOp, size: usize) -> Result<u64> {
        let remote = self.remote_rma_iov()?;
        let data = self.remote_cq_data;
        let context = self.tracker.issued(Direction::Tx);
        let dest = self.remote_addr;
        let (tx_op, name) = match op {
            RmaOp::Write => (TxOp::Write(remote), "fi_write"),
            RmaOp::WriteData => (TxOp::WriteData(remote, data), "fi_writedata"),
            RmaOp::Read => (TxOp::Read(remote), "fi_read"),
        };
        self.post_with_retry(Direction::Tx, name, |ep, bufs| {
            let iov = match op {
                RmaOp::Read => bufs.rx_rma_iov(size),
                RmaOp::Write | RmaOp::WriteData => bufs.tx_rma_iov(size),
            };
            let flags = match op {
                RmaOp::WriteData => OpFlags::REMOTE_CQ_DATA,
                _ => OpFlags::empty(),
            };
            ep.post_tx(TxRequest { op: tx_op, iov, desc: bufs.desc(), dest, context, tag: None, flags })
        })
    }

    /// Completes one RMA operation. Write-with-data also consumes the
    /// receive completion produced by the peer's matching write.
    pub fn rma(&mut self, op: RmaOp, size: usize) -> Result<()> {
        let seq = self.post_rma(op, size)?;
        if op == RmaOp::WriteData {
            self.rx(0)?;
        }
        self.get_tx_comp(seq)
    }

    pub fn post_rma_inject(&mut self, op: RmaInjectOp, size: usize) -> Result<()> {
        let remote = self.remote_rma_iov()?;
        let data = self.remote_cq_data;
        let dest = self.remote_addr;
        let (tx_op, name) = match op {
            RmaInjectOp::Write => (TxOp::InjectWrite(remote), "fi_inject_write"),
            RmaInjectOp::WriteData => (TxOp::InjectWriteData(remote, data), "fi_inject_writedata"),
        };
        self.post_with_retry(Direction::Tx, name, |ep, bufs| {
            ep.post_tx(TxRequest {
                op: tx_op,
                iov: bufs.tx_rma_iov(size),
                desc: bufs.desc(),
                dest,
                context: 0,
                tag: None,
                flags: OpFlags::INJECT,
            })
        })?;
        self.tracker.mark_completed(Direction::Tx);
        Ok(())
    }

    /// Posts a receive big enough for `size` bytes, and never smaller than a
    /// control message.
    pub fn post_rx(&mut self, size: usize) -> Result<u64> {
        let tag = self.tag(Direction::Rx);
        let context = self.tracker.issued(Direction::Rx);
        self.post_with_retry(Direction::Rx, "receive", |ep, bufs| {
            ep.post_rx(RxRequest { iov: bufs.rx_iov(size), desc: bufs.desc(), context, tag })
        })
    }

    /// Waits for the outstanding receive, checks `size` payload bytes when
    /// verifying, then reposts a receive sized for any message.
    pub fn rx(&mut self, size: usize) -> Result<()> {
        let seq = self.tracker.issued(Direction::Rx);
        self.get_rx_comp(seq)?;
        if self.verifying() {
            let payload = self.buffers.rx_payload(size);
            self.pattern.check(payload)?;
        }
        let next = self.buffers.rx_size();
        self.post_rx(next)?;
        Ok(())
    }

    /// Transmit waits never time out.
    pub fn get_tx_comp(&mut self, target: u64) -> Result<()> {
        self.tracker.await_through(Direction::Tx, target, Timeout::INFINITE)
    }

    pub fn get_rx_comp(&mut self, target: u64) -> Result<()> {
        let timeout = self.opts.timeout;
        self.tracker.await_through(Direction::Rx, target, timeout)
    }

    /// Payload length of the last receive completion. Counters carry none.
    pub(crate) fn last_rx_len(&self) -> Option<usize> {
        self.tracker
            .last_completion(Direction::Rx)
            .map(|entry| entry.len.saturating_sub(self.buffers.rx_prefix()))
    }
}
