//! In-band control exchanges built on the transfer primitives.

use crate::error::{FabtestError, Result};
use crate::provider::{Direction, EpType, OpFlags, RmaIov};
use crate::session::{Role, Session};

const FIN: &[u8; 4] = b"fin\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RendezvousState {
    Init,
    AddressExchange,
    KeyExchange,
    Steady,
    Finalize,
    Closed,
}

impl RendezvousState {
    fn allows(self, next: RendezvousState) -> bool {
        use RendezvousState::*;
        matches!(
            (self, next),
            (Init, AddressExchange)
                | (AddressExchange, KeyExchange)
                | (AddressExchange | KeyExchange | Steady, Steady)
                | (AddressExchange | KeyExchange | Steady, Finalize)
                | (Finalize, Closed)
        )
    }
}

impl Session {
    fn enter(&mut self, next: RendezvousState) -> Result<()> {
        if !self.state.allows(next) {
            return Err(FabtestError::Protocol(format!("{:?} cannot follow {:?}", next, self.state)));
        }
        self.state = next;
        Ok(())
    }

    /// Resolves the peer into the address vector.
    ///
    /// The initiator inserts its configured destination, sends its own
    /// address and waits for a one byte acknowledgement. The responder
    /// receives that address, inserts it, then acknowledges. Connected
    /// endpoints finish their connection instead.
    pub fn exchange_addresses(&mut self) -> Result<()> {
        self.enter(RendezvousState::AddressExchange)?;
        if self.info.ep_type == EpType::Msg {
            self.endpoint.connect()?;
            self.remote_addr = crate::provider::FiAddr(0);
            return Ok(());
        }
        match self.role {
            Role::Initiator => {
                let dest = self
                    .info
                    .dest_addr
                    .clone()
                    .ok_or_else(|| FabtestError::setup("no destination address to connect to", -libc::EINVAL))?;
                self.remote_addr = self
                    .endpoint
                    .av_insert(&dest)
                    .map_err(|e| FabtestError::setup(format!("fi_av_insert: {}", e), e.code()))?;
                let name = self.endpoint.name()?;
                if name.len() > self.buffers.tx_payload_capacity() {
                    return Err(FabtestError::setup("local address does not fit a control message", -libc::EMSGSIZE));
                }
                self.buffers.tx_payload_mut(name.len()).copy_from_slice(&name);
                self.tx(name.len())?;
                self.rx(1)?;
            }
            Role::Responder => {
                let seq = self.tracker.issued(Direction::Rx);
                self.get_rx_comp(seq)?;
                let len = self.last_rx_len().unwrap_or(self.buffers.rx_size());
                let peer = self.buffers.rx_payload(len).to_vec();
                let next = self.buffers.rx_size();
                self.post_rx(next)?;
                self.remote_addr = self
                    .endpoint
                    .av_insert(&peer)
                    .map_err(|e| FabtestError::setup(format!("fi_av_insert: {}", e), e.code()))?;
                self.tx(1)?;
            }
        }
        log::debug!("session {} resolved peer as {:?}", self.id(), self.remote_addr);
        Ok(())
    }

    /// Trades (address, key) descriptors of the registered receive zone.
    pub fn exchange_keys(&mut self) -> Result<()> {
        self.enter(RendezvousState::KeyExchange)?;
        let local = bincode::serialize(&self.buffers.local_rma_iov())?;
        match self.role {
            Role::Initiator => {
                self.buffers.tx_payload_mut(local.len()).copy_from_slice(&local);
                self.tx(local.len())?;
                self.receive_key(local.len())?;
            }
            Role::Responder => {
                self.receive_key(local.len())?;
                self.buffers.tx_payload_mut(local.len()).copy_from_slice(&local);
                self.tx(local.len())?;
            }
        }
        Ok(())
    }

    fn receive_key(&mut self, len: usize) -> Result<()> {
        let seq = self.tracker.issued(Direction::Rx);
        self.get_rx_comp(seq)?;
        let remote: RmaIov = bincode::deserialize(self.buffers.rx_payload(len))?;
        log::debug!("session {} peer region addr {:#x} key {:#x}", self.id(), remote.addr, remote.key);
        self.remote_rma = Some(remote);
        let next = self.buffers.rx_size();
        self.post_rx(next)?;
        Ok(())
    }

    /// One byte round trip. The initiator always sends first.
    pub fn sync(&mut self) -> Result<()> {
        self.enter(RendezvousState::Steady)?;
        match self.role {
            Role::Initiator => {
                self.tx(1)?;
                self.rx(1)
            }
            Role::Responder => {
                self.rx(1)?;
                self.tx(1)
            }
        }
    }

    /// Sends "fin" with transmit-complete semantics, then waits for both the
    /// local send and the peer's own "fin" so neither side tears down early.
    pub fn finalize(&mut self) -> Result<()> {
        self.enter(RendezvousState::Finalize)?;
        self.buffers.tx_payload_mut(FIN.len()).copy_from_slice(FIN);
        let seq = self.post_tx_flags(FIN.len(), OpFlags::INJECT | OpFlags::TRANSMIT_COMPLETE)?;
        self.get_tx_comp(seq)?;
        let seq = self.tracker.issued(Direction::Rx);
        self.get_rx_comp(seq)?;
        self.state = RendezvousState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestOptions;
    use crate::provider::{Caps, FiAddr};
    use crate::testing::MockEndpoint;

    fn loopback_session(role: Role) -> Session {
        let mut info = MockEndpoint::default_info(Caps::MSG | Caps::RMA);
        info.dest_addr = Some(b"peer".to_vec());
        let ep = MockEndpoint::loopback(info);
        Session::new(ep.into_resources(), TestOptions::default().with_transfer_size(128), role).unwrap()
    }

    #[test]
    fn state_machine_is_linear() {
        use RendezvousState::*;
        assert!(Init.allows(AddressExchange));
        assert!(AddressExchange.allows(Steady));
        assert!(Steady.allows(Steady));
        assert!(!Steady.allows(KeyExchange));
        assert!(!Init.allows(Steady));
        assert!(!Closed.allows(Init));
    }

    #[test]
    fn initiator_sends_address_and_waits_for_ack() {
        let mut session = loopback_session(Role::Initiator);
        session.exchange_addresses().unwrap();
        assert_eq!(session.remote_addr(), FiAddr(0));
        assert_eq!(session.state(), RendezvousState::AddressExchange);
        assert_eq!(session.tracker().completed(Direction::Tx), 1);
        assert_eq!(session.tracker().completed(Direction::Rx), 1);
    }

    #[test]
    fn sync_before_address_exchange_is_rejected() {
        let mut session = loopback_session(Role::Initiator);
        assert!(matches!(session.sync(), Err(FabtestError::Protocol(_))));
    }

    #[test]
    fn keys_round_trip_through_the_wire_record() {
        let mut session = loopback_session(Role::Initiator);
        session.exchange_addresses().unwrap();
        session.exchange_keys().unwrap();
        assert_eq!(session.remote_rma(), Some(session.buffers().local_rma_iov()));
        session.sync().unwrap();
        session.finalize().unwrap();
        assert_eq!(session.state(), RendezvousState::Closed);
    }

    #[test]
    fn missing_destination_fails_setup() {
        let ep = MockEndpoint::loopback(MockEndpoint::default_info(Caps::MSG));
        let mut session = Session::new(ep.into_resources(), TestOptions::default(), Role::Initiator).unwrap();
        assert!(matches!(session.exchange_addresses(), Err(FabtestError::Setup { .. })));
    }
}
