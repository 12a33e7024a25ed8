use std::fmt::Display;

use crate::buffer::{MessageBuffers, CTRL_MSG_MIN};
use crate::completion::CompletionTracker;
use crate::config::TestOptions;
use crate::error::Result;
use crate::pattern::IntegrityPattern;
use crate::provider::{Endpoint, FabricInfo, FiAddr, Provider, ResourceRequest, Resources, RmaIov};
use crate::rendezvous::RendezvousState;

/// Which side of the rendezvous this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects to the peer and speaks first.
    Initiator,
    /// Listens and answers.
    Responder,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// All state of one test run against one endpoint.
///
/// Fields drop in declaration order: completion sources first, then the
/// endpoint, then the registered buffers it may still reference.
pub struct Session {
    pub(crate) tracker: CompletionTracker,
    pub(crate) endpoint: Box<dyn Endpoint>,
    pub(crate) buffers: MessageBuffers,
    pub(crate) info: FabricInfo,
    pub(crate) opts: TestOptions,
    pub(crate) role: Role,
    pub(crate) remote_addr: FiAddr,
    pub(crate) remote_rma: Option<RmaIov>,
    pub(crate) remote_cq_data: u64,
    pub(crate) pattern: IntegrityPattern,
    pub(crate) active: bool,
    pub(crate) state: RendezvousState,
    id: u32,
}

impl Session {
    /// Opens endpoint resources through `provider` and builds a session on them.
    pub fn open(provider: &dyn Provider, info: &FabricInfo, opts: TestOptions, role: Role) -> Result<Session> {
        let req = ResourceRequest {
            tx: Some(opts.comp_type),
            rx: Some(opts.comp_type),
            wait_obj: opts.comp_method.wait_obj(),
        };
        let resources = provider.open(info, &req)?;
        Session::new(resources, opts, role)
    }

    /// Allocates buffers and posts the first receive.
    pub fn new(resources: Resources, opts: TestOptions, role: Role) -> Result<Session> {
        let Resources { mut endpoint, tx, rx } = resources;
        let info = endpoint.info().clone();
        let buffers = MessageBuffers::allocate(endpoint.as_mut(), opts.transfer_size, opts.align, opts.skip_mr)?;
        let tracker = CompletionTracker::new(tx, rx, opts.comp_method);
        let mut session = Session {
            tracker,
            endpoint,
            buffers,
            remote_cq_data: info.remote_cq_data(),
            info,
            opts,
            role,
            remote_addr: FiAddr::UNSPEC,
            remote_rma: None,
            pattern: IntegrityPattern::new(),
            active: false,
            state: RendezvousState::Init,
            id: rand::random::<u32>(),
        };
        let first = session.buffers.rx_size().max(CTRL_MSG_MIN);
        session.post_rx(first)?;
        log::debug!(
            "session {} opened as {} on {} ({:?})",
            session.id,
            session.role,
            session.info.provider_name,
            session.info.ep_type
        );
        Ok(session)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn info(&self) -> &FabricInfo {
        &self.info
    }

    pub fn options(&self) -> &TestOptions {
        &self.opts
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    pub fn buffers(&self) -> &MessageBuffers {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut MessageBuffers {
        &mut self.buffers
    }

    pub fn remote_addr(&self) -> FiAddr {
        self.remote_addr
    }

    pub fn remote_rma(&self) -> Option<RmaIov> {
        self.remote_rma
    }

    pub fn remote_cq_data(&self) -> u64 {
        self.remote_cq_data
    }

    pub fn state(&self) -> RendezvousState {
        self.state
    }

    /// Pattern fill and check only run while the session is active.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn verifying(&self) -> bool {
        self.opts.verify_data && self.active
    }
}
