//! The substrate service boundary and the in-process reference substrate.
//!
//! The engine treats the underlying transport as a black box offering
//! reliable delivery of discrete messages plus a non-blocking probe for the
//! next arrival. The probe-then-consume pair is collapsed into a single
//! [`Substrate::poll`], called only under the domain's poll lock.
//!
//! [`InprocHub`] wires any number of in-process ports together and is what
//! the integration tests (and single-process deployments) run on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A resolved, routable peer identity handed out by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr(pub u64);

/// The reliable message-passing service the engine builds on.
pub trait Substrate: Send + Sync {
    /// The local port's own address, as peers see it.
    fn local_addr(&self) -> PeerAddr;

    /// Post one message for reliable delivery to `dest`.
    fn post(&self, dest: PeerAddr, msg: Vec<u8>) -> Result<()>;

    /// Consume the next completed arrival, if any.
    ///
    /// Callers must serialize invocations per port; the domain's poll lock
    /// does so.
    fn poll(&self) -> Option<(PeerAddr, Vec<u8>)>;
}

type Inbox = Arc<Mutex<VecDeque<(PeerAddr, Vec<u8>)>>>;

/// In-process substrate: a shared map of ports with locked inboxes.
pub struct InprocHub {
    ports: Mutex<HashMap<u64, Inbox>>,
    next: AtomicU64,
}

impl InprocHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        })
    }

    /// Open a new port on the hub.
    pub fn open_port(self: &Arc<Self>) -> InprocPort {
        let addr = PeerAddr(self.next.fetch_add(1, Ordering::Relaxed));
        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        self.ports.lock().insert(addr.0, inbox.clone());
        InprocPort {
            hub: self.clone(),
            addr,
            inbox,
        }
    }
}

/// One endpoint of the in-process substrate.
pub struct InprocPort {
    hub: Arc<InprocHub>,
    addr: PeerAddr,
    inbox: Inbox,
}

impl Substrate for InprocPort {
    fn local_addr(&self) -> PeerAddr {
        self.addr
    }

    fn post(&self, dest: PeerAddr, msg: Vec<u8>) -> Result<()> {
        let inbox = self
            .hub
            .ports
            .lock()
            .get(&dest.0)
            .cloned()
            .ok_or(Error::Unreachable(dest))?;
        inbox.lock().push_back((self.addr, msg));
        Ok(())
    }

    fn poll(&self) -> Option<(PeerAddr, Vec<u8>)> {
        self.inbox.lock().pop_front()
    }
}

impl Drop for InprocPort {
    fn drop(&mut self) {
        self.hub.ports.lock().remove(&self.addr.0);
    }
}
