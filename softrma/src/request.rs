//! In-flight request tracking and unexpected-message records.
//!
//! Each logical operation awaiting a reply owns one slot in the request
//! table; the slab key doubles as the correlation token carried on the wire.
//! A request's completion side effects are captured in its
//! [`CompletionSink`] at submit time, so finishing a request never needs the
//! endpoint back.

use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use crate::cntr::Counter;
use crate::cq::{CompFlags, CompletionQueue, CqEvent};
use crate::error::{Error, Result};
use crate::substrate::PeerAddr;

/// Token for operations that expect no reply.
pub(crate) const NO_TOKEN: u64 = u64::MAX;

/// Where and how a request reports its terminal outcome.
pub(crate) struct CompletionSink {
    pub cq: Option<Arc<CompletionQueue>>,
    pub cntr: Option<Arc<Counter>>,
    /// Whether a CQ event is wanted at all (selective completion, inject).
    pub want_event: bool,
    pub context: u64,
    pub comp_flags: CompFlags,
    /// Remote CQ data to report, if the peer supplied any.
    pub data: u64,
    pub source: Option<PeerAddr>,
}

impl CompletionSink {
    /// Produce the terminal CQ event (if requested) and tick the counter.
    ///
    /// Exactly one call per request; `code` 0 reports success, anything else
    /// an error entry.
    pub fn complete(&self, len: usize, olen: usize, code: u64) {
        if self.want_event {
            if let Some(cq) = &self.cq {
                cq.enqueue(CqEvent {
                    context: self.context,
                    flags: self.comp_flags,
                    len,
                    data: self.data,
                    tag: 0,
                    olen,
                    error: code,
                    source: self.source,
                });
            }
        }
        if let Some(cntr) = &self.cntr {
            if code == 0 {
                cntr.add(1);
            } else {
                cntr.add_err(1);
            }
        }
    }
}

/// Per-kind progress state of an in-flight request.
pub(crate) enum RequestKind {
    /// Write awaiting its acknowledgment.
    Write { len: usize },
    /// Read accumulating reply chunks.
    Read {
        dest: u64,
        requested: usize,
        received: usize,
        eom_seen: bool,
        total: usize,
    },
    /// AM-routed send awaiting its acknowledgment.
    Send { len: usize },
    /// Atomic write awaiting its acknowledgment.
    AtomicWrite { bytes: usize },
    /// Atomic fetch awaiting the pre-image reply.
    AtomicFetch { result: u64, bytes: usize },
    /// Atomic compare awaiting the pre-image reply.
    AtomicComp { result: u64, bytes: usize },
}

/// One in-flight logical operation.
pub(crate) struct Request {
    pub kind: RequestKind,
    pub sink: CompletionSink,
}

/// Slab-backed table of in-flight requests.
pub(crate) struct RequestTable {
    slab: Mutex<Slab<Request>>,
    cap: usize,
}

impl RequestTable {
    pub fn new(cap: usize) -> Self {
        Self {
            slab: Mutex::new(Slab::with_capacity(cap)),
            cap,
        }
    }

    pub fn insert(&self, request: Request) -> Result<u64> {
        let mut slab = self.slab.lock();
        if slab.len() >= self.cap {
            return Err(Error::RequestTableFull);
        }
        Ok(slab.insert(request) as u64)
    }

    pub fn remove(&self, token: u64) -> Option<Request> {
        self.slab.lock().try_remove(token as usize)
    }

    pub fn with_mut<R>(&self, token: u64, f: impl FnOnce(&mut Request) -> R) -> Option<R> {
        self.slab.lock().get_mut(token as usize).map(f)
    }

    pub fn len(&self) -> usize {
        self.slab.lock().len()
    }
}

/// A posted receive waiting for a matching message.
pub(crate) struct RecvReq {
    pub buf: u64,
    pub len: usize,
    /// Only messages from this peer match; `None` matches any sender.
    pub src: Option<PeerAddr>,
    pub sink: CompletionSink,
}

/// A received message no posted receive has claimed yet.
pub(crate) struct Unexp {
    pub sender: PeerAddr,
    /// Sender-assigned correlation token.
    pub token: u64,
    pub buf: Vec<u8>,
    pub received: usize,
    pub done: bool,
    /// Remote CQ data carried by the send, if any.
    pub data: Option<u64>,
}

/// Destination of an inbound send stream.
pub(crate) enum InboundTarget {
    Recv(RecvReq),
    Unexp(Unexp),
}

/// Reassembly state of one inbound send, keyed by (sender, token).
pub(crate) struct InboundStream {
    pub target: InboundTarget,
    pub received: usize,
    pub total: usize,
}
