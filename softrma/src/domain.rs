//! The domain: shared engine state and the progress driver.
//!
//! All protocol state of one substrate port hangs off [`DomainShared`]:
//! the region registry, the request table, the pending queues, and the two
//! serialization points (the poll spin lock for claiming substrate arrivals
//! and the atomic mutex for applying atomics). Everything else is guarded
//! per object, so queues and counters on different objects never contend.
//!
//! [`DomainShared::progress`] is the single entry point that moves the
//! protocol: claim a bounded batch of arrivals under the poll lock, dispatch
//! them with no lock held, advance outbound and serving streams, then issue
//! any triggers made ready since the last call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::am::OutboundStream;
use crate::cntr::Counter;
use crate::config::DomainConfig;
use crate::cq::{CompletionQueue, CqFormat};
use crate::ep::Endpoint;
use crate::eq::{EqEvent, EqKind, EventQueue};
use crate::error::{Error, Result};
use crate::region::{MemoryRegion, MrRegistry, RegionDesc};
use crate::request::{InboundStream, RecvReq, RequestTable, Unexp};
use crate::rma::ReadStream;
use crate::substrate::{PeerAddr, Substrate};
use crate::trigger::Trigger;
use crate::wait::SpinLock;
use crate::wire::FrameHeader;

/// Engine state shared by every object opened on the domain.
pub struct DomainShared {
    pub(crate) config: DomainConfig,
    pub(crate) substrate: Arc<dyn Substrate>,
    pub(crate) mr: MrRegistry,
    pub(crate) requests: RequestTable,
    /// Posted receives not yet matched to a message.
    pub(crate) recv_queue: Mutex<VecDeque<RecvReq>>,
    /// Fully received messages awaiting a matching receive.
    pub(crate) unexp_queue: Mutex<VecDeque<Unexp>>,
    /// Inbound send reassembly, keyed by (sender, sender token).
    pub(crate) streams: Mutex<HashMap<(PeerAddr, u64), InboundStream>>,
    /// Outbound chunked writes/sends still being pumped.
    pub(crate) tx_queue: Mutex<VecDeque<OutboundStream>>,
    /// Long reads this domain is serving to peers.
    pub(crate) read_queue: Mutex<VecDeque<ReadStream>>,
    /// Triggers whose threshold has been met, awaiting issue.
    trigger_ready: Mutex<VecDeque<Trigger>>,
    /// Serializes the substrate's probe-consume sequence.
    pub(crate) poll_lock: SpinLock,
    /// Serializes atomic application against this domain's memory.
    pub(crate) atomic_lock: Mutex<()>,
    /// Endpoint whose remote counters and recv CQ take RMA-event side
    /// effects for accesses against this domain.
    pub(crate) rma_ep: Mutex<Weak<Endpoint>>,
    /// Sink for asynchronous errors with no request to charge them to.
    eq: Mutex<Option<Arc<EventQueue>>>,
    shutdown: AtomicBool,
}

impl DomainShared {
    /// Advance the engine: harvest substrate arrivals, pump streams, run
    /// ready triggers.
    pub(crate) fn progress(self: &Arc<Self>) {
        eprintln!("PROG: enter");
        let mut claimed = Vec::new();
        {
            let _guard = self.poll_lock.lock();
            for _ in 0..self.config.poll_batch {
                match self.substrate.poll() {
                    Some(arrival) => claimed.push(arrival),
                    None => break,
                }
            }
        }
        eprintln!("PROG: claimed {}", claimed.len());
        for (src, msg) in claimed {
            self.dispatch(src, msg);
        }
        eprintln!("PROG: dispatched");
        self.pump_tx();
        eprintln!("PROG: pump_tx done");
        self.pump_reads();
        eprintln!("PROG: pump_reads done");
        self.run_triggers();
        eprintln!("PROG: run_triggers done");
    }

    pub(crate) fn enqueue_ready_triggers(&self, ready: Vec<Trigger>) {
        self.trigger_ready.lock().extend(ready);
    }

    fn run_triggers(&self) {
        loop {
            let Some(trigger) = self.trigger_ready.lock().pop_front() else {
                break;
            };
            trigger.op.fire();
        }
    }

    /// Encode and post one frame.
    pub(crate) fn post_frame(
        &self,
        dest: PeerAddr,
        hdr: &FrameHeader,
        payload: &[u8],
    ) -> Result<()> {
        tracing::trace!(?dest, op = ?hdr.op, req = hdr.req, aux = hdr.aux, "post frame");
        self.substrate.post(dest, hdr.frame(payload))
    }

    /// Report an error not attributable to a tracked request.
    pub(crate) fn async_error(&self, context: u64, error: &Error) {
        if let Some(eq) = self.eq.lock().as_ref() {
            eq.enqueue(EqEvent {
                kind: EqKind::Error,
                context,
                data: 0,
                error: error.code(),
            });
        } else {
            tracing::warn!(context, error = %error, "async error with no bound eq");
        }
    }

    pub(crate) fn rma_ep(&self) -> Option<Arc<Endpoint>> {
        self.rma_ep.lock().upgrade()
    }
}

/// A transport domain: one substrate port plus the engine driving it.
pub struct Domain {
    shared: Arc<DomainShared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Domain {
    /// Open a domain over a substrate port.
    ///
    /// Spawns the background progress thread if the configuration asks for
    /// one.
    pub fn new<S: Substrate + 'static>(substrate: S, config: DomainConfig) -> Result<Self> {
        let shared = Arc::new(DomainShared {
            substrate: Arc::new(substrate),
            mr: MrRegistry::new(),
            requests: RequestTable::new(config.max_requests),
            recv_queue: Mutex::new(VecDeque::new()),
            unexp_queue: Mutex::new(VecDeque::new()),
            streams: Mutex::new(HashMap::new()),
            tx_queue: Mutex::new(VecDeque::new()),
            read_queue: Mutex::new(VecDeque::new()),
            trigger_ready: Mutex::new(VecDeque::new()),
            poll_lock: SpinLock::new(),
            atomic_lock: Mutex::new(()),
            rma_ep: Mutex::new(Weak::new()),
            eq: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            config,
        });

        let worker = if shared.config.progress_thread {
            let shared = shared.clone();
            let interval = std::time::Duration::from_micros(shared.config.prog_interval_us);
            Some(
                std::thread::Builder::new()
                    .name("softrma-progress".into())
                    .spawn(move || {
                        while !shared.shutdown.load(Ordering::Acquire) {
                            shared.progress();
                            std::thread::sleep(interval);
                        }
                    })
                    .map_err(Error::Io)?,
            )
        } else {
            None
        };

        Ok(Self { shared, worker })
    }

    /// This domain's substrate address.
    pub fn local_addr(&self) -> PeerAddr {
        self.shared.substrate.local_addr()
    }

    /// Drive the engine once. Safe to call from any thread; concurrent
    /// callers serialize on the poll lock.
    pub fn progress(&self) {
        self.shared.progress();
    }

    /// Open a completion queue on this domain.
    pub fn cq_open(&self, format: CqFormat, depth: Option<usize>) -> Arc<CompletionQueue> {
        Arc::new(CompletionQueue::new(
            format,
            depth.unwrap_or(self.shared.config.cq_depth),
            Arc::downgrade(&self.shared),
        ))
    }

    /// Open an event queue.
    pub fn eq_open(&self, depth: Option<usize>) -> Arc<EventQueue> {
        Arc::new(EventQueue::new(
            depth.unwrap_or(self.shared.config.eq_depth),
        ))
    }

    /// Route the domain's asynchronous errors to an event queue.
    pub fn bind_eq(&self, eq: Arc<EventQueue>) {
        *self.shared.eq.lock() = Some(eq);
    }

    /// Open a counter.
    pub fn cntr_open(&self) -> Arc<Counter> {
        Arc::new(Counter::new(Arc::downgrade(&self.shared)))
    }

    /// Open an endpoint.
    pub fn ep_open(&self) -> Arc<Endpoint> {
        Endpoint::new(self.shared.clone())
    }

    /// Register a memory region for remote access.
    pub fn mr_reg(&self, desc: RegionDesc) -> Result<Arc<MemoryRegion>> {
        self.shared.mr.register(desc)
    }

    /// Deregister a memory region.
    pub fn mr_dereg(&self, key: u64) -> Result<()> {
        self.shared.mr.deregister(key)
    }

    /// Lock out remote atomics while inspecting memory they may target.
    pub fn atomic_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.shared.atomic_lock.lock()
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
