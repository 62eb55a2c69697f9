//! Endpoints: operation submission and completion bindings.
//!
//! An endpoint carries the CQ and counter bindings that decide where each
//! operation reports its terminal outcome, and exposes one submit entry
//! point per operation kind plus the triggered variants that defer into a
//! counter's trigger list. Submission only queues work; the progress driver
//! does the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::atomic::{self, AtomicOp, Datatype};
use crate::cntr::Counter;
use crate::cq::{CompFlags, CompletionQueue};
use crate::domain::DomainShared;
use crate::error::{Error, Result};
use crate::request::{CompletionSink, RecvReq};
use crate::substrate::PeerAddr;
use crate::trigger::{Trigger, TriggerOp, TriggerWatch};
use crate::wire::{CHUNK_SIZE, INJECT_SIZE};

bitflags::bitflags! {
    /// Per-operation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u64 {
        /// Request a completion event even under selective completion.
        const COMPLETION = 1 << 0;
        /// Capture the payload at submit time and skip the completion
        /// event; limited to [`INJECT_SIZE`] bytes.
        const INJECT = 1 << 1;
        /// Require the remote side to acknowledge delivery.
        const DELIVERY_COMPLETE = 1 << 2;
        /// Carry the immediate data value to the remote CQ.
        const REMOTE_CQ_DATA = 1 << 3;
    }
}

/// Which counter binding an operation kind ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CntrKind {
    Send,
    Recv,
    Write,
    Read,
    RemoteWrite,
    RemoteRead,
}

#[derive(Default)]
struct EpBindings {
    send_cq: Option<Arc<CompletionQueue>>,
    recv_cq: Option<Arc<CompletionQueue>>,
    send_cntr: Option<Arc<Counter>>,
    recv_cntr: Option<Arc<Counter>>,
    write_cntr: Option<Arc<Counter>>,
    read_cntr: Option<Arc<Counter>>,
    remote_write_cntr: Option<Arc<Counter>>,
    remote_read_cntr: Option<Arc<Counter>>,
}

/// An operation-submission endpoint on a domain.
pub struct Endpoint {
    domain: Arc<DomainShared>,
    bindings: Mutex<EpBindings>,
    selective: AtomicBool,
}

impl Endpoint {
    pub(crate) fn new(domain: Arc<DomainShared>) -> Arc<Self> {
        Arc::new(Self {
            domain,
            bindings: Mutex::new(EpBindings::default()),
            selective: AtomicBool::new(false),
        })
    }

    /// Bind the CQ receiving send/write/read/atomic completions.
    pub fn bind_send_cq(&self, cq: Arc<CompletionQueue>) {
        self.bindings.lock().send_cq = Some(cq);
    }

    /// Bind the CQ receiving receive completions and remote-data events.
    pub fn bind_recv_cq(&self, cq: Arc<CompletionQueue>) {
        self.bindings.lock().recv_cq = Some(cq);
    }

    /// Bind one of the endpoint's counters.
    pub fn bind_cntr(&self, kind: CntrKind, cntr: Arc<Counter>) {
        let mut bindings = self.bindings.lock();
        match kind {
            CntrKind::Send => bindings.send_cntr = Some(cntr),
            CntrKind::Recv => bindings.recv_cntr = Some(cntr),
            CntrKind::Write => bindings.write_cntr = Some(cntr),
            CntrKind::Read => bindings.read_cntr = Some(cntr),
            CntrKind::RemoteWrite => bindings.remote_write_cntr = Some(cntr),
            CntrKind::RemoteRead => bindings.remote_read_cntr = Some(cntr),
        }
    }

    /// Only ops flagged [`OpFlags::COMPLETION`] generate CQ events.
    pub fn set_selective_completion(&self, selective: bool) {
        self.selective.store(selective, Ordering::Release);
    }

    /// Make this endpoint the domain's RMA event endpoint: remote accesses
    /// applied against the domain tick its remote counters and surface
    /// remote CQ data on its recv CQ.
    pub fn enable(self: &Arc<Self>) {
        let mut slot = self.domain.rma_ep.lock();
        if slot.upgrade().is_none() {
            *slot = Arc::downgrade(self);
        }
    }

    pub(crate) fn remote_write_cntr(&self) -> Option<Arc<Counter>> {
        self.bindings.lock().remote_write_cntr.clone()
    }

    pub(crate) fn remote_read_cntr(&self) -> Option<Arc<Counter>> {
        self.bindings.lock().remote_read_cntr.clone()
    }

    pub(crate) fn recv_cq(&self) -> Option<Arc<CompletionQueue>> {
        self.bindings.lock().recv_cq.clone()
    }

    fn make_sink(
        &self,
        cq: Option<Arc<CompletionQueue>>,
        cntr: Option<Arc<Counter>>,
        comp_flags: CompFlags,
        context: u64,
        flags: OpFlags,
    ) -> CompletionSink {
        let want_event = cq.is_some()
            && !flags.contains(OpFlags::INJECT)
            && (flags.contains(OpFlags::COMPLETION) || !self.selective.load(Ordering::Acquire));
        CompletionSink {
            cq,
            cntr,
            want_event,
            context,
            comp_flags,
            data: 0,
            source: None,
        }
    }

    fn check_inject(flags: OpFlags, len: usize) -> Result<()> {
        if flags.contains(OpFlags::INJECT) && len > INJECT_SIZE {
            return Err(Error::MessageTooLarge {
                size: len,
                max: INJECT_SIZE,
            });
        }
        Ok(())
    }

    /// Send a message through the AM message path.
    pub fn send(
        &self,
        buf: &[u8],
        dest: PeerAddr,
        context: u64,
        flags: OpFlags,
        data: u64,
    ) -> Result<()> {
        Self::check_inject(flags, buf.len())?;
        let (cq, cntr) = {
            let bindings = self.bindings.lock();
            (bindings.send_cq.clone(), bindings.send_cntr.clone())
        };
        let sink = self.make_sink(cq, cntr, CompFlags::SEND | CompFlags::MSG, context, flags);
        let wire_data = flags.contains(OpFlags::REMOTE_CQ_DATA).then_some(data);
        self.domain.submit_send(buf.to_vec(), dest, sink, wire_data)
    }

    /// Post a receive for the AM message path.
    ///
    /// # Safety
    /// `buf` must stay valid for writes of `len` bytes until the receive
    /// completes.
    pub unsafe fn recv(
        &self,
        buf: u64,
        len: usize,
        src: Option<PeerAddr>,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        let (cq, cntr) = {
            let bindings = self.bindings.lock();
            (bindings.recv_cq.clone(), bindings.recv_cntr.clone())
        };
        let sink = self.make_sink(cq, cntr, CompFlags::RECV | CompFlags::MSG, context, flags);
        self.domain.submit_recv(RecvReq {
            buf,
            len,
            src,
            sink,
        })
    }

    /// Emulated one-sided write. The payload is captured at submit time.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        buf: &[u8],
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
        data: u64,
    ) -> Result<()> {
        Self::check_inject(flags, buf.len())?;
        let (cq, cntr) = {
            let bindings = self.bindings.lock();
            (bindings.send_cq.clone(), bindings.write_cntr.clone())
        };
        let sink = self.make_sink(cq, cntr, CompFlags::WRITE | CompFlags::RMA, context, flags);
        let wire_data = flags.contains(OpFlags::REMOTE_CQ_DATA).then_some(data);
        self.domain.submit_write(
            buf.to_vec(),
            dest,
            addr,
            key,
            sink,
            wire_data,
            flags.contains(OpFlags::DELIVERY_COMPLETE),
        )
    }

    /// Emulated one-sided read.
    ///
    /// # Safety
    /// `buf` must stay valid for writes of `len` bytes until the read
    /// completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn read(
        &self,
        buf: u64,
        len: usize,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        let (cq, cntr) = {
            let bindings = self.bindings.lock();
            (bindings.send_cq.clone(), bindings.read_cntr.clone())
        };
        let sink = self.make_sink(cq, cntr, CompFlags::READ | CompFlags::RMA, context, flags);
        self.domain.submit_read(buf, len, dest, addr, key, sink)
    }

    fn check_atomic_args(
        operands_len: usize,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        compare_form: bool,
    ) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArg("atomic element count is zero"));
        }
        if !atomic::valid(datatype, op) || op.is_compare() != compare_form {
            return Err(Error::InvalidAtomic { datatype, op });
        }
        if operands_len != count * datatype.size() {
            return Err(Error::InvalidArg("operand length mismatch"));
        }
        let payload = if compare_form {
            operands_len * 2
        } else {
            operands_len
        };
        if payload > CHUNK_SIZE {
            return Err(Error::MessageTooLarge {
                size: payload,
                max: CHUNK_SIZE,
            });
        }
        Ok(())
    }

    /// Atomic write of `count` elements.
    #[allow(clippy::too_many_arguments)]
    pub fn atomic_write(
        &self,
        operands: &[u8],
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        Self::check_atomic_args(operands.len(), count, datatype, op, false)?;
        let (cq, cntr) = {
            let bindings = self.bindings.lock();
            (bindings.send_cq.clone(), bindings.write_cntr.clone())
        };
        let sink = self.make_sink(
            cq,
            cntr,
            CompFlags::ATOMIC | CompFlags::WRITE,
            context,
            flags,
        );
        self.domain
            .submit_atomic_write(operands.to_vec(), count, datatype, op, dest, addr, key, sink)
    }

    /// Atomic fetch: applies `op` remotely and returns the pre-image.
    ///
    /// # Safety
    /// `result` must stay valid for writes of `count * datatype.size()`
    /// bytes until the operation completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn atomic_readwrite(
        &self,
        operands: &[u8],
        result: u64,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        Self::check_atomic_args(operands.len(), count, datatype, op, false)?;
        let (cq, cntr) = {
            let bindings = self.bindings.lock();
            (bindings.send_cq.clone(), bindings.read_cntr.clone())
        };
        let sink = self.make_sink(
            cq,
            cntr,
            CompFlags::ATOMIC | CompFlags::READ,
            context,
            flags,
        );
        self.domain.submit_atomic_readwrite(
            operands.to_vec(),
            result,
            count,
            datatype,
            op,
            dest,
            addr,
            key,
            sink,
        )
    }

    /// Atomic compare: conditionally swaps remotely, returns the pre-image.
    ///
    /// # Safety
    /// `result` must stay valid for writes of `count * datatype.size()`
    /// bytes until the operation completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn atomic_compwrite(
        &self,
        operands: &[u8],
        compare: &[u8],
        result: u64,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        Self::check_atomic_args(operands.len(), count, datatype, op, true)?;
        if compare.len() != operands.len() {
            return Err(Error::InvalidArg("compare length mismatch"));
        }
        let (cq, cntr) = {
            let bindings = self.bindings.lock();
            (bindings.send_cq.clone(), bindings.read_cntr.clone())
        };
        let sink = self.make_sink(
            cq,
            cntr,
            CompFlags::ATOMIC | CompFlags::READ,
            context,
            flags,
        );
        self.domain.submit_atomic_compwrite(
            operands.to_vec(),
            compare,
            result,
            count,
            datatype,
            op,
            dest,
            addr,
            key,
            sink,
        )
    }

    /// Defer a send until `cntr` reaches `threshold`.
    #[allow(clippy::too_many_arguments)]
    pub fn send_triggered(
        self: &Arc<Self>,
        buf: &[u8],
        dest: PeerAddr,
        context: u64,
        flags: OpFlags,
        data: u64,
        cntr: &Arc<Counter>,
        threshold: u64,
    ) -> Result<()> {
        Self::check_inject(flags, buf.len())?;
        cntr.add_trigger(Trigger {
            threshold,
            watch: TriggerWatch::Success,
            op: TriggerOp::Send {
                ep: Arc::downgrade(self),
                buf: buf.to_vec(),
                dest,
                context,
                flags,
                data,
            },
        });
        Ok(())
    }

    /// Defer a receive post until `cntr` reaches `threshold`.
    ///
    /// # Safety
    /// `buf` must stay valid for writes of `len` bytes until the receive
    /// completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn recv_triggered(
        self: &Arc<Self>,
        buf: u64,
        len: usize,
        src: Option<PeerAddr>,
        context: u64,
        flags: OpFlags,
        cntr: &Arc<Counter>,
        threshold: u64,
    ) -> Result<()> {
        cntr.add_trigger(Trigger {
            threshold,
            watch: TriggerWatch::Success,
            op: TriggerOp::Recv {
                ep: Arc::downgrade(self),
                buf,
                len,
                src,
                context,
                flags,
            },
        });
        Ok(())
    }

    /// Defer a write until `cntr` reaches `threshold`. The payload is
    /// captured now.
    #[allow(clippy::too_many_arguments)]
    pub fn write_triggered(
        self: &Arc<Self>,
        buf: &[u8],
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
        data: u64,
        cntr: &Arc<Counter>,
        threshold: u64,
    ) -> Result<()> {
        Self::check_inject(flags, buf.len())?;
        cntr.add_trigger(Trigger {
            threshold,
            watch: TriggerWatch::Success,
            op: TriggerOp::Write {
                ep: Arc::downgrade(self),
                buf: buf.to_vec(),
                dest,
                addr,
                key,
                context,
                flags,
                data,
            },
        });
        Ok(())
    }

    /// Defer a read until `cntr` reaches `threshold`.
    ///
    /// # Safety
    /// `buf` must stay valid for writes of `len` bytes until the read
    /// completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn read_triggered(
        self: &Arc<Self>,
        buf: u64,
        len: usize,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
        cntr: &Arc<Counter>,
        threshold: u64,
    ) -> Result<()> {
        cntr.add_trigger(Trigger {
            threshold,
            watch: TriggerWatch::Success,
            op: TriggerOp::Read {
                ep: Arc::downgrade(self),
                buf,
                len,
                dest,
                addr,
                key,
                context,
                flags,
            },
        });
        Ok(())
    }

    /// Defer an atomic write until `cntr` reaches `threshold`.
    #[allow(clippy::too_many_arguments)]
    pub fn atomic_write_triggered(
        self: &Arc<Self>,
        operands: &[u8],
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
        cntr: &Arc<Counter>,
        threshold: u64,
    ) -> Result<()> {
        Self::check_atomic_args(operands.len(), count, datatype, op, false)?;
        cntr.add_trigger(Trigger {
            threshold,
            watch: TriggerWatch::Success,
            op: TriggerOp::AtomicWrite {
                ep: Arc::downgrade(self),
                operands: operands.to_vec(),
                count,
                datatype,
                op,
                dest,
                addr,
                key,
                context,
                flags,
            },
        });
        Ok(())
    }

    /// Defer an atomic fetch until `cntr` reaches `threshold`.
    ///
    /// # Safety
    /// `result` must stay valid until the operation completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn atomic_readwrite_triggered(
        self: &Arc<Self>,
        operands: &[u8],
        result: u64,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
        cntr: &Arc<Counter>,
        threshold: u64,
    ) -> Result<()> {
        Self::check_atomic_args(operands.len(), count, datatype, op, false)?;
        cntr.add_trigger(Trigger {
            threshold,
            watch: TriggerWatch::Success,
            op: TriggerOp::AtomicReadwrite {
                ep: Arc::downgrade(self),
                operands: operands.to_vec(),
                result,
                count,
                datatype,
                op,
                dest,
                addr,
                key,
                context,
                flags,
            },
        });
        Ok(())
    }

    /// Defer an atomic compare until `cntr` reaches `threshold`.
    ///
    /// # Safety
    /// `result` must stay valid until the operation completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn atomic_compwrite_triggered(
        self: &Arc<Self>,
        operands: &[u8],
        compare: &[u8],
        result: u64,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
        cntr: &Arc<Counter>,
        threshold: u64,
    ) -> Result<()> {
        Self::check_atomic_args(operands.len(), count, datatype, op, true)?;
        if compare.len() != operands.len() {
            return Err(Error::InvalidArg("compare length mismatch"));
        }
        cntr.add_trigger(Trigger {
            threshold,
            watch: TriggerWatch::Success,
            op: TriggerOp::AtomicCompwrite {
                ep: Arc::downgrade(self),
                operands: operands.to_vec(),
                compare: compare.to_vec(),
                result,
                count,
                datatype,
                op,
                dest,
                addr,
                key,
                context,
                flags,
            },
        });
        Ok(())
    }
}
