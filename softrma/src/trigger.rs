//! Deferred (triggered) operations.
//!
//! A trigger captures the full argument set of an operation plus the counter
//! threshold gating it. Payloads of deferred sends and writes are captured
//! at submit time, so the caller's buffer is free the moment the triggered
//! call returns; receive and read destinations stay raw addresses that must
//! outlive the operation, as with the immediate forms.

use std::sync::Weak;

use crate::atomic::{AtomicOp, Datatype};
use crate::ep::{Endpoint, OpFlags};
use crate::substrate::PeerAddr;

/// Which count of the watched counter gates the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerWatch {
    Success,
    Errors,
}

/// A deferred operation waiting on a counter threshold.
pub(crate) struct Trigger {
    pub threshold: u64,
    pub watch: TriggerWatch,
    pub op: TriggerOp,
}

/// The deferred operation's argument set, tagged by operation kind.
pub(crate) enum TriggerOp {
    Send {
        ep: Weak<Endpoint>,
        buf: Vec<u8>,
        dest: PeerAddr,
        context: u64,
        flags: OpFlags,
        data: u64,
    },
    Recv {
        ep: Weak<Endpoint>,
        buf: u64,
        len: usize,
        src: Option<PeerAddr>,
        context: u64,
        flags: OpFlags,
    },
    Write {
        ep: Weak<Endpoint>,
        buf: Vec<u8>,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
        data: u64,
    },
    Read {
        ep: Weak<Endpoint>,
        buf: u64,
        len: usize,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
    },
    AtomicWrite {
        ep: Weak<Endpoint>,
        operands: Vec<u8>,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
    },
    AtomicReadwrite {
        ep: Weak<Endpoint>,
        operands: Vec<u8>,
        result: u64,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
    },
    AtomicCompwrite {
        ep: Weak<Endpoint>,
        operands: Vec<u8>,
        compare: Vec<u8>,
        result: u64,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        context: u64,
        flags: OpFlags,
    },
}

impl TriggerOp {
    /// Issue the captured operation through its endpoint.
    ///
    /// Called by the progress driver once the trigger is ready. Errors are
    /// logged, not retried: the deferred call has no caller left to return
    /// to.
    pub(crate) fn fire(self) {
        let result = match self {
            TriggerOp::Send {
                ep,
                buf,
                dest,
                context,
                flags,
                data,
            } => {
                let Some(ep) = ep.upgrade() else { return };
                ep.send(&buf, dest, context, flags, data)
            }
            TriggerOp::Recv {
                ep,
                buf,
                len,
                src,
                context,
                flags,
            } => {
                let Some(ep) = ep.upgrade() else { return };
                // The caller of the triggered post guaranteed buffer
                // liveness until completion.
                unsafe { ep.recv(buf, len, src, context, flags) }
            }
            TriggerOp::Write {
                ep,
                buf,
                dest,
                addr,
                key,
                context,
                flags,
                data,
            } => {
                let Some(ep) = ep.upgrade() else { return };
                ep.write(&buf, dest, addr, key, context, flags, data)
            }
            TriggerOp::Read {
                ep,
                buf,
                len,
                dest,
                addr,
                key,
                context,
                flags,
            } => {
                let Some(ep) = ep.upgrade() else { return };
                unsafe { ep.read(buf, len, dest, addr, key, context, flags) }
            }
            TriggerOp::AtomicWrite {
                ep,
                operands,
                count,
                datatype,
                op,
                dest,
                addr,
                key,
                context,
                flags,
            } => {
                let Some(ep) = ep.upgrade() else { return };
                ep.atomic_write(&operands, count, datatype, op, dest, addr, key, context, flags)
            }
            TriggerOp::AtomicReadwrite {
                ep,
                operands,
                result,
                count,
                datatype,
                op,
                dest,
                addr,
                key,
                context,
                flags,
            } => {
                let Some(ep) = ep.upgrade() else { return };
                unsafe {
                    ep.atomic_readwrite(
                        &operands, result, count, datatype, op, dest, addr, key, context, flags,
                    )
                }
            }
            TriggerOp::AtomicCompwrite {
                ep,
                operands,
                compare,
                result,
                count,
                datatype,
                op,
                dest,
                addr,
                key,
                context,
                flags,
            } => {
                let Some(ep) = ep.upgrade() else { return };
                unsafe {
                    ep.atomic_compwrite(
                        &operands, &compare, result, count, datatype, op, dest, addr, key, context,
                        flags,
                    )
                }
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "triggered operation failed to issue");
        }
    }
}
