//! Error types for softrma.

use thiserror::Error;

use crate::atomic::{AtomicOp, Datatype};
use crate::region::Access;
use crate::substrate::PeerAddr;

/// Error type for softrma operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No memory region registered under the given key.
    #[error("no region registered under key {0:#x}")]
    BadKey(u64),
    /// A region is already registered under the given key.
    #[error("key {0:#x} is already registered")]
    KeyInUse(u64),
    /// The requested access rights exceed the region's rights mask.
    #[error("access {requested:?} not permitted by region rights {allowed:?}")]
    AccessDenied { requested: Access, allowed: Access },
    /// The requested range is not fully contained in the region.
    #[error("range [{addr:#x}, {addr:#x}+{len}) outside registered region")]
    OutOfRange { addr: u64, len: usize },
    /// More data arrived than the receiving buffer or request could hold.
    #[error("received {received} bytes, expected at most {expected}")]
    Truncated { expected: usize, received: usize },
    /// Message too large for the operation.
    #[error("message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    /// The in-flight request table is full.
    #[error("request table is full")]
    RequestTableFull,
    /// An event queue ran out of free event slots.
    #[error("event queue overrun")]
    QueueOverrun,
    /// An error event is pending and must be drained before normal reads.
    #[error("error event available")]
    ErrorAvailable,
    /// A blocking wait timed out.
    #[error("operation timed out")]
    Timeout,
    /// The substrate has no route to the given peer.
    #[error("peer {0:?} is unreachable")]
    Unreachable(PeerAddr),
    /// Opaque error code passed through from the substrate.
    #[error("substrate error {0}")]
    Substrate(i32),
    /// The atomic operation is not defined for the datatype.
    #[error("atomic op {op:?} not defined for {datatype:?}")]
    InvalidAtomic { datatype: Datatype, op: AtomicOp },
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    /// IO error from a wait object.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Numeric error codes carried in reply frames and CQ error entries.
///
/// Code 0 means success; the initiator surfaces a nonzero code verbatim in
/// the completion event's error field.
pub mod code {
    pub const OK: u64 = 0;
    pub const BAD_KEY: u64 = 1;
    pub const ACCESS: u64 = 2;
    pub const RANGE: u64 = 3;
    pub const TRUNC: u64 = 4;
    pub const MSGSIZE: u64 = 5;
    pub const RESOURCE: u64 = 6;
    pub const SUBSTRATE: u64 = 7;
    pub const ATOMIC: u64 = 8;
    pub const OTHER: u64 = 9;
}

impl Error {
    /// Map the error to its wire code.
    pub fn code(&self) -> u64 {
        match self {
            Error::BadKey(_) => code::BAD_KEY,
            Error::KeyInUse(_) => code::BAD_KEY,
            Error::AccessDenied { .. } => code::ACCESS,
            Error::OutOfRange { .. } => code::RANGE,
            Error::Truncated { .. } => code::TRUNC,
            Error::MessageTooLarge { .. } => code::MSGSIZE,
            Error::RequestTableFull | Error::QueueOverrun => code::RESOURCE,
            Error::Unreachable(_) | Error::Substrate(_) => code::SUBSTRATE,
            Error::InvalidAtomic { .. } => code::ATOMIC,
            _ => code::OTHER,
        }
    }
}

/// Result type for softrma operations.
pub type Result<T> = std::result::Result<T, Error>;
