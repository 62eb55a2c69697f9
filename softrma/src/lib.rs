//! # softrma - emulated RMA and atomics over matched message passing
//!
//! This crate implements one-sided remote memory access (write, read) and
//! remote atomic operations on top of a substrate that only offers reliable
//! two-sided message passing. Every one-sided operation becomes an
//! active-message request/reply exchange: the initiator tracks an in-flight
//! request, the responder validates the target memory region, applies the
//! access, and replies; completion surfaces through completion queues and
//! counters, and counters can defer further operations until a threshold is
//! reached.
//!
//! ## Features
//!
//! - **Emulated RMA**: write and read against registered, access-checked
//!   memory regions, with flow-controlled chunking for large transfers
//! - **Remote atomics**: write, fetch, and compare-swap forms over the full
//!   integer/float datatype matrix, applied atomically at the responder
//! - **Completion model**: formatted completion queues with a blocking
//!   pending-error slot, event queues, and monotonic success/error counters
//! - **Triggered operations**: any operation can wait on a counter
//!   threshold and is issued by the progress driver once it fires
//! - **Unexpected messages**: AM-routed sends buffer until a matching
//!   receive is posted, with truncation reported as overflow
//!
//! ## Usage
//!
//! ```ignore
//! use softrma::{Access, Domain, DomainConfig, CqFormat, InprocHub, OpFlags, RegionDesc};
//!
//! let hub = InprocHub::new();
//! let local = Domain::new(hub.open_port(), DomainConfig::default())?;
//! let remote = Domain::new(hub.open_port(), DomainConfig::default())?;
//!
//! // Expose memory on the remote domain.
//! let mut window = vec![0u8; 4096];
//! let window_addr = window.as_mut_ptr() as u64;
//! remote.mr_reg(RegionDesc::new(
//!     window_addr,
//!     window.len(),
//!     Access::REMOTE_READ | Access::REMOTE_WRITE,
//!     0x2a,
//! ))?;
//!
//! // Write into it from the local domain.
//! let cq = local.cq_open(CqFormat::Msg, None);
//! let ep = local.ep_open();
//! ep.bind_send_cq(cq.clone());
//! ep.write(b"payload", remote.local_addr(), window_addr, 0x2a, 1, OpFlags::empty(), 0)?;
//!
//! // Drive both sides until the completion arrives.
//! loop {
//!     local.progress();
//!     remote.progress();
//!     if !cq.read(1)?.is_empty() { break; }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`wire`]: frame header, op codes, chunking constants
//! - [`region`]: region registry and access validation
//! - [`cq`] / [`eq`]: completion and event queues
//! - [`cntr`] / [`trigger`]: counters and deferred operations
//! - [`am`] / [`rma`] / [`atomic`]: the three protocol handlers
//! - [`domain`]: shared engine state and the progress driver
//! - [`ep`]: submit entry points and completion bindings
//! - [`substrate`]: the substrate service trait and the in-process hub

pub mod atomic;
pub mod cntr;
pub mod config;
pub mod cq;
pub mod domain;
pub mod ep;
pub mod eq;
pub mod error;
pub mod region;
pub mod substrate;
pub mod wait;
pub mod wire;

mod am;
mod request;
mod rma;
mod trigger;

pub use atomic::{AtomicOp, Datatype};
pub use cntr::Counter;
pub use config::DomainConfig;
pub use cq::{CompFlags, CompletionQueue, CqEvent, CqFormat};
pub use domain::Domain;
pub use ep::{CntrKind, Endpoint, OpFlags};
pub use eq::{EqEvent, EqKind, EventQueue};
pub use error::{Error, Result};
pub use region::{Access, MemoryRegion, MrRegistry, RegionDesc, Segment};
pub use substrate::{InprocHub, InprocPort, PeerAddr, Substrate};
pub use wait::{WaitKind, WaitSet};
pub use wire::{CHUNK_SIZE, INJECT_SIZE};
