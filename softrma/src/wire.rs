//! Active-message frame header and op codes.
//!
//! Every protocol exchange is a request/reply pair addressed to one of the
//! three logical handlers (RMA, message, atomic). A frame is a fixed 56-byte
//! header followed by an optional payload; payloads never exceed
//! [`CHUNK_SIZE`], larger transfers are split into chunk frames carrying
//! explicit offsets, with the final chunk flagged end-of-message.

use crate::error::{Error, Result};

/// Maximum payload bytes per frame.
pub const CHUNK_SIZE: usize = 2032;

/// Frame header size in bytes.
pub const HDR_SIZE: usize = 56;

/// Payload bytes at or below this limit may be issued with the inject flag.
pub const INJECT_SIZE: usize = 64;

bitflags::bitflags! {
    /// Frame flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AmFlags: u32 {
        /// Final chunk of the message.
        const EOM = 0x4000_0000;
        /// The data field carries remote CQ data.
        const DATA = 0x2000_0000;
        /// Acknowledge even if the initiator asked for no ack.
        const FORCE_ACK = 0x1000_0000;
        /// The initiator does not want an acknowledgment reply.
        const NO_ACK = 0x0800_0000;
    }
}

/// Frame op codes, one request/reply pair per emulated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AmOp {
    /// Single-frame remote write.
    ReqWrite = 1,
    /// Chunk of a multi-frame remote write.
    ReqWriteLong = 2,
    /// Write acknowledgment.
    RepWrite = 3,
    /// Remote read served by a single reply frame.
    ReqRead = 4,
    /// Remote read served by a chunked reply sequence.
    ReqReadLong = 5,
    /// Read reply chunk.
    RepRead = 6,
    /// Chunk of an AM-routed send.
    ReqSend = 7,
    /// Send acknowledgment.
    RepSend = 8,
    /// Atomic write request.
    ReqAtomicWrite = 9,
    /// Atomic write acknowledgment.
    RepAtomicWrite = 10,
    /// Atomic fetch request.
    ReqAtomicReadwrite = 11,
    /// Atomic fetch reply carrying the pre-image.
    RepAtomicReadwrite = 12,
    /// Atomic compare request.
    ReqAtomicCompwrite = 13,
    /// Atomic compare reply carrying the pre-image.
    RepAtomicCompwrite = 14,
}

impl TryFrom<u8> for AmOp {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => AmOp::ReqWrite,
            2 => AmOp::ReqWriteLong,
            3 => AmOp::RepWrite,
            4 => AmOp::ReqRead,
            5 => AmOp::ReqReadLong,
            6 => AmOp::RepRead,
            7 => AmOp::ReqSend,
            8 => AmOp::RepSend,
            9 => AmOp::ReqAtomicWrite,
            10 => AmOp::RepAtomicWrite,
            11 => AmOp::ReqAtomicReadwrite,
            12 => AmOp::RepAtomicReadwrite,
            13 => AmOp::ReqAtomicCompwrite,
            14 => AmOp::RepAtomicCompwrite,
            _ => return Err(Error::InvalidArg("unknown frame op")),
        })
    }
}

/// Frame header.
///
/// Layout (little endian):
/// ```text
/// Offset  Size  Field
/// 0       1     op
/// 1       3     reserved
/// 4       4     flags
/// 8       8     addr
/// 16      8     key
/// 24      8     req
/// 32      8     data
/// 40      8     len
/// 48      8     aux
/// ```
///
/// Field meaning by op:
/// - `addr`: target/source address for RMA and atomics (chunk frames carry
///   the already-offset address).
/// - `key`: region registration key for RMA and atomics.
/// - `req`: initiator request token; replies echo it back.
/// - `data`: remote CQ data on requests (with [`AmFlags::DATA`]); status
///   code on replies (0 = success); packed datatype/op on atomic requests.
/// - `len`: total message length for chunked transfers, requested length
///   for reads, element count for atomics.
/// - `aux`: running byte offset of this chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: AmOp,
    pub flags: AmFlags,
    pub addr: u64,
    pub key: u64,
    pub req: u64,
    pub data: u64,
    pub len: u64,
    pub aux: u64,
}

impl FrameHeader {
    /// Encode the header into the first [`HDR_SIZE`] bytes of `dst`.
    ///
    /// # Panics
    /// Panics if `dst` is shorter than [`HDR_SIZE`].
    pub fn encode(&self, dst: &mut [u8]) {
        dst[0] = self.op as u8;
        dst[1..4].fill(0);
        dst[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        dst[8..16].copy_from_slice(&self.addr.to_le_bytes());
        dst[16..24].copy_from_slice(&self.key.to_le_bytes());
        dst[24..32].copy_from_slice(&self.req.to_le_bytes());
        dst[32..40].copy_from_slice(&self.data.to_le_bytes());
        dst[40..48].copy_from_slice(&self.len.to_le_bytes());
        dst[48..56].copy_from_slice(&self.aux.to_le_bytes());
    }

    /// Decode a header from the first [`HDR_SIZE`] bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < HDR_SIZE {
            return Err(Error::InvalidArg("frame shorter than header"));
        }
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&src[off..off + 8]);
            u64::from_le_bytes(b)
        };
        let mut fb = [0u8; 4];
        fb.copy_from_slice(&src[4..8]);
        Ok(Self {
            op: AmOp::try_from(src[0])?,
            flags: AmFlags::from_bits_truncate(u32::from_le_bytes(fb)),
            addr: u64_at(8),
            key: u64_at(16),
            req: u64_at(24),
            data: u64_at(32),
            len: u64_at(40),
            aux: u64_at(48),
        })
    }

    /// Encode the header and payload into a single wire message.
    pub fn frame(&self, payload: &[u8]) -> Vec<u8> {
        debug_assert!(payload.len() <= CHUNK_SIZE);
        let mut msg = vec![0u8; HDR_SIZE + payload.len()];
        self.encode(&mut msg);
        msg[HDR_SIZE..].copy_from_slice(payload);
        msg
    }
}

/// Number of chunk frames needed for a message of the given size.
pub fn chunk_count(len: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(CHUNK_SIZE)
    }
}
