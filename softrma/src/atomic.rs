//! Atomic operation codes, datatypes, and the responder-side apply engine.
//!
//! The initiator packs (datatype, op) into the frame's data field; the
//! responder applies the operation element by element under the domain's
//! atomic lock, so concurrent local and remote accesses never observe a
//! half-applied operation. Fetch and compare forms collect the pre-image
//! into the reply payload.

use std::sync::Arc;

use crate::domain::DomainShared;
use crate::error::{code, Error, Result};
use crate::region::Access;
use crate::request::{CompletionSink, Request, RequestKind};
use crate::substrate::PeerAddr;
use crate::wire::{AmFlags, AmOp, FrameHeader};

/// Element datatype of an atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Datatype {
    I8 = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    I64 = 6,
    U64 = 7,
    F32 = 8,
    F64 = 9,
}

impl Datatype {
    /// Element size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Datatype::I8 | Datatype::U8 => 1,
            Datatype::I16 | Datatype::U16 => 2,
            Datatype::I32 | Datatype::U32 | Datatype::F32 => 4,
            Datatype::I64 | Datatype::U64 | Datatype::F64 => 8,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Datatype::I8,
            1 => Datatype::U8,
            2 => Datatype::I16,
            3 => Datatype::U16,
            4 => Datatype::I32,
            5 => Datatype::U32,
            6 => Datatype::I64,
            7 => Datatype::U64,
            8 => Datatype::F32,
            9 => Datatype::F64,
            _ => return None,
        })
    }

    fn is_float(&self) -> bool {
        matches!(self, Datatype::F32 | Datatype::F64)
    }
}

/// Atomic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomicOp {
    Min = 0,
    Max = 1,
    Sum = 2,
    Prod = 3,
    Lor = 4,
    Land = 5,
    Bor = 6,
    Band = 7,
    Lxor = 8,
    Bxor = 9,
    /// Read the target, store nothing.
    AtomicRead = 10,
    /// Store the operand unconditionally.
    AtomicWrite = 11,
    Cswap = 12,
    CswapNe = 13,
    CswapLe = 14,
    CswapLt = 15,
    CswapGe = 16,
    CswapGt = 17,
    /// Masked swap: target = (operand & compare) | (target & !compare).
    Mswap = 18,
}

impl AtomicOp {
    fn from_u8(value: u8) -> Option<Self> {
        if value <= AtomicOp::Mswap as u8 {
            // Codes are dense, checked above.
            Some(unsafe { std::mem::transmute::<u8, AtomicOp>(value) })
        } else {
            None
        }
    }

    /// Whether the op belongs to the compare-and-swap family.
    pub fn is_compare(&self) -> bool {
        matches!(
            self,
            AtomicOp::Cswap
                | AtomicOp::CswapNe
                | AtomicOp::CswapLe
                | AtomicOp::CswapLt
                | AtomicOp::CswapGe
                | AtomicOp::CswapGt
                | AtomicOp::Mswap
        )
    }
}

/// Whether the (datatype, op) pair is defined.
///
/// Bitwise, logical, and masked-swap operators have no floating-point form.
pub fn valid(datatype: Datatype, op: AtomicOp) -> bool {
    if !datatype.is_float() {
        return true;
    }
    !matches!(
        op,
        AtomicOp::Lor
            | AtomicOp::Land
            | AtomicOp::Lxor
            | AtomicOp::Bor
            | AtomicOp::Band
            | AtomicOp::Bxor
            | AtomicOp::Mswap
    )
}

/// Pack (datatype, op) for the frame data field.
pub(crate) fn pack(datatype: Datatype, op: AtomicOp) -> u64 {
    ((datatype as u64) << 32) | op as u64
}

/// Unpack the frame data field.
pub(crate) fn unpack(value: u64) -> Result<(Datatype, AtomicOp)> {
    let datatype = Datatype::from_u8((value >> 32) as u8);
    let op = AtomicOp::from_u8((value & 0xFFFF_FFFF) as u8);
    match (datatype, op) {
        (Some(datatype), Some(op)) => Ok((datatype, op)),
        _ => Err(Error::InvalidArg("malformed atomic descriptor")),
    }
}

macro_rules! atomic_int {
    ($apply:ident, $compare:ident, $t:ty) => {
        unsafe fn $apply(
            op: AtomicOp,
            base: *mut u8,
            operands: &[u8],
            mut fetch: Option<&mut Vec<u8>>,
            count: usize,
        ) -> Result<()> {
            let size = std::mem::size_of::<$t>();
            for i in 0..count {
                let dst = base.add(i * size) as *mut $t;
                let old = std::ptr::read_unaligned(dst);
                if let Some(out) = fetch.as_deref_mut() {
                    out.extend_from_slice(&old.to_le_bytes());
                }
                let opnd =
                    <$t>::from_le_bytes(operands[i * size..(i + 1) * size].try_into().unwrap());
                let new = match op {
                    AtomicOp::Min => {
                        if opnd < old {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::Max => {
                        if opnd > old {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::Sum => old.wrapping_add(opnd),
                    AtomicOp::Prod => old.wrapping_mul(opnd),
                    AtomicOp::Lor => ((old != 0) || (opnd != 0)) as $t,
                    AtomicOp::Land => ((old != 0) && (opnd != 0)) as $t,
                    AtomicOp::Lxor => ((old != 0) ^ (opnd != 0)) as $t,
                    AtomicOp::Bor => old | opnd,
                    AtomicOp::Band => old & opnd,
                    AtomicOp::Bxor => old ^ opnd,
                    AtomicOp::AtomicRead => old,
                    AtomicOp::AtomicWrite => opnd,
                    _ => return Err(Error::InvalidArg("compare op without compare buffer")),
                };
                std::ptr::write_unaligned(dst, new);
            }
            Ok(())
        }

        unsafe fn $compare(
            op: AtomicOp,
            base: *mut u8,
            operands: &[u8],
            compare: &[u8],
            fetch: &mut Vec<u8>,
            count: usize,
        ) -> Result<()> {
            let size = std::mem::size_of::<$t>();
            for i in 0..count {
                let dst = base.add(i * size) as *mut $t;
                let old = std::ptr::read_unaligned(dst);
                fetch.extend_from_slice(&old.to_le_bytes());
                let opnd =
                    <$t>::from_le_bytes(operands[i * size..(i + 1) * size].try_into().unwrap());
                let cmp =
                    <$t>::from_le_bytes(compare[i * size..(i + 1) * size].try_into().unwrap());
                let new = match op {
                    AtomicOp::Cswap => {
                        if old == cmp {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::CswapNe => {
                        if old != cmp {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::CswapLe => {
                        if cmp <= old {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::CswapLt => {
                        if cmp < old {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::CswapGe => {
                        if cmp >= old {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::CswapGt => {
                        if cmp > old {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::Mswap => (opnd & cmp) | (old & !cmp),
                    _ => return Err(Error::InvalidArg("non-compare op with compare buffer")),
                };
                std::ptr::write_unaligned(dst, new);
            }
            Ok(())
        }
    };
}

macro_rules! atomic_float {
    ($apply:ident, $compare:ident, $t:ty) => {
        unsafe fn $apply(
            op: AtomicOp,
            base: *mut u8,
            operands: &[u8],
            mut fetch: Option<&mut Vec<u8>>,
            count: usize,
        ) -> Result<()> {
            let size = std::mem::size_of::<$t>();
            for i in 0..count {
                let dst = base.add(i * size) as *mut $t;
                let old = std::ptr::read_unaligned(dst);
                if let Some(out) = fetch.as_deref_mut() {
                    out.extend_from_slice(&old.to_le_bytes());
                }
                let opnd =
                    <$t>::from_le_bytes(operands[i * size..(i + 1) * size].try_into().unwrap());
                let new = match op {
                    AtomicOp::Min => {
                        if opnd < old {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::Max => {
                        if opnd > old {
                            opnd
                        } else {
                            old
                        }
                    }
                    AtomicOp::Sum => old + opnd,
                    AtomicOp::Prod => old * opnd,
                    AtomicOp::AtomicRead => old,
                    AtomicOp::AtomicWrite => opnd,
                    _ => return Err(Error::InvalidArg("op undefined for float datatype")),
                };
                std::ptr::write_unaligned(dst, new);
            }
            Ok(())
        }

        unsafe fn $compare(
            op: AtomicOp,
            base: *mut u8,
            operands: &[u8],
            compare: &[u8],
            fetch: &mut Vec<u8>,
            count: usize,
        ) -> Result<()> {
            let size = std::mem::size_of::<$t>();
            for i in 0..count {
                let dst = base.add(i * size) as *mut $t;
                let old = std::ptr::read_unaligned(dst);
                fetch.extend_from_slice(&old.to_le_bytes());
                let opnd =
                    <$t>::from_le_bytes(operands[i * size..(i + 1) * size].try_into().unwrap());
                let cmp =
                    <$t>::from_le_bytes(compare[i * size..(i + 1) * size].try_into().unwrap());
                let store = match op {
                    AtomicOp::Cswap => old == cmp,
                    AtomicOp::CswapNe => old != cmp,
                    AtomicOp::CswapLe => cmp <= old,
                    AtomicOp::CswapLt => cmp < old,
                    AtomicOp::CswapGe => cmp >= old,
                    AtomicOp::CswapGt => cmp > old,
                    _ => return Err(Error::InvalidArg("op undefined for float datatype")),
                };
                if store {
                    std::ptr::write_unaligned(dst, opnd);
                }
            }
            Ok(())
        }
    };
}

atomic_int!(apply_i8, compare_i8, i8);
atomic_int!(apply_u8, compare_u8, u8);
atomic_int!(apply_i16, compare_i16, i16);
atomic_int!(apply_u16, compare_u16, u16);
atomic_int!(apply_i32, compare_i32, i32);
atomic_int!(apply_u32, compare_u32, u32);
atomic_int!(apply_i64, compare_i64, i64);
atomic_int!(apply_u64, compare_u64, u64);
atomic_float!(apply_f32, compare_f32, f32);
atomic_float!(apply_f64, compare_f64, f64);

/// Apply an atomic operation to `count` elements at `base`.
///
/// `compare` must be provided for exactly the compare-family ops, and
/// `fetch` collects little-endian pre-images when given. The caller holds
/// the domain atomic lock and has validated the target range.
///
/// # Safety
/// `base` must be valid for reads and writes of `count` elements of
/// `datatype`.
pub(crate) unsafe fn apply(
    datatype: Datatype,
    op: AtomicOp,
    base: *mut u8,
    count: usize,
    operands: &[u8],
    compare: Option<&[u8]>,
    fetch: Option<&mut Vec<u8>>,
) -> Result<()> {
    if !valid(datatype, op) {
        return Err(Error::InvalidAtomic { datatype, op });
    }
    if op.is_compare() != compare.is_some() {
        return Err(Error::InvalidArg("compare buffer mismatch"));
    }
    match compare {
        Some(cmp) => {
            let fetch = fetch.ok_or(Error::InvalidArg("compare op requires a fetch buffer"))?;
            match datatype {
                Datatype::I8 => compare_i8(op, base, operands, cmp, fetch, count),
                Datatype::U8 => compare_u8(op, base, operands, cmp, fetch, count),
                Datatype::I16 => compare_i16(op, base, operands, cmp, fetch, count),
                Datatype::U16 => compare_u16(op, base, operands, cmp, fetch, count),
                Datatype::I32 => compare_i32(op, base, operands, cmp, fetch, count),
                Datatype::U32 => compare_u32(op, base, operands, cmp, fetch, count),
                Datatype::I64 => compare_i64(op, base, operands, cmp, fetch, count),
                Datatype::U64 => compare_u64(op, base, operands, cmp, fetch, count),
                Datatype::F32 => compare_f32(op, base, operands, cmp, fetch, count),
                Datatype::F64 => compare_f64(op, base, operands, cmp, fetch, count),
            }
        }
        None => match datatype {
            Datatype::I8 => apply_i8(op, base, operands, fetch, count),
            Datatype::U8 => apply_u8(op, base, operands, fetch, count),
            Datatype::I16 => apply_i16(op, base, operands, fetch, count),
            Datatype::U16 => apply_u16(op, base, operands, fetch, count),
            Datatype::I32 => apply_i32(op, base, operands, fetch, count),
            Datatype::U32 => apply_u32(op, base, operands, fetch, count),
            Datatype::I64 => apply_i64(op, base, operands, fetch, count),
            Datatype::U64 => apply_u64(op, base, operands, fetch, count),
            Datatype::F32 => apply_f32(op, base, operands, fetch, count),
            Datatype::F64 => apply_f64(op, base, operands, fetch, count),
        },
    }
}

impl DomainShared {
    fn post_atomic_request(
        &self,
        op: AmOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        token: u64,
        datatype: Datatype,
        atomic_op: AtomicOp,
        count: usize,
        payload: &[u8],
    ) -> Result<()> {
        let hdr = FrameHeader {
            op,
            flags: AmFlags::EOM,
            addr,
            key,
            req: token,
            data: pack(datatype, atomic_op),
            len: count as u64,
            aux: 0,
        };
        self.post_frame(dest, &hdr, payload).inspect_err(|_| {
            self.requests.remove(token);
        })
    }

    /// Issue an atomic write.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_atomic_write(
        &self,
        operands: Vec<u8>,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        sink: CompletionSink,
    ) -> Result<()> {
        let bytes = operands.len();
        let token = self.requests.insert(Request {
            kind: RequestKind::AtomicWrite { bytes },
            sink,
        })?;
        self.post_atomic_request(
            AmOp::ReqAtomicWrite,
            dest,
            addr,
            key,
            token,
            datatype,
            op,
            count,
            &operands,
        )
    }

    /// Issue an atomic fetch.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_atomic_readwrite(
        &self,
        operands: Vec<u8>,
        result: u64,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        sink: CompletionSink,
    ) -> Result<()> {
        let bytes = operands.len();
        let token = self.requests.insert(Request {
            kind: RequestKind::AtomicFetch { result, bytes },
            sink,
        })?;
        self.post_atomic_request(
            AmOp::ReqAtomicReadwrite,
            dest,
            addr,
            key,
            token,
            datatype,
            op,
            count,
            &operands,
        )
    }

    /// Issue an atomic compare.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_atomic_compwrite(
        &self,
        mut operands: Vec<u8>,
        compare: &[u8],
        result: u64,
        count: usize,
        datatype: Datatype,
        op: AtomicOp,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        sink: CompletionSink,
    ) -> Result<()> {
        let bytes = operands.len();
        // Operands first, compare values second.
        operands.extend_from_slice(compare);
        let token = self.requests.insert(Request {
            kind: RequestKind::AtomicComp { result, bytes },
            sink,
        })?;
        self.post_atomic_request(
            AmOp::ReqAtomicCompwrite,
            dest,
            addr,
            key,
            token,
            datatype,
            op,
            count,
            &operands,
        )
    }

    /// Apply an incoming atomic request and reply with status and, for
    /// fetch/compare forms, the pre-image.
    pub(crate) fn handle_req_atomic(self: &Arc<Self>, src: PeerAddr, hdr: &FrameHeader, payload: &[u8]) {
        let (reply_op, status, pre_image) = match self.apply_atomic_request(hdr, payload) {
            Ok((reply_op, pre_image)) => (reply_op, code::OK, pre_image),
            Err((reply_op, error)) => {
                tracing::warn!(?src, key = hdr.key, addr = hdr.addr, %error, "remote atomic rejected");
                (reply_op, error.code(), Vec::new())
            }
        };
        let reply = FrameHeader {
            op: reply_op,
            flags: AmFlags::EOM,
            addr: 0,
            key: 0,
            req: hdr.req,
            data: status,
            len: hdr.len,
            aux: 0,
        };
        if let Err(error) = self.post_frame(src, &reply, &pre_image) {
            self.async_error(hdr.req, &error);
        }
    }

    fn apply_atomic_request(
        &self,
        hdr: &FrameHeader,
        payload: &[u8],
    ) -> std::result::Result<(AmOp, Vec<u8>), (AmOp, Error)> {
        let reply_op = match hdr.op {
            AmOp::ReqAtomicWrite => AmOp::RepAtomicWrite,
            AmOp::ReqAtomicReadwrite => AmOp::RepAtomicReadwrite,
            _ => AmOp::RepAtomicCompwrite,
        };
        let fail = |error: Error| (reply_op, error);

        let (datatype, op) = unpack(hdr.data).map_err(fail)?;
        let count = hdr.len as usize;
        let bytes = count * datatype.size();
        let is_comp = hdr.op == AmOp::ReqAtomicCompwrite;
        let expected_payload = if is_comp { bytes * 2 } else { bytes };
        if payload.len() != expected_payload || count == 0 {
            return Err(fail(Error::InvalidArg("malformed atomic payload")));
        }
        if op.is_compare() != is_comp {
            return Err(fail(Error::InvalidAtomic { datatype, op }));
        }

        let access = match hdr.op {
            AmOp::ReqAtomicWrite => Access::REMOTE_WRITE,
            _ => Access::REMOTE_READ | Access::REMOTE_WRITE,
        };
        let (region, eff) = self
            .mr
            .validate(hdr.key, hdr.addr, bytes, access)
            .map_err(fail)?;

        let wants_fetch = hdr.op != AmOp::ReqAtomicWrite;
        let mut pre_image = Vec::with_capacity(if wants_fetch { bytes } else { 0 });
        let (operands, compare) = if is_comp {
            (&payload[..bytes], Some(&payload[bytes..]))
        } else {
            (payload, None)
        };

        {
            // The region's memory must appear atomic to every concurrent
            // observer in the domain.
            let _guard = self.atomic_lock.lock();
            unsafe {
                apply(
                    datatype,
                    op,
                    eff as *mut u8,
                    count,
                    operands,
                    compare,
                    wants_fetch.then_some(&mut pre_image),
                )
            }
            .map_err(fail)?;
        }

        if let Some(cntr) = region.cntr() {
            cntr.add(1);
        }
        if let Some(ep) = self.rma_ep() {
            if let Some(cntr) = ep.remote_write_cntr() {
                cntr.add(1);
            }
        }
        Ok((reply_op, pre_image))
    }

    /// Handle an atomic reply: deliver the pre-image and complete.
    pub(crate) fn handle_rep_atomic(&self, hdr: &FrameHeader, payload: &[u8]) {
        let Some(request) = self.requests.remove(hdr.req) else {
            tracing::warn!(req = hdr.req, "atomic reply for unknown request");
            return;
        };
        let status = hdr.data;
        let (result, bytes) = match request.kind {
            RequestKind::AtomicWrite { bytes } => (None, bytes),
            RequestKind::AtomicFetch { result, bytes }
            | RequestKind::AtomicComp { result, bytes } => (Some(result), bytes),
            _ => {
                tracing::warn!(req = hdr.req, "atomic reply for non-atomic request");
                return;
            }
        };
        if status != code::OK {
            request.sink.complete(0, 0, status);
            return;
        }
        if let Some(result) = result {
            let n = payload.len().min(bytes);
            // The fetch poster guaranteed result buffer liveness.
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), result as *mut u8, n);
            }
        }
        request.sink.complete(bytes, 0, code::OK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let packed = pack(Datatype::U64, AtomicOp::CswapGt);
        assert_eq!(unpack(packed).unwrap(), (Datatype::U64, AtomicOp::CswapGt));
        assert!(unpack((0xFFu64 << 32) | 2).is_err());
    }

    #[test]
    fn test_sum_fetches_pre_image() {
        let mut target = [5u64, 10u64];
        let operands: Vec<u8> = [3u64, 4u64]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut old = Vec::new();
        unsafe {
            apply(
                Datatype::U64,
                AtomicOp::Sum,
                target.as_mut_ptr() as *mut u8,
                2,
                &operands,
                None,
                Some(&mut old),
            )
            .unwrap();
        }
        assert_eq!(target, [8, 14]);
        assert_eq!(
            old,
            [5u64, 10u64]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect::<Vec<u8>>()
        );
    }

    #[test]
    fn test_min_max_signed() {
        let mut target = [-3i32];
        let operand = (-7i32).to_le_bytes().to_vec();
        unsafe {
            apply(
                Datatype::I32,
                AtomicOp::Min,
                target.as_mut_ptr() as *mut u8,
                1,
                &operand,
                None,
                None,
            )
            .unwrap();
        }
        assert_eq!(target, [-7]);
        let operand = 2i32.to_le_bytes().to_vec();
        unsafe {
            apply(
                Datatype::I32,
                AtomicOp::Max,
                target.as_mut_ptr() as *mut u8,
                1,
                &operand,
                None,
                None,
            )
            .unwrap();
        }
        assert_eq!(target, [2]);
    }

    #[test]
    fn test_cswap_stores_only_on_match() {
        let mut target = [42u32];
        let operand = 99u32.to_le_bytes().to_vec();
        let wrong = 41u32.to_le_bytes().to_vec();
        let mut old = Vec::new();
        unsafe {
            apply(
                Datatype::U32,
                AtomicOp::Cswap,
                target.as_mut_ptr() as *mut u8,
                1,
                &operand,
                Some(&wrong),
                Some(&mut old),
            )
            .unwrap();
        }
        assert_eq!(target, [42]);
        assert_eq!(old, 42u32.to_le_bytes());

        let right = 42u32.to_le_bytes().to_vec();
        old.clear();
        unsafe {
            apply(
                Datatype::U32,
                AtomicOp::Cswap,
                target.as_mut_ptr() as *mut u8,
                1,
                &operand,
                Some(&right),
                Some(&mut old),
            )
            .unwrap();
        }
        assert_eq!(target, [99]);
        assert_eq!(old, 42u32.to_le_bytes());
    }

    #[test]
    fn test_mswap_masks_bits() {
        let mut target = [0b1010_1010u8];
        let operand = [0b1111_0000u8];
        let mask = [0b0011_1100u8];
        let mut old = Vec::new();
        unsafe {
            apply(
                Datatype::U8,
                AtomicOp::Mswap,
                target.as_mut_ptr(),
                1,
                &operand,
                Some(&mask),
                Some(&mut old),
            )
            .unwrap();
        }
        // (operand & mask) | (old & !mask)
        assert_eq!(target, [0b1011_0010]);
        assert_eq!(old, [0b1010_1010]);
    }

    #[test]
    fn test_float_bitwise_rejected() {
        assert!(!valid(Datatype::F64, AtomicOp::Bxor));
        let mut target = [1.0f64];
        let operand = 1.0f64.to_le_bytes().to_vec();
        let err = unsafe {
            apply(
                Datatype::F64,
                AtomicOp::Bxor,
                target.as_mut_ptr() as *mut u8,
                1,
                &operand,
                None,
                None,
            )
        }
        .unwrap_err();
        assert!(matches!(err, Error::InvalidAtomic { .. }));
    }

    #[test]
    fn test_float_sum() {
        let mut target = [1.5f32];
        let operand = 2.25f32.to_le_bytes().to_vec();
        unsafe {
            apply(
                Datatype::F32,
                AtomicOp::Sum,
                target.as_mut_ptr() as *mut u8,
                1,
                &operand,
                None,
                None,
            )
            .unwrap();
        }
        assert_eq!(target, [3.75]);
    }
}
