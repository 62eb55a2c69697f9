//! Emulated one-sided write and read.
//!
//! Writes ride the outbound stream machinery: each chunk is self-addressed
//! (base + offset) and validated independently at the responder, and the
//! final chunk's validation result comes back in the acknowledgment, unless
//! the initiator asked for none. Reads are a request frame answered by one
//! reply (short) or a flow-controlled chunk sequence (long); the initiator
//! tallies bytes per request and completes only when the end-of-message
//! chunk has arrived and the tally matches.

use std::sync::Arc;

use crate::am::{OutboundStream, StreamKind};
use crate::cntr::Counter;
use crate::cq::{CompFlags, CqEvent};
use crate::domain::DomainShared;
use crate::error::{Error, Result, code};
use crate::region::Access;
use crate::request::{CompletionSink, Request, RequestKind, NO_TOKEN};
use crate::substrate::PeerAddr;
use crate::wire::{AmFlags, AmOp, FrameHeader, CHUNK_SIZE};

/// Responder-side state of a long read being served.
pub(crate) struct ReadStream {
    pub dest: PeerAddr,
    /// Initiator's request token, echoed in every reply chunk.
    pub token: u64,
    /// Effective (validated) source address.
    pub addr: u64,
    pub len: usize,
    pub served: usize,
    /// Region counter to tick once the final chunk is out.
    pub cntr: Option<Arc<Counter>>,
}

impl DomainShared {
    /// Issue an emulated write.
    pub(crate) fn submit_write(
        &self,
        payload: Vec<u8>,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        sink: CompletionSink,
        wire_data: Option<u64>,
        delivery_complete: bool,
    ) -> Result<()> {
        let len = payload.len();
        let need_ack = sink.want_event || sink.cntr.is_some() || delivery_complete;

        let mut flags = AmFlags::empty();
        let mut data = 0;
        if let Some(value) = wire_data {
            flags |= AmFlags::DATA;
            data = value;
        }
        if delivery_complete {
            flags |= AmFlags::FORCE_ACK;
        }

        let (token, stream_sink) = if need_ack {
            let token = self.requests.insert(Request {
                kind: RequestKind::Write { len },
                sink,
            })?;
            (token, None)
        } else {
            flags |= AmFlags::NO_ACK;
            (NO_TOKEN, Some(sink))
        };

        let stream = OutboundStream {
            kind: StreamKind::Write { addr, key },
            dest,
            payload,
            sent: 0,
            token,
            flags,
            data,
            sink: stream_sink,
        };
        self.start_stream(stream).inspect_err(|_| {
            if token != NO_TOKEN {
                self.requests.remove(token);
            }
        })
    }

    /// Issue an emulated read into a raw local buffer.
    pub(crate) fn submit_read(
        &self,
        dest_buf: u64,
        len: usize,
        dest: PeerAddr,
        addr: u64,
        key: u64,
        sink: CompletionSink,
    ) -> Result<()> {
        let token = self.requests.insert(Request {
            kind: RequestKind::Read {
                dest: dest_buf,
                requested: len,
                received: 0,
                eom_seen: false,
                total: 0,
            },
            sink,
        })?;
        let op = if len <= CHUNK_SIZE {
            AmOp::ReqRead
        } else {
            AmOp::ReqReadLong
        };
        let hdr = FrameHeader {
            op,
            flags: AmFlags::empty(),
            addr,
            key,
            req: token,
            data: 0,
            len: len as u64,
            aux: 0,
        };
        self.post_frame(dest, &hdr, &[]).inspect_err(|_| {
            self.requests.remove(token);
        })
    }

    /// Apply one incoming write chunk.
    pub(crate) fn handle_req_write(self: &Arc<Self>, src: PeerAddr, hdr: &FrameHeader, payload: &[u8]) {
        let validated = self
            .mr
            .validate(hdr.key, hdr.addr, payload.len(), Access::REMOTE_WRITE);
        let status = match &validated {
            Ok((_, eff)) => {
                // Validation pinned [eff, eff + len) inside a registered
                // segment.
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), *eff as *mut u8, payload.len());
                }
                code::OK
            }
            Err(error) => {
                tracing::warn!(?src, key = hdr.key, addr = hdr.addr, %error, "remote write rejected");
                error.code()
            }
        };

        if !hdr.flags.contains(AmFlags::EOM) {
            return;
        }

        if status == code::OK {
            if let Ok((region, _)) = &validated {
                if let Some(cntr) = region.cntr() {
                    cntr.add(1);
                }
            }
            self.remote_write_event(src, hdr);
        }

        if !hdr.flags.contains(AmFlags::NO_ACK) || hdr.flags.contains(AmFlags::FORCE_ACK) {
            let reply = FrameHeader {
                op: AmOp::RepWrite,
                flags: AmFlags::EOM,
                addr: 0,
                key: 0,
                req: hdr.req,
                data: status,
                len: hdr.len,
                aux: 0,
            };
            if let Err(error) = self.post_frame(src, &reply, &[]) {
                self.async_error(hdr.req, &error);
            }
        }
    }

    /// Tick the RMA endpoint's remote-write counter and surface remote CQ
    /// data, for a write just applied against this domain.
    fn remote_write_event(&self, src: PeerAddr, hdr: &FrameHeader) {
        let Some(ep) = self.rma_ep() else { return };
        if let Some(cntr) = ep.remote_write_cntr() {
            cntr.add(1);
        }
        if hdr.flags.contains(AmFlags::DATA) {
            if let Some(cq) = ep.recv_cq() {
                cq.enqueue(CqEvent {
                    context: 0,
                    flags: CompFlags::REMOTE_WRITE | CompFlags::RMA | CompFlags::REMOTE_CQ_DATA,
                    len: hdr.len as usize,
                    data: hdr.data,
                    tag: 0,
                    olen: 0,
                    error: 0,
                    source: Some(src),
                });
            }
        }
    }

    /// Handle a write acknowledgment.
    pub(crate) fn handle_rep_write(&self, hdr: &FrameHeader) {
        let Some(request) = self.requests.remove(hdr.req) else {
            tracing::warn!(req = hdr.req, "write ack for unknown request");
            return;
        };
        let RequestKind::Write { len } = request.kind else {
            tracing::warn!(req = hdr.req, "write ack for non-write request");
            return;
        };
        request.sink.complete(len, 0, hdr.data);
    }

    /// Serve an incoming read request.
    pub(crate) fn handle_req_read(self: &Arc<Self>, src: PeerAddr, hdr: &FrameHeader) {
        let requested = hdr.len as usize;
        let (region, eff) = match self
            .mr
            .validate(hdr.key, hdr.addr, requested, Access::REMOTE_READ)
        {
            Ok(resolved) => resolved,
            Err(error) => {
                tracing::warn!(?src, key = hdr.key, addr = hdr.addr, %error, "remote read rejected");
                let reply = FrameHeader {
                    op: AmOp::RepRead,
                    flags: AmFlags::EOM,
                    addr: 0,
                    key: 0,
                    req: hdr.req,
                    data: error.code(),
                    len: 0,
                    aux: 0,
                };
                if let Err(post_error) = self.post_frame(src, &reply, &[]) {
                    self.async_error(hdr.req, &post_error);
                }
                return;
            }
        };

        if requested <= CHUNK_SIZE {
            let mut payload = vec![0u8; requested];
            // Validation pinned [eff, eff + requested) inside a registered
            // segment.
            unsafe {
                std::ptr::copy_nonoverlapping(eff as *const u8, payload.as_mut_ptr(), requested);
            }
            let reply = FrameHeader {
                op: AmOp::RepRead,
                flags: AmFlags::EOM,
                addr: 0,
                key: 0,
                req: hdr.req,
                data: code::OK,
                len: requested as u64,
                aux: 0,
            };
            match self.post_frame(src, &reply, &payload) {
                Ok(()) => self.remote_read_applied(region.cntr()),
                Err(error) => self.async_error(hdr.req, &error),
            }
        } else {
            self.read_queue.lock().push_back(ReadStream {
                dest: src,
                token: hdr.req,
                addr: eff,
                len: requested,
                served: 0,
                cntr: region.cntr(),
            });
        }
    }

    /// Advance long reads being served, one chunk per stream per call.
    pub(crate) fn pump_reads(&self) {
        let mut batch = Vec::new();
        {
            let mut read_queue = self.read_queue.lock();
            for _ in 0..self.config.pump_batch.min(read_queue.len()) {
                batch.push(read_queue.pop_front().unwrap());
            }
        }
        for mut stream in batch {
            let chunk = (stream.len - stream.served).min(CHUNK_SIZE);
            let mut payload = vec![0u8; chunk];
            // The range was validated when the stream was queued.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (stream.addr + stream.served as u64) as *const u8,
                    payload.as_mut_ptr(),
                    chunk,
                );
            }
            let eom = stream.served + chunk == stream.len;
            let reply = FrameHeader {
                op: AmOp::RepRead,
                flags: if eom { AmFlags::EOM } else { AmFlags::empty() },
                addr: 0,
                key: 0,
                req: stream.token,
                data: code::OK,
                len: stream.len as u64,
                aux: stream.served as u64,
            };
            match self.post_frame(stream.dest, &reply, &payload) {
                Ok(()) => {
                    stream.served += chunk;
                    if eom {
                        self.remote_read_applied(stream.cntr.take());
                    } else {
                        self.read_queue.lock().push_back(stream);
                    }
                }
                Err(error) => {
                    tracing::warn!(dest = ?stream.dest, %error, "read stream failed");
                    self.async_error(stream.token, &error);
                }
            }
        }
    }

    fn remote_read_applied(&self, region_cntr: Option<Arc<Counter>>) {
        if let Some(cntr) = region_cntr {
            cntr.add(1);
        }
        if let Some(ep) = self.rma_ep() {
            if let Some(cntr) = ep.remote_read_cntr() {
                cntr.add(1);
            }
        }
    }

    /// Accumulate one read reply chunk; complete at EOM + full tally.
    pub(crate) fn handle_rep_read(&self, hdr: &FrameHeader, payload: &[u8]) {
        let status = hdr.data;
        let done = self.requests.with_mut(hdr.req, |request| {
            let RequestKind::Read {
                dest,
                requested,
                received,
                eom_seen,
                total,
            } = &mut request.kind
            else {
                tracing::warn!(req = hdr.req, "read reply for non-read request");
                return false;
            };
            if status != code::OK {
                return true;
            }
            let off = hdr.aux as usize;
            if off < *requested {
                let n = payload.len().min(*requested - off);
                // The read poster guaranteed buffer liveness.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        payload.as_ptr(),
                        (*dest + off as u64) as *mut u8,
                        n,
                    );
                }
            }
            *received += payload.len();
            if hdr.flags.contains(AmFlags::EOM) {
                *eom_seen = true;
                *total = off + payload.len();
            }
            *eom_seen && *received >= *total
        });

        if done != Some(true) {
            if done.is_none() {
                tracing::warn!(req = hdr.req, "read reply for unknown request");
            }
            return;
        }
        let Some(request) = self.requests.remove(hdr.req) else {
            return;
        };
        let RequestKind::Read {
            requested, received, ..
        } = request.kind
        else {
            return;
        };

        if status != code::OK {
            request.sink.complete(0, 0, status);
        } else if received > requested {
            // Overflow: report the excess, never buffer it.
            let error = Error::Truncated {
                expected: requested,
                received,
            };
            request.sink.complete(requested, received - requested, error.code());
        } else {
            request.sink.complete(received, 0, code::OK);
        }
    }
}
