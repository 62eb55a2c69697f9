//! Frame dispatch and the AM-routed message path.
//!
//! Sends travel as chunked request frames keyed by (sender, token); the
//! responder reassembles into a matching posted receive, or into an
//! unexpected-message record when none is posted yet, and acknowledges the
//! final chunk. Outbound multi-chunk transfers (sends and writes share the
//! shape) park in the domain transmit queue and advance one chunk per
//! stream per progress call.

use std::sync::Arc;

use crate::cq::CompFlags;
use crate::domain::DomainShared;
use crate::error::{code, Error, Result};
use crate::request::{
    CompletionSink, InboundStream, InboundTarget, RecvReq, Request, RequestKind, Unexp, NO_TOKEN,
};
use crate::substrate::PeerAddr;
use crate::wire::{AmFlags, AmOp, FrameHeader, CHUNK_SIZE, HDR_SIZE};

/// What an outbound stream's chunks do at the responder.
pub(crate) enum StreamKind {
    /// Remote write against (addr, key).
    Write { addr: u64, key: u64 },
    /// AM-routed send.
    Send,
}

/// One outbound chunked transfer.
pub(crate) struct OutboundStream {
    pub kind: StreamKind,
    pub dest: PeerAddr,
    pub payload: Vec<u8>,
    pub sent: usize,
    /// Request token echoed by the ack; [`NO_TOKEN`] when no ack is wanted.
    pub token: u64,
    /// Base flags stamped on every chunk (DATA, NO_ACK, FORCE_ACK).
    pub flags: AmFlags,
    pub data: u64,
    /// Completed at final-chunk transmission when no ack will arrive.
    pub sink: Option<CompletionSink>,
}

impl DomainShared {
    /// Decode one arrival and route it to its handler.
    pub(crate) fn dispatch(self: &Arc<Self>, src: PeerAddr, msg: Vec<u8>) {
        let hdr = match FrameHeader::decode(&msg) {
            Ok(hdr) => hdr,
            Err(error) => {
                tracing::warn!(?src, %error, "dropping undecodable frame");
                return;
            }
        };
        let payload = &msg[HDR_SIZE..];
        tracing::trace!(?src, op = ?hdr.op, req = hdr.req, aux = hdr.aux, len = payload.len(), "dispatch");
        match hdr.op {
            AmOp::ReqWrite | AmOp::ReqWriteLong => self.handle_req_write(src, &hdr, payload),
            AmOp::RepWrite => self.handle_rep_write(&hdr),
            AmOp::ReqRead | AmOp::ReqReadLong => self.handle_req_read(src, &hdr),
            AmOp::RepRead => self.handle_rep_read(&hdr, payload),
            AmOp::ReqSend => self.handle_req_send(src, &hdr, payload),
            AmOp::RepSend => self.handle_rep_send(&hdr),
            AmOp::ReqAtomicWrite | AmOp::ReqAtomicReadwrite | AmOp::ReqAtomicCompwrite => {
                self.handle_req_atomic(src, &hdr, payload)
            }
            AmOp::RepAtomicWrite | AmOp::RepAtomicReadwrite | AmOp::RepAtomicCompwrite => {
                self.handle_rep_atomic(&hdr, payload)
            }
        }
    }

    /// Issue an AM-routed send.
    pub(crate) fn submit_send(
        &self,
        payload: Vec<u8>,
        dest: PeerAddr,
        sink: CompletionSink,
        wire_data: Option<u64>,
    ) -> Result<()> {
        let len = payload.len();
        let token = self.requests.insert(Request {
            kind: RequestKind::Send { len },
            sink,
        })?;
        let mut flags = AmFlags::empty();
        let mut data = 0;
        if let Some(value) = wire_data {
            flags |= AmFlags::DATA;
            data = value;
        }
        let stream = OutboundStream {
            kind: StreamKind::Send,
            dest,
            payload,
            sent: 0,
            token,
            flags,
            data,
            sink: None,
        };
        self.start_stream(stream).inspect_err(|_| {
            self.requests.remove(token);
        })
    }

    /// Post a receive, matching buffered unexpected messages first.
    pub(crate) fn submit_recv(&self, recv: RecvReq) -> Result<()> {
        let matched = {
            let mut unexp_queue = self.unexp_queue.lock();
            let position = unexp_queue
                .iter()
                .position(|u| u.done && recv.src.map_or(true, |src| src == u.sender));
            position.and_then(|i| unexp_queue.remove(i))
        };
        match matched {
            Some(unexp) => {
                deliver_unexp(recv, unexp);
                Ok(())
            }
            None => {
                self.recv_queue.lock().push_back(recv);
                Ok(())
            }
        }
    }

    /// Transmit the first chunk; park the remainder for the pump.
    pub(crate) fn start_stream(&self, mut stream: OutboundStream) -> Result<()> {
        let done = self.advance_stream(&mut stream)?;
        if done {
            if let Some(sink) = stream.sink.take() {
                sink.complete(stream.payload.len(), 0, 0);
            }
        } else {
            self.tx_queue.lock().push_back(stream);
        }
        Ok(())
    }

    /// Send the stream's next chunk. Returns true when the EOM chunk went
    /// out.
    fn advance_stream(&self, stream: &mut OutboundStream) -> Result<bool> {
        let total = stream.payload.len();
        let end = (stream.sent + CHUNK_SIZE).min(total);
        let eom = end == total;
        let mut flags = stream.flags;
        if eom {
            flags |= AmFlags::EOM;
        }
        let (op, addr, key) = match stream.kind {
            StreamKind::Send => (AmOp::ReqSend, 0, 0),
            StreamKind::Write { addr, key } => {
                let op = if total <= CHUNK_SIZE {
                    AmOp::ReqWrite
                } else {
                    AmOp::ReqWriteLong
                };
                (op, addr + stream.sent as u64, key)
            }
        };
        let hdr = FrameHeader {
            op,
            flags,
            addr,
            key,
            req: stream.token,
            data: stream.data,
            len: total as u64,
            aux: stream.sent as u64,
        };
        self.post_frame(stream.dest, &hdr, &stream.payload[stream.sent..end])?;
        stream.sent = end;
        Ok(eom)
    }

    /// Advance parked outbound streams, one chunk per stream per call.
    pub(crate) fn pump_tx(&self) {
        let mut batch = Vec::new();
        {
            let mut tx_queue = self.tx_queue.lock();
            for _ in 0..self.config.pump_batch.min(tx_queue.len()) {
                batch.push(tx_queue.pop_front().unwrap());
            }
        }
        for mut stream in batch {
            match self.advance_stream(&mut stream) {
                Ok(true) => {
                    if let Some(sink) = stream.sink.take() {
                        sink.complete(stream.payload.len(), 0, 0);
                    }
                }
                Ok(false) => self.tx_queue.lock().push_back(stream),
                Err(error) => self.fail_stream(stream, &error),
            }
        }
    }

    /// Terminate a stream whose transmission failed.
    pub(crate) fn fail_stream(&self, mut stream: OutboundStream, error: &Error) {
        tracing::warn!(dest = ?stream.dest, %error, "outbound stream failed");
        if stream.token != NO_TOKEN {
            if let Some(request) = self.requests.remove(stream.token) {
                request.sink.complete(0, 0, error.code());
                return;
            }
        }
        if let Some(sink) = stream.sink.take() {
            sink.complete(0, 0, error.code());
        } else {
            self.async_error(0, error);
        }
    }

    /// Handle one chunk of an AM-routed send.
    fn handle_req_send(self: &Arc<Self>, src: PeerAddr, hdr: &FrameHeader, payload: &[u8]) {
        let total = hdr.len as usize;
        let stream_key = (src, hdr.req);
        let wire_data = hdr.flags.contains(AmFlags::DATA).then_some(hdr.data);

        let finished = {
            let mut streams = self.streams.lock();
            let stream = streams.entry(stream_key).or_insert_with(|| {
                let target = match self.match_posted_recv(src) {
                    Some(recv) => InboundTarget::Recv(recv),
                    None => InboundTarget::Unexp(Unexp {
                        sender: src,
                        token: hdr.req,
                        buf: vec![0u8; total],
                        received: 0,
                        done: false,
                        data: wire_data,
                    }),
                };
                InboundStream {
                    target,
                    received: 0,
                    total,
                }
            });

            let off = hdr.aux as usize;
            match &mut stream.target {
                InboundTarget::Recv(recv) => {
                    if off < recv.len {
                        let n = payload.len().min(recv.len - off);
                        // The receive poster guaranteed buffer liveness.
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                payload.as_ptr(),
                                (recv.buf + off as u64) as *mut u8,
                                n,
                            );
                        }
                    }
                    if let Some(value) = wire_data {
                        recv.sink.data = value;
                        recv.sink.comp_flags |= CompFlags::REMOTE_CQ_DATA;
                    }
                }
                InboundTarget::Unexp(unexp) => {
                    if off + payload.len() <= unexp.buf.len() {
                        unexp.buf[off..off + payload.len()].copy_from_slice(payload);
                    }
                    unexp.received += payload.len();
                    if wire_data.is_some() {
                        unexp.data = wire_data;
                    }
                }
            }
            stream.received += payload.len();

            if hdr.flags.contains(AmFlags::EOM) {
                streams.remove(&stream_key)
            } else {
                None
            }
        };

        let Some(stream) = finished else { return };

        let mut status = code::OK;
        match stream.target {
            InboundTarget::Recv(recv) => {
                finish_recv(recv, stream.received, src);
            }
            InboundTarget::Unexp(mut unexp) => {
                unexp.done = true;
                unexp.received = stream.received;
                // A receive may have been posted while the stream was in
                // flight; deliver straight through if so.
                match self.match_posted_recv(src) {
                    Some(recv) => deliver_unexp(recv, unexp),
                    None => {
                        let mut unexp_queue = self.unexp_queue.lock();
                        if unexp_queue.len() >= self.config.max_unexpected {
                            drop(unexp_queue);
                            tracing::warn!(?src, "unexpected queue full, dropping message");
                            status = Error::QueueOverrun.code();
                            self.async_error(0, &Error::QueueOverrun);
                        } else {
                            unexp_queue.push_back(unexp);
                        }
                    }
                }
            }
        }

        let reply = FrameHeader {
            op: AmOp::RepSend,
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

    /// Handle a send acknowledgment.
    fn handle_rep_send(&self, hdr: &FrameHeader) {
        let Some(request) = self.requests.remove(hdr.req) else {
            tracing::warn!(req = hdr.req, "send ack for unknown request");
            return;
        };
        let RequestKind::Send { len } = request.kind else {
            tracing::warn!(req = hdr.req, "send ack for non-send request");
            return;
        };
        request.sink.complete(len, 0, hdr.data);
    }

    /// Pop the first posted receive matching a sender.
    fn match_posted_recv(&self, src: PeerAddr) -> Option<RecvReq> {
        let mut recv_queue = self.recv_queue.lock();
        let position = recv_queue
            .iter()
            .position(|r| r.src.map_or(true, |want| want == src));
        position.and_then(|i| recv_queue.remove(i))
    }
}

/// Complete a matched receive: clamp to the buffer, report overflow.
fn finish_recv(mut recv: RecvReq, received: usize, src: PeerAddr) {
    let len = received.min(recv.len);
    let olen = received - len;
    let code = if olen > 0 {
        Error::Truncated {
            expected: recv.len,
            received,
        }
        .code()
    } else {
        0
    };
    recv.sink.source = Some(src);
    recv.sink.complete(len, olen, code);
}

/// Copy a buffered unexpected message into a posted receive and complete it.
fn deliver_unexp(mut recv: RecvReq, unexp: Unexp) {
    tracing::debug!(sender = ?unexp.sender, token = unexp.token, bytes = unexp.received, "matched unexpected message");
    let n = unexp.received.min(recv.len).min(unexp.buf.len());
    // The receive poster guaranteed buffer liveness.
    unsafe {
        std::ptr::copy_nonoverlapping(unexp.buf.as_ptr(), recv.buf as *mut u8, n);
    }
    if let Some(value) = unexp.data {
        recv.sink.data = value;
        recv.sink.comp_flags |= CompFlags::REMOTE_CQ_DATA;
    }
    finish_recv(recv, unexp.received, unexp.sender);
}
