//! Loopback integration tests.
//!
//! Two domains on one in-process hub exercise the full protocol: emulated
//! writes and reads, atomics, AM-routed send/recv with unexpected-message
//! buffering, counters, and triggered operations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use softrma::error::code;
use softrma::wire::{AmFlags, AmOp, FrameHeader};
use softrma::{
    Access, AtomicOp, CntrKind, CqFormat, Datatype, Domain, DomainConfig, Error, InprocHub,
    OpFlags, RegionDesc, Substrate,
};

// =============================================================================
// Helpers
// =============================================================================

fn pair() -> (Domain, Domain) {
    let hub = InprocHub::new();
    let a = Domain::new(hub.open_port(), DomainConfig::default()).unwrap();
    let b = Domain::new(hub.open_port(), DomainConfig::default()).unwrap();
    (a, b)
}

/// Drive both domains until the predicate holds. Returns the number of
/// progress rounds it took.
fn drive_until(a: &Domain, b: &Domain, mut done: impl FnMut() -> bool) -> usize {
    let start = Instant::now();
    let mut rounds = 0;
    while start.elapsed() < Duration::from_secs(5) {
        a.progress();
        b.progress();
        rounds += 1;
        if done() {
            return rounds;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
    panic!("operation did not complete within timeout");
}

fn peek(addr: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = unsafe { std::ptr::read_volatile((addr + i as u64) as *const u8) };
    }
    out
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// =============================================================================
// Write Tests
// =============================================================================

#[test]
fn test_short_write_completes() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 4096];
    let base = window.as_mut_ptr() as u64;
    let region_cntr = target.cntr_open();
    target
        .mr_reg(
            RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 0x10)
                .with_cntr(region_cntr.clone()),
        )
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let wcntr = initiator.cntr_open();
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());
    ep.bind_cntr(CntrKind::Write, wcntr.clone());

    ep.write(
        b"hello world",
        target.local_addr(),
        base + 8,
        0x10,
        77,
        OpFlags::empty(),
        0,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&initiator, &target, || {
        events.extend(cq.read(8).unwrap());
        !events.is_empty()
    });
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].context, 77);
    assert_eq!(events[0].error, 0);
    assert_eq!(events[0].len, 11);

    assert_eq!(&peek(base + 8, 11), b"hello world");
    assert_eq!(wcntr.read(), 1);
    assert_eq!(region_cntr.read(), 1);
}

#[test]
fn test_long_write_chunked() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 8192];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 1))
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());

    let payload = pattern(5000);
    ep.write(
        &payload,
        target.local_addr(),
        base,
        1,
        1,
        OpFlags::empty(),
        0,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&initiator, &target, || {
        events.extend(cq.read(8).unwrap());
        !events.is_empty()
    });
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].error, 0);
    assert_eq!(events[0].len, 5000);
    assert_eq!(peek(base, 5000), payload);
}

#[test]
fn test_write_validation_scenarios() {
    // Region of 0x1000 bytes with write rights: a contained write succeeds
    // and ticks the region counter; a write running past the end is
    // rejected with a range violation, surfaces an error completion, and
    // leaves the counter unchanged.
    let (initiator, target) = pair();

    let mut window = vec![0u8; 0x1000];
    let base = window.as_mut_ptr() as u64;
    let region_cntr = target.cntr_open();
    target
        .mr_reg(
            RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 9)
                .with_cntr(region_cntr.clone()),
        )
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let wcntr = initiator.cntr_open();
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());
    ep.bind_cntr(CntrKind::Write, wcntr.clone());

    // Contained: [base + 0x800, base + 0x900).
    let payload = pattern(0x100);
    ep.write(
        &payload,
        target.local_addr(),
        base + 0x800,
        9,
        1,
        OpFlags::empty(),
        0,
    )
    .unwrap();
    let mut got = Vec::new();
    drive_until(&initiator, &target, || {
        got.extend(cq.read(8).unwrap());
        !got.is_empty()
    });
    assert_eq!(got[0].error, 0);
    assert_eq!(peek(base + 0x800, 0x100), payload);
    assert_eq!(region_cntr.read(), 1);
    assert_eq!(wcntr.read(), 1);

    // Overhanging: [base + 0xF00, base + 0x1100) runs past the region end.
    ep.write(
        &pattern(0x200),
        target.local_addr(),
        base + 0xF00,
        9,
        2,
        OpFlags::empty(),
        0,
    )
    .unwrap();
    drive_until(&initiator, &target, || {
        matches!(cq.read(1), Err(Error::ErrorAvailable))
    });

    let err = cq.readerr().unwrap();
    assert_eq!(err.context, 2);
    assert_eq!(err.error, code::RANGE);
    // Normal reads work again once the error slot is drained.
    assert!(cq.read(1).unwrap().is_empty());
    // No data applied, no counter movement.
    assert_eq!(region_cntr.read(), 1);
    assert_eq!(wcntr.read(), 1);
    assert_eq!(wcntr.read_err(), 1);
}

#[test]
fn test_write_bad_key_rejected() {
    let (initiator, target) = pair();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());

    ep.write(
        b"data",
        target.local_addr(),
        0x1000,
        0xBAD,
        3,
        OpFlags::empty(),
        0,
    )
    .unwrap();
    drive_until(&initiator, &target, || {
        matches!(cq.read(1), Err(Error::ErrorAvailable))
    });
    let err = cq.readerr().unwrap();
    assert_eq!(err.error, code::BAD_KEY);
    assert_eq!(err.context, 3);
}

#[test]
fn test_write_without_completion_bindings_still_lands() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 128];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 4))
        .unwrap();

    // No CQ, no counter: the acknowledgment is suppressed entirely.
    let ep = initiator.ep_open();
    ep.write(
        b"quiet",
        target.local_addr(),
        base,
        4,
        0,
        OpFlags::empty(),
        0,
    )
    .unwrap();

    drive_until(&initiator, &target, || peek(base, 5) == b"quiet");
}

#[test]
fn test_inject_write_skips_event_but_ticks_counter() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 128];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 5))
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let wcntr = initiator.cntr_open();
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());
    ep.bind_cntr(CntrKind::Write, wcntr.clone());

    ep.write(
        b"tiny",
        target.local_addr(),
        base,
        5,
        0,
        OpFlags::INJECT,
        0,
    )
    .unwrap();
    drive_until(&initiator, &target, || wcntr.read() == 1);
    assert!(cq.read(8).unwrap().is_empty());

    // Inject is bounded.
    let big = vec![0u8; softrma::INJECT_SIZE + 1];
    assert!(matches!(
        ep.write(
            &big,
            target.local_addr(),
            base,
            5,
            0,
            OpFlags::INJECT,
            0
        ),
        Err(Error::MessageTooLarge { .. })
    ));
}

#[test]
fn test_selective_completion() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 128];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 6))
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let wcntr = initiator.cntr_open();
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());
    ep.bind_cntr(CntrKind::Write, wcntr.clone());
    ep.set_selective_completion(true);

    ep.write(b"aa", target.local_addr(), base, 6, 1, OpFlags::empty(), 0)
        .unwrap();
    drive_until(&initiator, &target, || wcntr.read() == 1);
    assert!(cq.read(8).unwrap().is_empty());

    ep.write(
        b"bb",
        target.local_addr(),
        base,
        6,
        2,
        OpFlags::COMPLETION,
        0,
    )
    .unwrap();
    let mut got = Vec::new();
    drive_until(&initiator, &target, || {
        got.extend(cq.read(8).unwrap());
        !got.is_empty()
    });
    assert_eq!(got[0].context, 2);
}

#[test]
fn test_remote_write_event_on_rma_endpoint() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 256];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 7))
        .unwrap();

    let target_cq = target.cq_open(CqFormat::Data, None);
    let remote_wcntr = target.cntr_open();
    let target_ep = target.ep_open();
    target_ep.bind_recv_cq(target_cq.clone());
    target_ep.bind_cntr(CntrKind::RemoteWrite, remote_wcntr.clone());
    target_ep.enable();

    let ep = initiator.ep_open();
    ep.write(
        b"imm",
        target.local_addr(),
        base,
        7,
        0,
        OpFlags::REMOTE_CQ_DATA,
        0xDEAD_BEEF,
    )
    .unwrap();

    let mut got = Vec::new();
    drive_until(&initiator, &target, || {
        got.extend(target_cq.read(8).unwrap());
        !got.is_empty()
    });
    assert_eq!(got[0].data, 0xDEAD_BEEF);
    assert!(got[0]
        .flags
        .contains(softrma::CompFlags::REMOTE_WRITE | softrma::CompFlags::REMOTE_CQ_DATA));
    assert_eq!(got[0].source, Some(initiator.local_addr()));
    assert_eq!(remote_wcntr.read(), 1);
}

// =============================================================================
// Read Tests
// =============================================================================

#[test]
fn test_short_read() {
    let (initiator, target) = pair();

    let mut window = pattern(512);
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_READ, 20))
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let rcntr = initiator.cntr_open();
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());
    ep.bind_cntr(CntrKind::Read, rcntr.clone());

    let mut local = vec![0u8; 256];
    let local_addr = local.as_mut_ptr() as u64;
    unsafe {
        ep.read(
            local_addr,
            256,
            target.local_addr(),
            base + 128,
            20,
            5,
            OpFlags::empty(),
        )
        .unwrap();
    }

    let mut got = Vec::new();
    drive_until(&initiator, &target, || {
        got.extend(cq.read(8).unwrap());
        !got.is_empty()
    });
    assert_eq!(got[0].error, 0);
    assert_eq!(got[0].len, 256);
    assert_eq!(peek(local_addr, 256), window[128..384].to_vec());
    assert_eq!(rcntr.read(), 1);
}

#[test]
fn test_long_read_10000_bytes_in_five_chunks() {
    let (initiator, target) = pair();

    let mut window = pattern(10_000);
    let base = window.as_mut_ptr() as u64;
    let region_cntr = target.cntr_open();
    target
        .mr_reg(
            RegionDesc::new(base, window.len(), Access::REMOTE_READ, 21)
                .with_cntr(region_cntr.clone()),
        )
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());

    let mut local = vec![0u8; 10_000];
    let local_addr = local.as_mut_ptr() as u64;
    unsafe {
        ep.read(
            local_addr,
            10_000,
            target.local_addr(),
            base,
            21,
            6,
            OpFlags::empty(),
        )
        .unwrap();
    }

    let mut got = Vec::new();
    let rounds = drive_until(&initiator, &target, || {
        got.extend(cq.read(8).unwrap());
        !got.is_empty()
    });
    // 10_000 bytes at the 2032-byte chunk limit is 5 reply chunks, served
    // one per progress round; completion cannot have happened earlier.
    assert!(rounds >= 5, "completed after only {rounds} rounds");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].error, 0);
    assert_eq!(got[0].len, 10_000);
    assert_eq!(peek(local_addr, 10_000), window);
    assert_eq!(region_cntr.read(), 1);
}

#[test]
fn test_read_denied_without_remote_read() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 64];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 22))
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());

    let mut local = vec![0u8; 64];
    unsafe {
        ep.read(
            local.as_mut_ptr() as u64,
            64,
            target.local_addr(),
            base,
            22,
            9,
            OpFlags::empty(),
        )
        .unwrap();
    }
    drive_until(&initiator, &target, || {
        matches!(cq.read(1), Err(Error::ErrorAvailable))
    });
    let err = cq.readerr().unwrap();
    assert_eq!(err.error, code::ACCESS);
}

#[test]
fn test_read_overflow_reports_excess() {
    // A misbehaving responder that returns more bytes than requested must
    // surface an overflow error, with the excess in olen and nothing
    // written past the requested length.
    let hub = InprocHub::new();
    let initiator = Domain::new(hub.open_port(), DomainConfig::default()).unwrap();
    let rogue = hub.open_port();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());

    let mut local = vec![0xFFu8; 160];
    let local_addr = local.as_mut_ptr() as u64;
    unsafe {
        ep.read(
            local_addr,
            100,
            rogue.local_addr(),
            0x5000,
            1,
            3,
            OpFlags::empty(),
        )
        .unwrap();
    }

    // The first request on a fresh domain gets token 0; answer it with 150
    // bytes instead of the requested 100.
    let (_, request) = rogue.poll().expect("read request frame");
    let req_hdr = FrameHeader::decode(&request).unwrap();
    assert_eq!(req_hdr.op, AmOp::ReqRead);
    let reply = FrameHeader {
        op: AmOp::RepRead,
        flags: AmFlags::EOM,
        addr: 0,
        key: 0,
        req: req_hdr.req,
        data: 0,
        len: 150,
        aux: 0,
    };
    rogue
        .post(initiator.local_addr(), reply.frame(&pattern(150)))
        .unwrap();

    let start = Instant::now();
    loop {
        initiator.progress();
        if matches!(cq.read(1), Err(Error::ErrorAvailable)) {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }
    let err = cq.readerr().unwrap();
    assert_eq!(err.error, code::TRUNC);
    assert_eq!(err.len, 100);
    assert_eq!(err.olen, 50);
    assert_eq!(peek(local_addr, 100), pattern(150)[..100].to_vec());
    // Bytes past the requested length are untouched.
    assert_eq!(peek(local_addr + 100, 60), vec![0xFFu8; 60]);
}

// =============================================================================
// Send/Recv Tests
// =============================================================================

#[test]
fn test_send_to_posted_recv() {
    let (sender, receiver) = pair();

    let send_cq = sender.cq_open(CqFormat::Msg, None);
    let sep = sender.ep_open();
    sep.bind_send_cq(send_cq.clone());

    let recv_cq = receiver.cq_open(CqFormat::Msg, None);
    let rcntr = receiver.cntr_open();
    let rep = receiver.ep_open();
    rep.bind_recv_cq(recv_cq.clone());
    rep.bind_cntr(CntrKind::Recv, rcntr.clone());

    let mut inbox = vec![0u8; 64];
    let inbox_addr = inbox.as_mut_ptr() as u64;
    unsafe {
        rep.recv(inbox_addr, 64, None, 11, OpFlags::empty()).unwrap();
    }

    sep.send(b"ping", receiver.local_addr(), 10, OpFlags::empty(), 0)
        .unwrap();

    let mut recv_got = Vec::new();
    let mut send_got = Vec::new();
    drive_until(&sender, &receiver, || {
        recv_got.extend(recv_cq.read(8).unwrap());
        send_got.extend(send_cq.read(8).unwrap());
        !recv_got.is_empty() && !send_got.is_empty()
    });

    assert_eq!(recv_got[0].context, 11);
    assert_eq!(recv_got[0].len, 4);
    assert_eq!(recv_got[0].source, Some(sender.local_addr()));
    assert_eq!(peek(inbox_addr, 4), b"ping".to_vec());
    assert_eq!(rcntr.read(), 1);

    assert_eq!(send_got[0].context, 10);
    assert_eq!(send_got[0].error, 0);
}

#[test]
fn test_unexpected_send_delivered_to_late_recv() {
    let (sender, receiver) = pair();

    let sep = sender.ep_open();
    let send_cq = sender.cq_open(CqFormat::Msg, None);
    sep.bind_send_cq(send_cq.clone());

    sep.send(b"early bird", receiver.local_addr(), 1, OpFlags::empty(), 0)
        .unwrap();

    // Let the message land unexpectedly and the send complete.
    let mut send_got = Vec::new();
    drive_until(&sender, &receiver, || {
        send_got.extend(send_cq.read(8).unwrap());
        !send_got.is_empty()
    });

    let recv_cq = receiver.cq_open(CqFormat::Msg, None);
    let rep = receiver.ep_open();
    rep.bind_recv_cq(recv_cq.clone());

    let mut inbox = vec![0u8; 64];
    let inbox_addr = inbox.as_mut_ptr() as u64;
    unsafe {
        rep.recv(
            inbox_addr,
            64,
            Some(sender.local_addr()),
            12,
            OpFlags::empty(),
        )
        .unwrap();
    }

    // Matching happens at post time; no further progress needed.
    let got = recv_cq.read(8).unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].len, 10);
    assert_eq!(got[0].source, Some(sender.local_addr()));
    assert_eq!(peek(inbox_addr, 10), b"early bird".to_vec());
}

#[test]
fn test_unexpected_truncation_reports_overflow() {
    let (sender, receiver) = pair();

    let send_cq = sender.cq_open(CqFormat::Msg, None);
    let sep = sender.ep_open();
    sep.bind_send_cq(send_cq.clone());
    sep.send(&pattern(100), receiver.local_addr(), 1, OpFlags::empty(), 0)
        .unwrap();
    // The acked send proves the message is buffered at the receiver.
    let mut send_got = Vec::new();
    drive_until(&sender, &receiver, || {
        send_got.extend(send_cq.read(8).unwrap());
        !send_got.is_empty()
    });

    let recv_cq = receiver.cq_open(CqFormat::Msg, None);
    let rep = receiver.ep_open();
    rep.bind_recv_cq(recv_cq.clone());

    let mut inbox = vec![0u8; 40];
    let inbox_addr = inbox.as_mut_ptr() as u64;
    unsafe {
        rep.recv(inbox_addr, 40, None, 13, OpFlags::empty()).unwrap();
    }

    assert!(matches!(recv_cq.read(1), Err(Error::ErrorAvailable)));
    let err = recv_cq.readerr().unwrap();
    assert_eq!(err.context, 13);
    assert_eq!(err.error, code::TRUNC);
    assert_eq!(err.len, 40);
    assert_eq!(err.olen, 60);
    assert_eq!(peek(inbox_addr, 40), pattern(100)[..40].to_vec());
}

#[test]
fn test_long_send_reassembles() {
    let (sender, receiver) = pair();

    let recv_cq = receiver.cq_open(CqFormat::Msg, None);
    let rep = receiver.ep_open();
    rep.bind_recv_cq(recv_cq.clone());

    let mut inbox = vec![0u8; 8192];
    let inbox_addr = inbox.as_mut_ptr() as u64;
    unsafe {
        rep.recv(inbox_addr, 8192, None, 14, OpFlags::empty()).unwrap();
    }

    let sep = sender.ep_open();
    let payload = pattern(5000);
    sep.send(&payload, receiver.local_addr(), 2, OpFlags::empty(), 0)
        .unwrap();

    let mut got = Vec::new();
    drive_until(&sender, &receiver, || {
        got.extend(recv_cq.read(8).unwrap());
        !got.is_empty()
    });
    assert_eq!(got[0].len, 5000);
    assert_eq!(peek(inbox_addr, 5000), payload);
}

#[test]
fn test_send_carries_remote_cq_data() {
    let (sender, receiver) = pair();

    let recv_cq = receiver.cq_open(CqFormat::Data, None);
    let rep = receiver.ep_open();
    rep.bind_recv_cq(recv_cq.clone());

    let mut inbox = vec![0u8; 16];
    unsafe {
        rep.recv(inbox.as_mut_ptr() as u64, 16, None, 15, OpFlags::empty())
            .unwrap();
    }

    let sep = sender.ep_open();
    sep.send(
        b"x",
        receiver.local_addr(),
        3,
        OpFlags::REMOTE_CQ_DATA,
        0xABCD,
    )
    .unwrap();

    let mut got = Vec::new();
    drive_until(&sender, &receiver, || {
        got.extend(recv_cq.read(8).unwrap());
        !got.is_empty()
    });
    assert_eq!(got[0].data, 0xABCD);
    assert!(got[0].flags.contains(softrma::CompFlags::REMOTE_CQ_DATA));
}

#[test]
fn test_unexpected_overflow_reports_async_error() {
    let hub = InprocHub::new();
    let sender = Domain::new(hub.open_port(), DomainConfig::default()).unwrap();
    let receiver = Domain::new(
        hub.open_port(),
        DomainConfig::default().with_max_unexpected(0),
    )
    .unwrap();

    let eq = receiver.eq_open(None);
    receiver.bind_eq(eq.clone());

    let send_cq = sender.cq_open(CqFormat::Msg, None);
    let sep = sender.ep_open();
    sep.bind_send_cq(send_cq.clone());
    sep.send(b"dropped", receiver.local_addr(), 1, OpFlags::empty(), 0)
        .unwrap();

    // The sender's ack reports the resource failure.
    drive_until(&sender, &receiver, || {
        matches!(send_cq.read(1), Err(Error::ErrorAvailable))
    });
    let err = send_cq.readerr().unwrap();
    assert_eq!(err.error, code::RESOURCE);

    // And the receiver's event queue records the async error.
    let eq_err = eq.readerr().expect("async error event");
    assert_eq!(eq_err.error, code::RESOURCE);
}

// =============================================================================
// Atomic Tests
// =============================================================================

struct AtomicSetup {
    initiator: Domain,
    target: Domain,
    cq: Arc<softrma::CompletionQueue>,
    ep: Arc<softrma::Endpoint>,
    base: u64,
    _window: Vec<u8>,
}

fn atomic_setup(initial: &[u8], access: Access) -> AtomicSetup {
    let (initiator, target) = pair();
    let mut window = initial.to_vec();
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), access, 30))
        .unwrap();
    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());
    AtomicSetup {
        initiator,
        target,
        cq,
        ep,
        base,
        _window: window,
    }
}

fn wait_one(setup: &AtomicSetup) -> softrma::CqEvent {
    let mut got = Vec::new();
    drive_until(&setup.initiator, &setup.target, || {
        got.extend(setup.cq.read(8).unwrap());
        !got.is_empty()
    });
    got.remove(0)
}

#[test]
fn test_atomic_fetch_add() {
    let setup = atomic_setup(
        &5u64.to_le_bytes(),
        Access::REMOTE_READ | Access::REMOTE_WRITE,
    );

    let mut result = [0u8; 8];
    let operand = 3u64.to_le_bytes();
    unsafe {
        setup
            .ep
            .atomic_readwrite(
                &operand,
                result.as_mut_ptr() as u64,
                1,
                Datatype::U64,
                AtomicOp::Sum,
                setup.target.local_addr(),
                setup.base,
                30,
                40,
                OpFlags::empty(),
            )
            .unwrap();
    }
    let event = wait_one(&setup);
    assert_eq!(event.error, 0);
    assert_eq!(event.len, 8);
    assert_eq!(u64::from_le_bytes(peek(setup.base, 8).try_into().unwrap()), 8);
    assert_eq!(
        u64::from_le_bytes(peek(result.as_ptr() as u64, 8).try_into().unwrap()),
        5
    );
}

#[test]
fn test_atomic_compare_swap() {
    let setup = atomic_setup(
        &42u32.to_le_bytes(),
        Access::REMOTE_READ | Access::REMOTE_WRITE,
    );

    // Mismatched compare: no store, pre-image returned.
    let mut result = [0u8; 4];
    unsafe {
        setup
            .ep
            .atomic_compwrite(
                &99u32.to_le_bytes(),
                &41u32.to_le_bytes(),
                result.as_mut_ptr() as u64,
                1,
                Datatype::U32,
                AtomicOp::Cswap,
                setup.target.local_addr(),
                setup.base,
                30,
                1,
                OpFlags::empty(),
            )
            .unwrap();
    }
    let event = wait_one(&setup);
    assert_eq!(event.error, 0);
    assert_eq!(u32::from_le_bytes(peek(setup.base, 4).try_into().unwrap()), 42);
    assert_eq!(
        u32::from_le_bytes(peek(result.as_ptr() as u64, 4).try_into().unwrap()),
        42
    );

    // Matching compare: stores.
    unsafe {
        setup
            .ep
            .atomic_compwrite(
                &99u32.to_le_bytes(),
                &42u32.to_le_bytes(),
                result.as_mut_ptr() as u64,
                1,
                Datatype::U32,
                AtomicOp::Cswap,
                setup.target.local_addr(),
                setup.base,
                30,
                2,
                OpFlags::empty(),
            )
            .unwrap();
    }
    let event = wait_one(&setup);
    assert_eq!(event.error, 0);
    assert_eq!(u32::from_le_bytes(peek(setup.base, 4).try_into().unwrap()), 99);
    assert_eq!(
        u32::from_le_bytes(peek(result.as_ptr() as u64, 4).try_into().unwrap()),
        42
    );
}

#[test]
fn test_atomic_write_min_multi_element() {
    let initial: Vec<u8> = [10i32, -5i32]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let setup = atomic_setup(&initial, Access::REMOTE_WRITE);

    let operands: Vec<u8> = [7i32, -2i32]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    setup
        .ep
        .atomic_write(
            &operands,
            2,
            Datatype::I32,
            AtomicOp::Min,
            setup.target.local_addr(),
            setup.base,
            30,
            50,
            OpFlags::empty(),
        )
        .unwrap();
    let event = wait_one(&setup);
    assert_eq!(event.error, 0);
    let bytes = peek(setup.base, 8);
    assert_eq!(i32::from_le_bytes(bytes[..4].try_into().unwrap()), 7);
    assert_eq!(i32::from_le_bytes(bytes[4..].try_into().unwrap()), -5);
}

#[test]
fn test_atomic_access_denied() {
    // Fetch forms need both remote read and remote write rights.
    let setup = atomic_setup(&0u64.to_le_bytes(), Access::REMOTE_WRITE);

    let mut result = [0u8; 8];
    unsafe {
        setup
            .ep
            .atomic_readwrite(
                &1u64.to_le_bytes(),
                result.as_mut_ptr() as u64,
                1,
                Datatype::U64,
                AtomicOp::Sum,
                setup.target.local_addr(),
                setup.base,
                30,
                60,
                OpFlags::empty(),
            )
            .unwrap();
    }
    drive_until(&setup.initiator, &setup.target, || {
        matches!(setup.cq.read(1), Err(Error::ErrorAvailable))
    });
    let err = setup.cq.readerr().unwrap();
    assert_eq!(err.error, code::ACCESS);
}

#[test]
fn test_atomic_invalid_op_rejected_at_submit() {
    let setup = atomic_setup(&0f64.to_le_bytes(), Access::REMOTE_WRITE);
    let result = setup.ep.atomic_write(
        &1f64.to_le_bytes(),
        1,
        Datatype::F64,
        AtomicOp::Bxor,
        setup.target.local_addr(),
        setup.base,
        30,
        0,
        OpFlags::empty(),
    );
    assert!(matches!(result, Err(Error::InvalidAtomic { .. })));
}

// =============================================================================
// Trigger Tests
// =============================================================================

#[test]
fn test_trigger_fires_exactly_at_threshold() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 64];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 70))
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());

    let gate = initiator.cntr_open();
    gate.add(4);

    ep.write_triggered(
        b"deferred",
        target.local_addr(),
        base,
        70,
        99,
        OpFlags::empty(),
        0,
        &gate,
        5,
    )
    .unwrap();

    // Below threshold: nothing may happen however much we drive.
    for _ in 0..20 {
        initiator.progress();
        target.progress();
    }
    assert_eq!(gate.pending_triggers(), 1);
    assert!(cq.read(8).unwrap().is_empty());
    assert_eq!(peek(base, 8), vec![0u8; 8]);

    // The increment that first reaches the threshold readies the trigger.
    gate.add(1);
    assert_eq!(gate.pending_triggers(), 0);

    let mut got = Vec::new();
    drive_until(&initiator, &target, || {
        got.extend(cq.read(8).unwrap());
        !got.is_empty()
    });
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].context, 99);
    assert_eq!(peek(base, 8), b"deferred".to_vec());
}

#[test]
fn test_trigger_with_satisfied_threshold_fires_immediately() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 64];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 71))
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());

    let gate = initiator.cntr_open();
    gate.add(5);
    ep.write_triggered(
        b"now",
        target.local_addr(),
        base,
        71,
        1,
        OpFlags::empty(),
        0,
        &gate,
        5,
    )
    .unwrap();
    assert_eq!(gate.pending_triggers(), 0);

    let mut got = Vec::new();
    drive_until(&initiator, &target, || {
        got.extend(cq.read(8).unwrap());
        !got.is_empty()
    });
    assert_eq!(peek(base, 3), b"now".to_vec());
}

#[test]
fn test_triggers_fire_in_insertion_order() {
    let (initiator, target) = pair();

    let mut window = vec![0u8; 64];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 72))
        .unwrap();

    let ep = initiator.ep_open();
    let gate = initiator.cntr_open();

    // Both write the same byte; the later insertion must win.
    ep.write_triggered(b"A", target.local_addr(), base, 72, 1, OpFlags::empty(), 0, &gate, 2)
        .unwrap();
    ep.write_triggered(b"B", target.local_addr(), base, 72, 2, OpFlags::empty(), 0, &gate, 2)
        .unwrap();
    gate.add(2);

    drive_until(&initiator, &target, || peek(base, 1)[0] != 0);
    // Give the second write time to land too.
    for _ in 0..10 {
        initiator.progress();
        target.progress();
    }
    assert_eq!(peek(base, 1), b"B".to_vec());
}

#[test]
fn test_triggered_send_and_recv() {
    let (sender, receiver) = pair();

    let recv_cq = receiver.cq_open(CqFormat::Msg, None);
    let rep = receiver.ep_open();
    rep.bind_recv_cq(recv_cq.clone());

    let mut inbox = vec![0u8; 32];
    let inbox_addr = inbox.as_mut_ptr() as u64;
    let recv_gate = receiver.cntr_open();
    unsafe {
        rep.recv_triggered(inbox_addr, 32, None, 5, OpFlags::empty(), &recv_gate, 1)
            .unwrap();
    }

    let sep = sender.ep_open();
    let send_gate = sender.cntr_open();
    sep.send_triggered(
        b"gated",
        receiver.local_addr(),
        6,
        OpFlags::empty(),
        0,
        &send_gate,
        1,
    )
    .unwrap();

    recv_gate.add(1);
    send_gate.add(1);

    let mut got = Vec::new();
    drive_until(&sender, &receiver, || {
        got.extend(recv_cq.read(8).unwrap());
        !got.is_empty()
    });
    assert_eq!(got[0].len, 5);
    assert_eq!(peek(inbox_addr, 5), b"gated".to_vec());
}

// =============================================================================
// Counter Wait / Background Progress Tests
// =============================================================================

#[test]
fn test_counter_wait_with_background_progress() {
    let hub = InprocHub::new();
    let initiator = Domain::new(hub.open_port(), DomainConfig::default()).unwrap();
    let target = Domain::new(
        hub.open_port(),
        DomainConfig::default()
            .with_progress_thread(true)
            .with_prog_interval_us(50),
    )
    .unwrap();

    let mut window = vec![0u8; 64];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 80))
        .unwrap();

    let wcntr = initiator.cntr_open();
    let ep = initiator.ep_open();
    ep.bind_cntr(CntrKind::Write, wcntr.clone());

    ep.write(
        b"counted",
        target.local_addr(),
        base,
        80,
        0,
        OpFlags::empty(),
        0,
    )
    .unwrap();

    // The wait itself drives the initiator; the target is driven by its
    // background thread.
    let value = wcntr.wait(1, Duration::from_secs(5)).unwrap();
    assert_eq!(value, 1);
    assert_eq!(peek(base, 7), b"counted".to_vec());
}

#[test]
fn test_cq_sread_blocks_until_completion() {
    let hub = InprocHub::new();
    let initiator = Domain::new(hub.open_port(), DomainConfig::default()).unwrap();
    let target = Domain::new(
        hub.open_port(),
        DomainConfig::default()
            .with_progress_thread(true)
            .with_prog_interval_us(50),
    )
    .unwrap();

    let mut window = vec![0u8; 64];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 81))
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());

    ep.write(b"block", target.local_addr(), base, 81, 7, OpFlags::empty(), 0)
        .unwrap();

    let events = cq.sread(8, Duration::from_secs(5)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].context, 7);
}
