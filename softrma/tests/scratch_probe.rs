use softrma::*;
use std::time::Duration;

#[test]
fn scratch_probe_sread() {
    eprintln!("MARK: start");
    let hub = InprocHub::new();
    let initiator = Domain::new(hub.open_port(), DomainConfig::default()).unwrap();
    let target = Domain::new(
        hub.open_port(),
        DomainConfig::default()
            .with_progress_thread(true)
            .with_prog_interval_us(50),
    )
    .unwrap();
    eprintln!("MARK: domains up");

    let mut window = vec![0u8; 64];
    let base = window.as_mut_ptr() as u64;
    target
        .mr_reg(RegionDesc::new(base, window.len(), Access::REMOTE_WRITE, 81))
        .unwrap();

    let cq = initiator.cq_open(CqFormat::Msg, None);
    let ep = initiator.ep_open();
    ep.bind_send_cq(cq.clone());
    eprintln!("MARK: before write");

    ep.write(b"block", target.local_addr(), base, 81, 7, OpFlags::empty(), 0)
        .unwrap();
    eprintln!("MARK: after write, before sread");

    let events = cq.sread(8, Duration::from_secs(5)).unwrap();
    eprintln!("MARK: after sread, n={}", events.len());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].context, 7);
    eprintln!("MARK: asserts done, dropping");
}
