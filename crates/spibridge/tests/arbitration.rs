//! End-to-end arbitration through the public session surface.

use std::io;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use spibridge::backing::spi::SpiRequest;
use spibridge::backing::{MemoryBus, MemoryFactory, TransferKind};
use spibridge::{AccessMode, Bridge, BridgeConfig, BridgeError};

const TARGET: &str = "/dev/spidev0.0";

fn loopback(config: BridgeConfig) -> (Arc<Bridge>, MemoryBus) {
    let bus = MemoryBus::new();
    let bridge = Bridge::new(config, MemoryFactory::single(TARGET, bus.clone())).unwrap();
    (bridge, bus)
}

fn shared(endpoints: usize) -> BridgeConfig {
    BridgeConfig::shared(TARGET, endpoints).with_admission_timeout(Some(Duration::from_secs(5)))
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn operations_never_overlap() {
    let (bridge, bus) = loopback(shared(8));
    bus.set_latency(Duration::from_millis(1));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let bridge = Arc::clone(&bridge);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut session = bridge.open(i).unwrap();
                barrier.wait();
                for _ in 0..10 {
                    session.write(&[i as u8; 3]).unwrap();
                    session.control(SpiRequest::ReadMode.code(), 0).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(bus.max_concurrency(), 1);
    assert_eq!(bus.transfers().len(), 160);
    let snap = bridge.snapshot();
    assert_eq!(snap.serving, 160);
    assert_eq!(snap.next_ticket, 160);
    assert_eq!(bridge.open_sessions(), 0);
}

#[test]
fn transfers_are_never_interleaved_within_a_write() {
    let (bridge, bus) = loopback(shared(4));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                let mut session = bridge.open(i).unwrap();
                for _ in 0..25 {
                    session.write(&[i as u8; 16]).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for chunk in bus.written().chunks(16) {
        assert!(chunk.iter().all(|b| *b == chunk[0]), "interleaved frame {chunk:?}");
    }
}

#[test]
fn grants_follow_arrival_order() {
    let (bridge, bus) = loopback(shared(6));
    bus.set_latency(Duration::from_millis(100));

    // Endpoint 0 occupies the device while the others queue up one at a time.
    let first = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.open(0).unwrap().write(&[0]).unwrap())
    };
    wait_until("first write to start", || bridge.snapshot().next_ticket == 1);

    let mut handles = vec![first];
    for i in 1..6 {
        let worker = Arc::clone(&bridge);
        handles.push(thread::spawn(move || {
            worker.open(i).unwrap().write(&[i as u8]).unwrap()
        }));
        wait_until("waiter to queue", || bridge.snapshot().next_ticket == i as u64 + 1);
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(bus.written(), vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn bytes_pass_through_unchanged() {
    let (bridge, bus) = loopback(shared(1));
    let mut session = bridge.open(0).unwrap();

    let frame: Vec<u8> = (0..=255).collect();
    assert_eq!(session.write(&frame).unwrap(), 256);
    assert_eq!(bus.written(), frame);

    bus.feed(&[9, 8, 7, 6, 5]);
    assert_eq!(session.read(3).unwrap(), vec![9, 8, 7]);
    assert_eq!(session.read(10).unwrap(), vec![6, 5]);
    assert!(session.read(10).unwrap().is_empty());
}

#[test]
fn upstream_errors_pass_through_and_retire() {
    let (bridge, bus) = loopback(shared(1));
    let mut session = bridge.open(0).unwrap();

    bus.fail_next(io::ErrorKind::BrokenPipe);
    match session.write(b"abc") {
        Err(BridgeError::Upstream(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
        other => panic!("expected upstream error, got {other:?}"),
    }
    assert_eq!(bridge.snapshot().serving, 1);

    assert_eq!(session.write(b"abc").unwrap(), 3);
    assert_eq!(bridge.snapshot().serving, 2);
}

#[test]
fn control_requests() {
    let (bridge, _bus) = loopback(shared(2));
    let mut a = bridge.open(0).unwrap();
    let mut b = bridge.open(1).unwrap();

    let set_mode = SpiRequest::WriteMode(3);
    a.control(set_mode.code(), set_mode.arg()).unwrap();
    assert_eq!(b.control(SpiRequest::ReadMode.code(), 0).unwrap(), 3);

    assert!(matches!(
        a.control(0xdead, 0),
        Err(BridgeError::NotSupported { code: 0xdead })
    ));
    // Unsupported requests still consume and retire a ticket.
    assert_eq!(bridge.snapshot().serving, 3);
}

#[test]
fn affinity_delays_earlier_non_owner() {
    let hold = Duration::from_millis(100);
    let (bridge, bus) = loopback(shared(2).with_ownership_hold(hold));
    let mut a = bridge.open(0).unwrap();

    let t0 = Instant::now();
    a.write(b"A1").unwrap();

    let reader = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || {
            let mut b = bridge.open(1).unwrap();
            let bytes = b.read(4).unwrap();
            (bytes, t0.elapsed())
        })
    };
    wait_until("B to queue", || bridge.snapshot().waiting == 1);

    // A's follow-up takes a later ticket, so it runs after B.
    a.write(b"A2").unwrap();
    let a2_done = t0.elapsed();

    let (bytes, b_done) = reader.join().unwrap();
    assert!(bytes.is_empty());
    assert!(b_done >= hold, "B granted after only {b_done:?}");
    assert!(a2_done >= b_done);

    let kinds: Vec<_> = bus.transfers().iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![TransferKind::Write, TransferKind::Read, TransferKind::Write]
    );
}

#[test]
fn closing_owner_releases_affinity() {
    let (bridge, _bus) = loopback(shared(2).with_ownership_hold(Duration::from_secs(30)));
    let mut a = bridge.open(0).unwrap();
    a.write(b"x").unwrap();
    assert_eq!(bridge.snapshot().owner, Some(a.caller()));

    let waiter = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || {
            let start = Instant::now();
            bridge.open(1).unwrap().write(b"y").unwrap();
            start.elapsed()
        })
    };
    wait_until("B to queue", || bridge.snapshot().waiting == 1);
    a.close();

    assert!(waiter.join().unwrap() < Duration::from_secs(5));
}

#[test]
fn timeout_surfaces_only_after_predecessor() {
    let (bridge, bus) = loopback(
        BridgeConfig::shared(TARGET, 2).with_admission_timeout(Some(Duration::from_millis(30))),
    );
    bus.set_latency(Duration::from_millis(200));

    let slow = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.open(0).unwrap().write(b"slow").unwrap())
    };
    wait_until("slow write to start", || bridge.snapshot().next_ticket == 1);

    let mut b = bridge.open(1).unwrap();
    let start = Instant::now();
    let result = b.write(b"late");
    assert!(matches!(result, Err(BridgeError::Timeout)));
    // Deadline was 30ms, but the failure only surfaces once the slow write retires.
    assert!(start.elapsed() >= Duration::from_millis(100));
    slow.join().unwrap();

    assert_eq!(bus.written(), b"slow");
    assert_eq!(bridge.snapshot().serving, 2);

    // The failure did not poison the session or the queue.
    bus.set_latency(Duration::ZERO);
    assert_eq!(b.write(b"ok").unwrap(), 2);
}

#[test]
fn cancellation_keeps_place_then_fails() {
    let (bridge, bus) = loopback(shared(2));
    bus.set_latency(Duration::from_millis(150));

    let slow = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.open(0).unwrap().write(b"slow").unwrap())
    };
    wait_until("slow write to start", || bridge.snapshot().next_ticket == 1);

    let mut b = bridge.open(1).unwrap();
    let cancel = b.cancel_handle();
    let canceller = thread::spawn({
        let bridge = Arc::clone(&bridge);
        move || {
            wait_until("B to queue", || bridge.snapshot().waiting == 1);
            cancel.cancel();
        }
    });

    assert!(matches!(b.write(b"never"), Err(BridgeError::Cancelled)));
    canceller.join().unwrap();
    slow.join().unwrap();
    assert_eq!(bus.written(), b"slow");

    // The handle re-arms after a consumed cancellation.
    bus.set_latency(Duration::ZERO);
    assert!(!b.cancel_handle().is_cancelled());
    assert_eq!(b.write(b"next").unwrap(), 4);
}

#[test]
fn cancel_during_running_operation_does_not_fail_the_next() {
    let (bridge, bus) = loopback(shared(1));
    bus.set_latency(Duration::from_millis(100));

    let mut session = bridge.open(0).unwrap();
    let cancel = session.cancel_handle();
    let canceller = thread::spawn({
        let bridge = Arc::clone(&bridge);
        move || {
            // The ticket is granted under the same lock that issues it.
            wait_until("write to be granted", || bridge.snapshot().next_ticket == 1);
            cancel.cancel();
        }
    });

    assert_eq!(session.write(b"a").unwrap(), 1);
    canceller.join().unwrap();

    bus.set_latency(Duration::ZERO);
    assert!(!session.cancel_handle().is_cancelled());
    assert_eq!(session.write(b"b").unwrap(), 1);
    assert_eq!(bus.written(), b"ab");
}

#[test]
fn session_lifecycle_errors() {
    let (bridge, _bus) = loopback(shared(2));
    assert!(matches!(bridge.open(2), Err(BridgeError::NotFound(_))));
    assert!(matches!(
        bridge.open_by_name("spi-bridge0.5", AccessMode::ReadWrite),
        Err(BridgeError::NotFound(_))
    ));

    let mut session = bridge
        .open_by_name("spi-bridge0.1", AccessMode::ReadWrite)
        .unwrap();
    assert_eq!(session.endpoint(), 1);
    assert_eq!(bridge.open_sessions(), 1);

    session.close();
    session.close();
    assert!(!session.is_open());
    assert_eq!(bridge.open_sessions(), 0);
    assert!(matches!(session.write(b"x"), Err(BridgeError::NotReady)));
    assert!(matches!(session.poll(), Err(BridgeError::NotReady)));
    // NotReady never takes a ticket.
    assert_eq!(bridge.snapshot().next_ticket, 0);
}

#[test]
fn access_mode_is_forwarded() {
    let (bridge, bus) = loopback(shared(1));
    let mut reader = bridge.open_with(0, AccessMode::ReadOnly).unwrap();

    match reader.write(b"x") {
        Err(BridgeError::Upstream(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
        other => panic!("expected upstream error, got {other:?}"),
    }
    assert!(!reader.poll().unwrap().writable);
    bus.feed(b"r");
    assert!(reader.poll().unwrap().readable);
}

#[test]
fn per_endpoint_backing_uses_own_target() {
    let bus_a = MemoryBus::new();
    let bus_b = MemoryBus::new();
    let factory = MemoryFactory::new()
        .with_bus("/dev/spidev0.0", bus_a.clone())
        .with_bus("/dev/spidev0.1", bus_b.clone());
    let config = BridgeConfig {
        endpoint_count: 2,
        backing_targets: vec!["/dev/spidev0.0".into(), "/dev/spidev0.1".into()],
        per_endpoint_backing: true,
        ..BridgeConfig::default()
    };
    let bridge = Bridge::new(config, factory).unwrap();

    bridge.open(0).unwrap().write(b"a").unwrap();
    bridge.open(1).unwrap().write(b"b").unwrap();
    assert_eq!(bus_a.written(), b"a");
    assert_eq!(bus_b.written(), b"b");
}

#[test]
fn failed_open_reports_upstream() {
    let config = BridgeConfig::shared("/dev/absent", 1);
    let bridge = Bridge::new(config, MemoryFactory::new()).unwrap();
    match bridge.open(0) {
        Err(BridgeError::Upstream(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
        other => panic!("expected upstream error, got {other:?}"),
    }
    assert_eq!(bridge.open_sessions(), 0);
}

#[test]
fn invalid_config_is_rejected() {
    let err = Bridge::new(BridgeConfig::shared(TARGET, 0), MemoryFactory::new()).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidConfig(_)));
}

#[test]
fn file_backed_endpoints_share_one_file() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let config = BridgeConfig::shared(tmp.path(), 2);
    let bridge = Bridge::with_devices(config).unwrap();

    let mut a = bridge.open(0).unwrap();
    a.write(b"first").unwrap();
    drop(a);
    let mut b = bridge.open_with(1, AccessMode::ReadOnly).unwrap();
    assert_eq!(b.read(64).unwrap(), b"first");

    #[cfg(target_os = "linux")]
    assert!(matches!(
        b.control(SpiRequest::ReadMode.code(), 0),
        Err(BridgeError::NotSupported { .. })
    ));
}

#[test]
fn unbounded_read_length_is_served() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), b"rx-bytes").unwrap();
    let bridge = Bridge::with_devices(BridgeConfig::shared(tmp.path(), 1)).unwrap();

    let mut session = bridge.open_with(0, AccessMode::ReadOnly).unwrap();
    assert_eq!(session.read(usize::MAX).unwrap(), b"rx-bytes");
    assert_eq!(bridge.snapshot().serving, 1);
}
