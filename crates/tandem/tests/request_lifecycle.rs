use std::{
    net::SocketAddr,
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use tandem::{
    ConnState, Device, DeviceConfig, IoError, MemDisk, NoopActivityLog, Protocol, ReadBalancing,
    Role, WorkerSet,
};

const CAPACITY: u64 = 256 * 1024;
const WAIT: Duration = Duration::from_secs(10);

struct Node {
    dev: Device,
    set: WorkerSet,
    disk: Arc<MemDisk>,
    _tmp: tempfile::TempDir,
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn node(minor: u32, base_port: u16, protocol: Protocol, dial: bool) -> Node {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = DeviceConfig::new(
        minor,
        CAPACITY,
        tmp.path().join(format!("md{minor}")),
        addr(base_port),
        addr(base_port + 1),
        dial,
    )
    .with_protocol(protocol);
    let disk = Arc::new(MemDisk::new(CAPACITY));
    let dev = Device::attach(cfg, Some(disk.clone()), Arc::new(NoopActivityLog)).unwrap();
    let set = WorkerSet::start(&dev);
    Node { dev, set, disk, _tmp: tmp }
}

fn connected_pair(base_port: u16, protocol: Protocol) -> (Node, Node) {
    let b = node(1, base_port, protocol, false);
    let a = node(0, base_port, protocol, true);
    assert!(a.dev.wait_for_cstate(&[ConnState::Connected], WAIT), "a never connected");
    assert!(b.dev.wait_for_cstate(&[ConnState::Connected], WAIT), "b never connected");
    a.dev.set_role(Role::Primary, false).unwrap();
    (a, b)
}

fn write_blocking(dev: &Device, sector: u64, payload: Vec<u8>) -> Result<(), IoError> {
    let (tx, rx) = mpsc::channel();
    dev.submit_write(sector, payload, Box::new(move |r| tx.send(r).unwrap())).unwrap();
    rx.recv_timeout(WAIT).expect("write completion")
}

fn read_blocking(dev: &Device, sector: u64, size: u32) -> Result<Vec<u8>, IoError> {
    let (tx, rx) = mpsc::channel();
    dev.submit_read(sector, size, Box::new(move |r| tx.send(r).unwrap())).unwrap();
    rx.recv_timeout(WAIT).expect("read completion")
}

fn wait_until<F: FnMut() -> bool>(mut f: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn protocol_c_write_reaches_both_replicas() {
    let (a, b) = connected_pair(25800, Protocol::C);

    let payload = vec![0x5au8; 4096];
    write_blocking(&a.dev, 0, payload.clone()).unwrap();

    assert_eq!(a.disk.snapshot(0, 4096), payload);
    // Protocol C completion implies the peer already wrote it.
    assert_eq!(b.disk.snapshot(0, 4096), payload);
    assert_eq!(a.dev.status().dirty_bits, 0);

    // The epoch collapses shortly after: no request may outlive its
    // barrier ack.
    assert!(wait_until(|| a.dev.status().live_requests == 0, WAIT));
    assert_eq!(a.dev.status().ap_pending, 0);
    assert_eq!(a.dev.status().ap_in_flight, 0);
}

#[test]
fn protocol_a_never_loses_unacknowledged_writes() {
    let (a, mut b) = connected_pair(25810, Protocol::A);

    let payload = vec![0x17u8; 4096];
    write_blocking(&a.dev, 8, payload.clone()).unwrap();
    assert_eq!(a.disk.snapshot(4096, 4096), payload);

    // Kill the peer. Whatever the barrier ack managed to confirm must be
    // on the peer's disk; everything else must read dirty for resync.
    b.set.stop();
    assert!(
        a.dev.wait_for_cstate(
            &[ConnState::BrokenPipe, ConnState::Timeout, ConnState::Unconnected],
            WAIT
        ),
        "a never noticed the dead peer"
    );
    assert!(wait_until(|| a.dev.status().live_requests == 0, WAIT));

    let peer_has_it = b.disk.snapshot(4096, 4096) == payload;
    let marked_dirty = a.dev.status().dirty_bits > 0;
    assert!(
        peer_has_it || marked_dirty,
        "write neither confirmed on the peer nor marked for resync"
    );
}

#[test]
fn overlapping_writes_serialise_and_both_complete() {
    let (a, b) = connected_pair(25820, Protocol::C);

    let w1 = vec![0x11u8; 8192];
    let w2 = vec![0x22u8; 4096];

    let (tx1, rx1) = mpsc::channel();
    a.dev
        .submit_write(0, w1, Box::new(move |r| tx1.send(r).unwrap()))
        .unwrap();

    // Overlaps [sector 4, +4096): must wait for the first interval holder.
    let dev = a.dev.clone();
    let (tx2, rx2) = mpsc::channel();
    let second = thread::spawn(move || {
        dev.submit_write(4, w2, Box::new(move |r| tx2.send(r).unwrap())).unwrap();
    });

    rx1.recv_timeout(WAIT).expect("first write").unwrap();
    rx2.recv_timeout(WAIT).expect("second write").unwrap();
    second.join().unwrap();

    // The overlap region carries the second write's bytes on both sides.
    assert!(wait_until(|| b.disk.snapshot(2048, 4096) == vec![0x22u8; 4096], WAIT));
    assert_eq!(a.disk.snapshot(2048, 4096), vec![0x22u8; 4096]);
}

#[test]
fn reads_balance_to_the_peer_when_asked() {
    let (a, _b) = connected_pair(25830, Protocol::C);

    let payload = vec![0x33u8; 4096];
    write_blocking(&a.dev, 8, payload.clone()).unwrap();

    a.dev.set_read_balancing(ReadBalancing::PreferRemote);
    let got = read_blocking(&a.dev, 8, 4096).unwrap();
    assert_eq!(got, payload);

    a.dev.set_read_balancing(ReadBalancing::PreferLocal);
    let got = read_blocking(&a.dev, 8, 4096).unwrap();
    assert_eq!(got, payload);
}

#[test]
fn secondary_refuses_upper_layer_writes() {
    let (_a, b) = connected_pair(25840, Protocol::C);
    let err = b
        .dev
        .submit_write(0, vec![0u8; 4096], Box::new(|_| panic!("must not complete")))
        .unwrap_err();
    assert!(matches!(err, tandem::DeviceError::NotPrimary));
}

#[test]
fn standalone_writes_succeed_locally_and_read_dirty() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = DeviceConfig::new(
        0,
        CAPACITY,
        tmp.path().join("md0"),
        addr(25850),
        addr(25851),
        false,
    );
    let disk = Arc::new(MemDisk::new(CAPACITY));
    let dev = Device::attach(cfg, Some(disk.clone()), Arc::new(NoopActivityLog)).unwrap();
    dev.set_role(Role::Primary, true).unwrap();

    let payload = vec![0x44u8; 4096];
    write_blocking(&dev, 0, payload.clone()).unwrap();
    assert_eq!(disk.snapshot(0, 4096), payload);
    // Unmirrored writes must be flagged for the next resync.
    assert!(dev.status().dirty_bits > 0);
}

#[test]
fn local_disk_failure_fails_over_to_the_peer() {
    let (a, b) = connected_pair(25860, Protocol::C);

    let payload = vec![0x55u8; 4096];
    write_blocking(&a.dev, 0, payload.clone()).unwrap();

    // Local read path dies; the engine must retry against the peer.
    a.disk.fail_next(1);
    let got = read_blocking(&a.dev, 0, 4096).unwrap();
    assert_eq!(got, payload);
    drop(b);
}

#[test]
fn suspended_io_parks_and_resumes() {
    let (a, b) = connected_pair(25870, Protocol::C);

    a.dev.suspend_io();
    let (tx, rx) = mpsc::channel();
    let payload = vec![0x66u8; 4096];
    a.dev
        .submit_write(0, payload.clone(), Box::new(move |r| tx.send(r).unwrap()))
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "suspended io completed");

    a.dev.resume_io();
    rx.recv_timeout(WAIT).expect("resumed write").unwrap();
    assert_eq!(a.disk.snapshot(0, 4096), payload);
    assert!(wait_until(|| b.disk.snapshot(0, 4096) == payload, WAIT));
}

#[test]
fn oversized_and_out_of_range_requests_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = DeviceConfig::new(
        0,
        CAPACITY,
        tmp.path().join("md0"),
        addr(25880),
        addr(25881),
        false,
    );
    let dev =
        Device::attach(cfg, Some(Arc::new(MemDisk::new(CAPACITY))), Arc::new(NoopActivityLog))
            .unwrap();
    dev.set_role(Role::Primary, true).unwrap();

    let err = dev
        .submit_write(0, vec![0u8; 1 << 20], Box::new(|_| panic!()))
        .unwrap_err();
    assert!(matches!(err, tandem::DeviceError::TooLarge));

    let err = dev.submit_read(CAPACITY >> 9, 4096, Box::new(|_| panic!())).unwrap_err();
    assert!(matches!(err, tandem::DeviceError::OutOfRange));
}
