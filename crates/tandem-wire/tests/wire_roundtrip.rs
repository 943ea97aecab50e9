use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use tandem_wire::{ConnState, Endpoint, Packet};

const POLL: Duration = Duration::from_millis(5);

fn establish(
    ep: &mut Endpoint,
) -> (tandem_wire::FramedChannel, tandem_wire::FramedSender) {
    loop {
        if let Some(split) = ep.try_establish() {
            return split;
        }
        thread::sleep(Duration::from_micros(200));
    }
}

#[test]
fn packets_cross_the_wire_in_both_directions() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24716));

    let server = thread::spawn(move || {
        let mut ep = Endpoint::listen(addr);
        let (mut chan, sender) = establish(&mut ep);

        let mut got_barrier = None;
        let mut got_data = None;
        while got_barrier.is_none() || got_data.is_none() {
            let state = chan.poll_with(POLL, |pkt| match pkt {
                Packet::Barrier { barrier_nr } => got_barrier = Some(barrier_nr),
                Packet::Data { block_nr, block_id, payload } => {
                    got_data = Some((block_nr, block_id, payload.to_vec()));
                }
                other => panic!("unexpected packet {other:?}"),
            });
            assert_eq!(state, ConnState::Alive);
        }

        assert_eq!(got_barrier, Some(9));
        let (block_nr, block_id, payload) = got_data.unwrap();
        assert_eq!(block_nr, 4);
        assert_eq!(block_id, 0x1000);
        assert_eq!(payload, vec![0xabu8; 4096]);

        assert_eq!(
            sender.send(&Packet::BarrierAck { barrier_nr: 9, set_size: 1 }),
            ConnState::Alive
        );
        // Keep draining until the client saw it.
        for _ in 0..200 {
            chan.poll_with(POLL, |_| {});
        }
    });

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        let mut ep = Endpoint::dial(addr);
        let (mut chan, sender) = establish(&mut ep);

        let payload = vec![0xabu8; 4096];
        assert_eq!(
            sender.send(&Packet::Data { block_nr: 4, block_id: 0x1000, payload: &payload }),
            ConnState::Alive
        );
        assert_eq!(sender.send(&Packet::Barrier { barrier_nr: 9 }), ConnState::Alive);

        let mut acked = None;
        while acked.is_none() {
            let state = chan.poll_with(POLL, |pkt| {
                if let Packet::BarrierAck { barrier_nr, set_size } = pkt {
                    acked = Some((barrier_nr, set_size));
                }
            });
            assert_eq!(state, ConnState::Alive);
        }
        assert_eq!(acked, Some((9, 1)));
    });

    server.join().unwrap();
    client.join().unwrap();
}

#[test]
fn peer_teardown_reports_disconnect() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24717));

    let server = thread::spawn(move || {
        let mut ep = Endpoint::listen(addr);
        let (mut chan, _sender) = establish(&mut ep);
        chan.close();
    });

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        let mut ep = Endpoint::dial(addr);
        let (mut chan, _sender) = establish(&mut ep);

        for _ in 0..2000 {
            if chan.poll_with(POLL, |_| {}) == ConnState::Disconnected {
                return;
            }
        }
        panic!("never observed the disconnect");
    });

    server.join().unwrap();
    client.join().unwrap();
}
