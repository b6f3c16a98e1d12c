//! Messages moved end to end over each fabric.

use super::*;

use rand::Rng;

use crate::datatype::Datatype;
use crate::pkthdr::{MsgType, HDR_LEN};

/// Two processes on one host, joined by shared memory.
fn shm_pair(cfg: Config, shm: SharedMemConfig) -> [(Nexus, Arc<Reassembly>, PathHandle, Arc<Recorder>); 2] {
    let segment = SharedMemSegment::new();
    let host_of = [0, 0];
    let fabrics: Vec<_> = (0..2)
        .map(|p| SharedMemFabric::new(p, segment.clone(), shm.clone()).unwrap())
        .collect();
    let mut out = fabrics.into_iter().enumerate().map(|(p, fabric)| {
        let (nx, sink) = node(p as ProcId, &host_of, cfg.clone(), None);
        let rec = Recorder::new();
        let h = add_hooked(&nx, fabric, rec.clone());
        (nx, sink, h, rec)
    });
    [out.next().unwrap(), out.next().unwrap()]
}

#[test]
fn small_message_over_shared_memory() {
    init_logger();
    // Checksummed but unacknowledged.
    let cfg = Config {
        checksum: ChecksumMode::Crc,
        ..test_config(false)
    };
    let [(tx, _, tx_path, tx_rec), (rx, sink, rx_path, rx_rec)] = shm_pair(cfg, SharedMemConfig::default());

    let data = b"0123456789".to_vec();
    let msg = tx.isend(tx.message(WORLD_CTX, 1, 42, data.clone())).unwrap();
    assert_eq!(msg.numfrags(), 1);

    let got = recv_one(&[&tx, &rx], &sink);
    assert_eq!(got.data, data);
    assert_eq!((got.ctx, got.src, got.tag, got.isend_seq), (WORLD_CTX, 0, 42, 1));

    drive(&[&tx, &rx], || tx.send_done(&msg));
    assert_eq!(tx_rec.data_seqs(), vec![0]);
    assert_eq!(tx_rec.posts()[0].data_len, 10);
    assert_eq!(tx_rec.posts()[0].dest, 1);
    // Unsequenced: the receiver never answers.
    assert_eq!(rx_rec.num_acks(), 0);
    assert!(rx_rec.posts().is_empty());

    tx.progress().unwrap();
    assert_eq!(tx.num_pending(), 0);
    assert!(quiescent(&tx, tx_path));
    assert!(quiescent(&rx, rx_path));
}

#[test]
fn empty_message_is_one_fragment() {
    init_logger();
    let [(tx, _, _, tx_rec), (rx, sink, _, _)] = shm_pair(test_config(true), SharedMemConfig::default());

    let msg = tx.isend(tx.message(WORLD_CTX, 1, 3, Vec::new())).unwrap();
    let got = recv_one(&[&tx, &rx], &sink);
    assert!(got.data.is_empty());
    drive(&[&tx, &rx], || tx.send_done(&msg));
    assert_eq!(tx_rec.data_seqs(), vec![1]);
}

#[test]
fn messages_keep_their_identity() {
    init_logger();
    let shm = SharedMemConfig {
        eager_payload: 256,
        frag_payload: 512,
        ..SharedMemConfig::default()
    };
    let [(tx, _, tx_path, _), (rx, sink, _, _)] = shm_pair(test_config(false), shm);

    let sends: Vec<_> = (0..8u32)
        .map(|i| {
            let data = pattern(300 * i as usize + 17);
            let msg = tx.isend(tx.message(WORLD_CTX, 1, i, data.clone())).unwrap();
            (msg, data)
        })
        .collect();
    assert_eq!(sends[7].0.numfrags(), 1 + (300 * 7 + 17 - 256usize).div_ceil(512));

    let mut got = Vec::new();
    drive(&[&tx, &rx], || {
        while let Some(m) = sink.try_recv() {
            got.push(m);
        }
        got.len() == sends.len()
    });
    got.sort_by_key(|m| m.isend_seq);
    for ((msg, data), m) in sends.iter().zip(&got) {
        assert_eq!(m.tag as u64 + 1, m.isend_seq);
        assert_eq!(msg.isend_seq(), m.isend_seq);
        assert_eq!(&m.data, data);
    }
    assert_eq!(sink.num_partial(), 0);

    drive(&[&tx, &rx], || tx.num_pending() == 0);
    assert!(quiescent(&tx, tx_path));
}

#[test]
fn synchronous_send_waits_for_the_first_ack() {
    init_logger();
    let shm = SharedMemConfig {
        eager_payload: 2048,
        frag_payload: 2048,
        ..SharedMemConfig::default()
    };
    let [(tx, _, _, tx_rec), (rx, sink, _, rx_rec)] = shm_pair(test_config(false), shm);

    let data = pattern(5000);
    let msg = tx.message(WORLD_CTX, 1, 7, data.clone()).with_mode(SendMode::Synchronous);
    let msg = tx.isend(msg).unwrap();
    assert_eq!(msg.numfrags(), 3);
    assert_eq!(msg.num_sent(), 1);

    for _ in 0..10 {
        tx.progress().unwrap();
    }
    assert_eq!(msg.num_sent(), 1);
    assert!(!tx.send_done(&msg));

    let got = recv_one(&[&tx, &rx], &sink);
    assert_eq!(got.data, data);
    drive(&[&tx, &rx], || tx.send_done(&msg));

    // Only the first fragment is sequenced and acknowledged.
    assert_eq!(tx_rec.data_seqs(), vec![1, 0, 0]);
    assert_eq!(rx_rec.num_acks(), 1);
}

#[test]
fn first_fragment_uses_the_eager_size() {
    init_logger();
    let shm = SharedMemConfig {
        eager_payload: 32,
        frag_payload: 64,
        ..SharedMemConfig::default()
    };
    let [(tx, _, _, tx_rec), (rx, sink, _, _)] = shm_pair(test_config(true), shm);

    let msg = tx.isend(tx.message(WORLD_CTX, 1, 0, pattern(100))).unwrap();
    assert_eq!(msg.numfrags(), 3);
    let got = recv_one(&[&tx, &rx], &sink);
    assert_eq!(got.data, pattern(100));
    drive(&[&tx, &rx], || tx.send_done(&msg));

    let lens: Vec<_> = tx_rec
        .posts()
        .iter()
        .filter(|p| p.kind == FrameType::Data)
        .map(|p| p.data_len)
        .collect();
    assert_eq!(lens, vec![32, 64, 4]);
}

#[test]
fn zero_eager_size_is_refused() {
    init_logger();
    let shm = SharedMemConfig {
        eager_payload: 0,
        frag_payload: 64,
        ..SharedMemConfig::default()
    };
    let fabric = SharedMemFabric::new(0, SharedMemSegment::new(), shm).unwrap();
    let (nx, _) = node(0, &[0, 0], test_config(true), None);
    let res = FragPath::new(nx.ctx().clone(), fabric);
    assert!(matches!(res, Err(Error::Setup(_))));
}

#[test]
fn shared_memory_backpressure() {
    init_logger();
    let shm = SharedMemConfig {
        mailbox_depth: 2,
        eager_payload: 64,
        frag_payload: 64,
        ..SharedMemConfig::default()
    };
    let [(tx, _, _, _), (rx, sink, _, _)] = shm_pair(test_config(false), shm);

    let data = pattern(64 * 10);
    let msg = tx.isend(tx.message(WORLD_CTX, 1, 0, data.clone())).unwrap();
    assert_eq!(msg.numfrags(), 10);
    assert_eq!(msg.num_sent(), 2);
    assert_eq!(tx.num_pending(), 1);

    let got = recv_one(&[&tx, &rx], &sink);
    assert_eq!(got.data, data);
    drive(&[&tx, &rx], || tx.send_done(&msg));
}

#[test]
fn wait_drives_progress() {
    init_logger();
    let [(tx, _, _, _), (rx, sink, _, _)] = shm_pair(test_config(false), SharedMemConfig::default());
    let msg = tx.isend(tx.message(WORLD_CTX, 1, 0, pattern(100))).unwrap();
    block_on(tx.wait(msg)).unwrap();
    assert_eq!(recv_one(&[&rx], &sink).data, pattern(100));
}

#[test]
fn large_message_over_tcp() {
    init_logger();
    let host_of = [0, 1];
    let mut fabrics = per_proc(2, |admin| TcpFabric::new(&admin, TcpConfig::default()).unwrap());
    let (rx, sink) = node(1, &host_of, test_config(false), None);
    let rx_path = add_fabric(&rx, fabrics.pop().unwrap());
    let (tx, _) = node(0, &host_of, test_config(false), None);
    let tx_path = add_fabric(&tx, fabrics.pop().unwrap());

    let mut data = vec![0u8; 100_000];
    rand::thread_rng().fill(&mut data[..]);
    let msg = tx.isend(tx.message(WORLD_CTX, 1, 5, data.clone())).unwrap();
    assert_eq!(msg.numfrags(), 1 + (100_000usize - 16 * 1024).div_ceil(16 * 1024));

    let got = recv_one(&[&tx, &rx], &sink);
    assert_eq!(got.data, data);
    drive(&[&tx, &rx], || tx.send_done(&msg) && quiescent(&tx, tx_path));
    assert!(quiescent(&rx, rx_path));

    tx.finalize();
    assert!(!tx.paths().get(tx_path).unwrap().is_active());
}

#[test]
fn tcp_round_trip() {
    init_logger();
    let host_of = [0, 1];
    let mut fabrics = per_proc(2, |admin| TcpFabric::new(&admin, TcpConfig::default()).unwrap());
    let (b, b_sink) = node(1, &host_of, test_config(true), None);
    add_fabric(&b, fabrics.pop().unwrap());
    let (a, a_sink) = node(0, &host_of, test_config(true), None);
    add_fabric(&a, fabrics.pop().unwrap());

    let ping = a.isend(a.message(WORLD_CTX, 1, 1, b"ping".to_vec())).unwrap();
    assert_eq!(recv_one(&[&a, &b], &b_sink).data, b"ping");
    let pong = b.isend(b.message(WORLD_CTX, 0, 2, b"pong".to_vec())).unwrap();
    assert_eq!(recv_one(&[&a, &b], &a_sink).data, b"pong");
    drive(&[&a, &b], || a.send_done(&ping) && b.send_done(&pong));
}

#[test]
fn tcp_connects_at_setup() {
    init_logger();
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let mut fabrics = per_proc(2, move |admin| {
        if admin.myproc() == 1 {
            // Publishes an address nobody listens on.
            crate::nexus::allgather_as(&admin, "tcp-addr", &dead).unwrap();
            None
        } else {
            Some(TcpFabric::new(&admin, TcpConfig::default()).unwrap())
        }
    });
    let mut tcp = fabrics.remove(0).unwrap();
    assert!(tcp.can_reach(0));
    assert!(!tcp.can_reach(1));
    assert!(matches!(tcp.resolve(1, Lane::default()), Err(Error::Unreachable(1))));
}

#[test]
fn tcp_send_to_a_lost_peer_fails() {
    init_logger();
    let host_of = [0, 1];
    let mut fabrics = per_proc(2, |admin| TcpFabric::new(&admin, TcpConfig::default()).unwrap());
    // The receiver goes away with our connection still in its accept queue.
    drop(fabrics.pop());
    let (tx, _) = node(0, &host_of, test_config(false), None);
    let tx_path = add_fabric(&tx, fabrics.pop().unwrap());

    let err = match tx.isend(tx.message(WORLD_CTX, 1, 0, pattern(4 << 20))) {
        Err(e) => e,
        Ok(msg) => {
            let start = std::time::Instant::now();
            let err = loop {
                if let Err(e) = tx.progress() {
                    break e;
                }
                assert!(start.elapsed() < DEADLINE, "connection loss went unnoticed");
            };
            assert!(msg.has_failed());
            assert!(!tx.send_done(&msg));
            err
        }
    };
    assert!(matches!(err, Error::Unreachable(1)), "{}", err);
    assert_eq!(tx.num_pending(), 0);
    assert!(!tx.paths().get(tx_path).unwrap().can_reach(1));
    drive(&[&tx], || quiescent(&tx, tx_path));
}

#[test]
fn udp_drops_oversized_datagrams() {
    init_logger();
    let host_of = [0, 1];
    let mut fabrics = per_proc(2, |admin| UdpFabric::new(&admin, UdpConfig::default()).unwrap());
    let rx_addr = fabrics[1].local_addr().unwrap();
    let (rx, sink) = node(1, &host_of, test_config(false), None);
    add_fabric(&rx, fabrics.pop().unwrap());
    let (tx, _) = node(0, &host_of, test_config(false), None);
    add_fabric(&tx, fabrics.pop().unwrap());

    // A sound header followed by more payload than any fragment holds.
    let mut hdr = DataHeader::new(MsgType::Pt2Pt, WORLD_CTX, 0, 0, 1);
    hdr.set_data_len(4096);
    hdr.set_msg_len(4096);
    hdr.seal(ChecksumMode::None);
    let mut frame = hdr.as_bytes().to_vec();
    frame.resize(HDR_LEN + 4096, 0xee);
    let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    stranger.send_to(&frame, rx_addr).unwrap();

    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_millis(100) {
        rx.progress().unwrap();
    }
    assert!(sink.try_recv().is_none());
    assert_eq!(sink.num_partial(), 0);

    let msg = tx.isend(tx.message(WORLD_CTX, 1, 0, pattern(100))).unwrap();
    assert_eq!(recv_one(&[&tx, &rx], &sink).data, pattern(100));
    drive(&[&tx, &rx], || tx.send_done(&msg));
}

#[test]
fn ib_spreads_fragments_over_ports() {
    init_logger();
    let host_of = [0, 1];
    let fabric = Switch::new("ib");
    let cfg = IbConfig {
        num_hcas: 2,
        ports_per_hca: 2,
        ..IbConfig::default()
    };
    let mut fabrics = per_proc(2, move |admin| IbFabric::new(&admin, fabric.clone(), cfg.clone()).unwrap());
    let (rx, sink) = node(1, &host_of, test_config(true), None);
    add_fabric(&rx, fabrics.pop().unwrap());

    let ib = fabrics.pop().unwrap();
    assert_eq!(ib.lanes().len(), 4);
    let (tx, _) = node(0, &host_of, test_config(true), None);
    let tx_path = add_fabric(&tx, ib);

    let data = pattern(20_000);
    let msg = tx.isend(tx.message(WORLD_CTX, 1, 0, data.clone())).unwrap();
    assert!(msg.numfrags() > 4);
    let got = recv_one(&[&tx, &rx], &sink);
    assert_eq!(got.data, data);
    drive(&[&tx, &rx], || tx.send_done(&msg) && quiescent(&tx, tx_path));
}

#[test]
fn gm_scatters_into_a_strided_layout() {
    init_logger();
    let host_of = [0, 1];
    let myrinet = Switch::new("myrinet");
    let cfg = GmConfig {
        eager_payload: 1000,
        frag_payload: 700,
        ..GmConfig::default()
    };
    let mut fabrics = per_proc(2, move |admin| GmFabric::new(&admin, myrinet.clone(), cfg.clone()).unwrap());

    // Elements of 10 bytes carrying two 4-byte blocks at offsets 0 and 6.
    let dtype = Arc::new(Datatype::vector(2, 4, 6).unwrap());
    let count = 400;
    let user = pattern(dtype.span(count));
    let expected = dtype.pack_all(&user, count).unwrap();

    let ctx = ProcCtx::new(1, host_of.to_vec(), test_config(false)).unwrap();
    let sink = Reassembly::with_datatype(dtype.clone());
    let rx = Nexus::new(ctx, sink.clone());
    add_fabric(&rx, fabrics.pop().unwrap());
    let (tx, _) = node(0, &host_of, test_config(false), None);
    add_fabric(&tx, fabrics.pop().unwrap());

    let msg = tx
        .message(WORLD_CTX, 1, 0, user.clone())
        .with_datatype(dtype.clone(), count)
        .unwrap();
    assert_eq!(msg.len(), 8 * count);
    let msg = tx.isend(msg).unwrap();
    assert_eq!(msg.numfrags(), 1 + (8 * count - 1000usize).div_ceil(700));

    let got = recv_one(&[&tx, &rx], &sink);
    assert_eq!(got.data.len(), dtype.span(count));
    assert_eq!(dtype.pack_all(&got.data, count).unwrap(), expected);
    drive(&[&tx, &rx], || tx.send_done(&msg));
}

#[test]
fn communicator_ranks_reach_the_sink() {
    init_logger();
    let [(tx, _, _, _), (rx, sink, _, _)] = shm_pair(test_config(false), SharedMemConfig::default());
    // Both sides see the communicator as [1, 0]: process 0 is rank 1.
    for nx in [&tx, &rx] {
        nx.ctx().comms().insert(Communicator::intra(5, Group::new(vec![1, 0])));
    }
    tx.isend(tx.message(5, 0, 9, b"ranked".to_vec())).unwrap();
    let got = recv_one(&[&tx, &rx], &sink);
    assert_eq!((got.ctx, got.src, got.tag), (5, 1, 9));
    assert_eq!(got.data, b"ranked");
}
