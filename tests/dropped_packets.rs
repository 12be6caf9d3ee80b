use std::{net::UdpSocket, time::Duration};
use vis_ingest::{
    capture::{VisSource, VisSourceConfig},
    datagram::{VisDatagram, DATAGRAM_SIZE},
    ring::Take,
};

#[test]
fn truncated_datagrams_are_dropped_and_capture_continues() {
    let config = VisSourceConfig {
        port: 0,
        recv_buffer_size: 4 * 1024 * 1024,
        verify_recv_buffer: false,
        ring_capacity: 256,
        core: None,
    };
    let source = VisSource::new(&config).unwrap();
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest = ("127.0.0.1", source.local_addr().port());

    let sent: Vec<VisDatagram> = (0..30u64)
        .map(|i| VisDatagram {
            timestamp: 1000 + i,
            slice: (i % 4) as u32,
            ..Default::default()
        })
        .collect();
    for (i, dg) in sent.iter().enumerate() {
        let bytes = dg.to_bytes();
        if i % 3 == 2 {
            sock.send_to(&bytes[..DATAGRAM_SIZE / 2], dest).unwrap();
        } else {
            sock.send_to(&bytes, dest).unwrap();
        }
        // Keep loopback from dropping anything under load
        std::thread::sleep(Duration::from_millis(1));
    }

    let expected: Vec<&VisDatagram> = sent
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 != 2)
        .map(|(_, dg)| dg)
        .collect();
    for want in expected {
        match source.next(Duration::from_secs(2)) {
            Take::Item(got) => assert_eq!(&got, want),
            other => panic!("expected datagram {}, got {other:?}", want.timestamp),
        }
    }
    assert_eq!(source.next(Duration::from_millis(200)), Take::TimedOut);

    let stats = source.stats();
    assert_eq!(stats.received, 20);
    assert_eq!(stats.short, 10);
    assert_eq!(stats.version_mismatch, 0);
    assert!(source.is_running());
}
