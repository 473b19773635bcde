// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::Write,
    net::TcpListener,
    thread,
    time::Duration,
};

use hex_literal::hex;
use iomux::{ChannelKind, EventKind, HostPort, IoService, LengthFieldParams};
use serial_test::serial;

use crate::integration_tests::common::event_sink;

/// The peer dribbles one 5-byte-body frame in fragments of 1, 2, 3 and
/// 3 bytes; the client must still assemble exactly one PDU.
#[test]
#[serial]
fn frame_reassembled_across_fragments() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let writer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let wire = hex!("00 00 00 05 48 65 6c 6c 6f");
        let mut sent = 0;
        for chunk in [1usize, 2, 3, 3] {
            stream.write_all(&wire[sent..sent + chunk]).expect("write chunk");
            stream.flush().expect("flush");
            sent += chunk;
            thread::sleep(Duration::from_millis(30));
        }
        // Hold the connection so EOF does not race the last fragment.
        thread::sleep(Duration::from_millis(300));
    });

    let (sink, mut log) = event_sink();
    let service = IoService::new();
    // The length field counts the body alone here, so the adjustment
    // adds the prefix back in.
    service.set_framing(LengthFieldParams {
        max_frame_length: 65536,
        length_field_offset: 0,
        length_field_length: 4,
        length_adjustment: 4,
    });
    service.start_service(&[HostPort::new("127.0.0.1", addr.port())], sink);
    service.open(0, ChannelKind::TCP_CLIENT);

    let packet = log
        .pump_until(&[&service], Duration::from_secs(5), |event| {
            event.kind == EventKind::RecvPacket
        })
        .expect("one PDU must come out");
    assert_eq!(&packet.packet[..], b"Hello");

    // And exactly one: keep pumping, nothing else may show up.
    log.pump_for(&[&service], Duration::from_millis(150));
    assert_eq!(log.count(EventKind::RecvPacket), 1);

    service.stop_service();
    writer.join().expect("writer thread");
}
