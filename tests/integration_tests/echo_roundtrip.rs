// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use iomux::{ChannelKind, EventKind, HostPort, IoService};
use serial_test::serial;

use crate::integration_tests::common::{
    encode_frame, event_sink, exact_framing, wait_local_endpoint,
};

/// One TCP server channel, one TCP client channel, framed PDUs both
/// ways. Three payloads go out, the server echoes them framed
/// identically, the client gets them back in order.
#[test]
#[serial]
fn tcp_echo_roundtrip() {
    let (server_sink, mut server_log) = event_sink();
    let server = IoService::new();
    server.set_framing(exact_framing());
    server.start_service(&[HostPort::new("127.0.0.1", 0)], server_sink);
    server.open(0, ChannelKind::TCP_SERVER);
    let addr = wait_local_endpoint(&server, 0);

    let (client_sink, mut client_log) = event_sink();
    let client = IoService::new();
    client.set_framing(exact_framing());
    client.start_service(&[HostPort::new("127.0.0.1", addr.port())], client_sink);
    client.open(0, ChannelKind::TCP_CLIENT);

    let connected = client_log
        .pump_until(&[&client], Duration::from_secs(5), |event| {
            event.kind == EventKind::ConnectResponse && event.error.is_none()
        })
        .expect("client must connect");
    let client_handle = connected.transport.expect("connect carries a transport");

    let accepted = server_log
        .pump_until(&[&server], Duration::from_secs(5), |event| {
            event.kind == EventKind::ConnectResponse && event.error.is_none()
        })
        .expect("server must accept");
    let server_handle = accepted.transport.expect("accept carries a transport");

    let payloads: [&[u8]; 3] = [b"a", b"bb", b""];
    for payload in payloads {
        client.write(client_handle, encode_frame(payload));
    }

    assert!(
        server_log.pump_until_count(&[&server], Duration::from_secs(5), 3, |event| {
            event.kind == EventKind::RecvPacket
        }),
        "server must read three PDUs"
    );
    let inbound = server_log.packets();
    assert_eq!(inbound.len(), 3);
    assert_eq!(&inbound[0][..], b"a");
    assert_eq!(&inbound[1][..], b"bb");
    assert_eq!(&inbound[2][..], b"");

    for packet in &inbound {
        server.write(server_handle, encode_frame(packet));
    }

    assert!(
        client_log.pump_until_count(
            &[&client, &server],
            Duration::from_secs(5),
            3,
            |event| event.kind == EventKind::RecvPacket
        ),
        "client must read the echoes"
    );
    let echoed = client_log.packets();
    assert_eq!(&echoed[0][..], b"a");
    assert_eq!(&echoed[1][..], b"bb");
    assert_eq!(&echoed[2][..], b"");

    client.stop_service();
    server.stop_service();
}
