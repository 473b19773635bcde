// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::{Shutdown, TcpListener},
    thread,
    time::Duration,
};

use iomux::{ChannelKind, EventKind, HostPort, IoService};
use serial_test::serial;

use crate::integration_tests::common::event_sink;

/// The peer drops the first connection immediately; with a reconnect
/// timeout armed the channel must come back by itself and report a
/// second successful connect.
#[test]
#[serial]
fn tcp_client_reconnects_after_loss() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let acceptor = thread::spawn(move || {
        // First session: cut it at once.
        let (first, _) = listener.accept().expect("first accept");
        let _ = first.shutdown(Shutdown::Both);
        drop(first);
        // Second session: keep it alive long enough to be observed.
        let (second, _) = listener.accept().expect("second accept");
        thread::sleep(Duration::from_millis(500));
        drop(second);
    });

    let (sink, mut log) = event_sink();
    let service = IoService::new();
    service.set_reconnect_timeout(Some(Duration::from_millis(50)));
    service.start_service(&[HostPort::new("127.0.0.1", addr.port())], sink);
    service.open(0, ChannelKind::TCP_CLIENT);

    assert!(
        log.pump_until_count(&[&service], Duration::from_secs(5), 1, |event| {
            event.kind == EventKind::ConnectionLost
        }),
        "first connection must be lost"
    );
    assert!(
        log.pump_until_count(&[&service], Duration::from_secs(5), 2, |event| {
            event.kind == EventKind::ConnectResponse && event.error.is_none()
        }),
        "a second successful connect must follow"
    );

    service.stop_service();
    acceptor.join().expect("acceptor thread");
}
