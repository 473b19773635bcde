// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::TcpListener,
    sync::mpsc::{RecvTimeoutError, channel},
    thread,
    time::Duration,
};

use iomux::{ChannelKind, EventKind, HostPort, IoService};
use serial_test::serial;

/// With deferred events nothing reaches the callback until the caller
/// pumps, and `dispatch_events(max_n)` respects its budget.
#[test]
#[serial]
fn deferred_events_wait_for_the_pump() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let holder = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_millis(600));
        drop(stream);
    });

    let (tx, rx) = channel();
    let service = IoService::new();
    // deferred_event defaults to on; this test relies on it.
    assert!(service.options().deferred_event);
    service.start_service(&[HostPort::new("127.0.0.1", addr.port())], move |event| {
        let _ = tx.send(event);
    });
    service.open(0, ChannelKind::TCP_CLIENT);

    // The connect has long finished, yet nothing was delivered.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(50)).err(),
        Some(RecvTimeoutError::Timeout),
        "no event may arrive before dispatch_events"
    );

    assert_eq!(service.dispatch_events(1), 1);
    let event = rx.recv_timeout(Duration::from_secs(1)).expect("event");
    assert_eq!(event.kind, EventKind::ConnectResponse);
    assert!(event.error.is_none());

    service.stop_service();
    holder.join().expect("holder thread");
}
