// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::TcpListener, thread, time::Duration};

use iomux::{ChannelKind, EventKind, HostPort, IoError, IoService};
use serial_test::serial;

use crate::integration_tests::common::event_sink;

/// Closing a channel twice must not double-report the transport loss,
/// and a locally requested close reports the shutdown error.
#[test]
#[serial]
fn double_close_emits_one_connection_lost() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let holder = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_millis(500));
        drop(stream);
    });

    let (sink, mut log) = event_sink();
    let service = IoService::new();
    service.start_service(&[HostPort::new("127.0.0.1", addr.port())], sink);
    service.open(0, ChannelKind::TCP_CLIENT);

    log.pump_until(&[&service], Duration::from_secs(5), |event| {
        event.kind == EventKind::ConnectResponse && event.error.is_none()
    })
    .expect("connect");

    service.close(0);
    service.close(0);

    let lost = log
        .pump_until(&[&service], Duration::from_secs(5), |event| {
            event.kind == EventKind::ConnectionLost
        })
        .expect("the transport must go down");
    assert_eq!(lost.error, Some(IoError::Shutdown));

    log.pump_for(&[&service], Duration::from_millis(150));
    assert_eq!(log.count(EventKind::ConnectionLost), 1, "exactly one loss");
    assert!(!service.is_open(0));

    service.stop_service();
    holder.join().expect("holder thread");
}

/// A dead transport handle is inert: writing to it is a logged no-op.
#[test]
#[serial]
fn stale_handles_are_inert() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let holder = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_millis(300));
        drop(stream);
    });

    let (sink, mut log) = event_sink();
    let service = IoService::new();
    service.start_service(&[HostPort::new("127.0.0.1", addr.port())], sink);
    service.open(0, ChannelKind::TCP_CLIENT);

    let connected = log
        .pump_until(&[&service], Duration::from_secs(5), |event| {
            event.kind == EventKind::ConnectResponse && event.error.is_none()
        })
        .expect("connect");
    let handle = connected.transport.expect("transport");

    service.close_transport(handle);
    log.pump_until(&[&service], Duration::from_secs(5), |event| {
        event.kind == EventKind::ConnectionLost
    })
    .expect("loss");

    // Both of these hit a generation that no longer exists.
    service.write(handle, &b"into the void"[..]);
    service.close_transport(handle);
    log.pump_for(&[&service], Duration::from_millis(100));
    assert_eq!(log.count(EventKind::ConnectionLost), 1);

    service.stop_service();
    holder.join().expect("holder thread");
}
