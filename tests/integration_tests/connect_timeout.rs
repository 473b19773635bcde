// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use iomux::{ChannelKind, EventKind, HostPort, IoError, IoService};
use serial_test::serial;
use socket2::{Domain, Protocol, Socket, Type};

use crate::integration_tests::common::event_sink;

/// A listener whose accept queue is already full, so further handshakes
/// never complete and the connect must die by deadline, not by RST.
fn saturated_listener() -> (Socket, SocketAddr, Vec<Socket>) {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .expect("listener socket");
    listener
        .bind(&"127.0.0.1:0".parse::<SocketAddr>().expect("addr").into())
        .expect("bind");
    listener.listen(1).expect("listen");
    let addr = listener
        .local_addr()
        .expect("local addr")
        .as_socket()
        .expect("inet addr");

    let mut fillers = Vec::new();
    for _ in 0..16 {
        let filler = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .expect("filler socket");
        filler.set_nonblocking(true).expect("nonblocking");
        let _ = filler.connect(&addr.into());
        fillers.push(filler);
    }
    // Give the kernel a moment to drown the backlog.
    std::thread::sleep(Duration::from_millis(50));

    (listener, addr, fillers)
}

#[test]
#[serial]
fn connect_times_out_against_a_dead_peer() {
    let (_listener, addr, _fillers) = saturated_listener();

    let (sink, mut log) = event_sink();
    let service = IoService::new();
    service.set_connect_timeout(Duration::from_millis(100));
    service.start_service(&[HostPort::new("127.0.0.1", addr.port())], sink);

    let started = Instant::now();
    service.open(0, ChannelKind::TCP_CLIENT);

    let response = log
        .pump_until(&[&service], Duration::from_secs(5), |event| {
            event.kind == EventKind::ConnectResponse
        })
        .expect("a connect response must arrive");
    let elapsed = started.elapsed();

    assert_eq!(response.error, Some(IoError::ConnectTimeout));
    assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "fired late: {elapsed:?}");
    assert!(!service.is_open(0));

    service.stop_service();
}
