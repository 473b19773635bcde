// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::TcpListener, sync::{Arc, atomic::{AtomicUsize, Ordering}}, thread, time::Duration};

use iomux::{ChannelKind, EventKind, HostPort, IoService};
use serial_test::serial;

use crate::integration_tests::common::event_sink;

/// A named host goes through the async resolve path before the connect
/// starts; a literal host must bypass the resolver entirely.
#[test]
#[serial]
fn hostname_resolves_off_thread_then_connects() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let holder = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_millis(300));
        drop(stream);
    });

    let (sink, mut log) = event_sink();
    let service = IoService::new();
    service.start_service(&[HostPort::new("localhost", addr.port())], sink);
    service.open(0, ChannelKind::TCP_CLIENT);

    let connected = log
        .pump_until(&[&service], Duration::from_secs(5), |event| {
            event.kind == EventKind::ConnectResponse
        })
        .expect("connect response");
    assert!(connected.error.is_none(), "resolve+connect failed: {connected:?}");

    service.stop_service();
    holder.join().expect("holder thread");
}

/// A custom resolver override is consulted instead of getaddrinfo.
#[test]
#[serial]
fn custom_resolver_override_is_used() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let holder = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_millis(300));
        drop(stream);
    });

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let (sink, mut log) = event_sink();
    let service = IoService::new();
    service.set_resolve_fn(move |host, port| {
        seen.fetch_add(1, Ordering::SeqCst);
        assert_eq!(host, "echo.internal");
        Ok(vec![([127, 0, 0, 1], port).into()])
    });
    service.start_service(&[HostPort::new("echo.internal", addr.port())], sink);
    service.open(0, ChannelKind::TCP_CLIENT);

    let connected = log
        .pump_until(&[&service], Duration::from_secs(5), |event| {
            event.kind == EventKind::ConnectResponse
        })
        .expect("connect response");
    assert!(connected.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    service.stop_service();
    holder.join().expect("holder thread");
}
