// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::errors::IoError;

/// What happened on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A connect (or accept) finished; `error` says how.
    ConnectResponse,
    /// A transport died; its handle is no longer writable.
    ConnectionLost,
    /// One framed PDU arrived.
    RecvPacket,
}

/// Opaque reference to a live transport.
///
/// Handles are generational: once the transport is destroyed the handle
/// stops resolving, so a stale handle held across a `ConnectionLost` can
/// never touch a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

/// One notification delivered to the application.
#[derive(Debug, Clone)]
pub struct IoEvent {
    pub channel_index: usize,
    pub kind: EventKind,
    pub error: Option<IoError>,
    /// Present for `ConnectResponse(ok)`, `RecvPacket` and
    /// `ConnectionLost`.
    pub transport: Option<TransportHandle>,
    /// PDU payload; empty unless `kind == RecvPacket`.
    pub packet: Bytes,
}

impl IoEvent {
    pub(crate) fn connect_response(
        channel_index: usize,
        error: Option<IoError>,
        transport: Option<TransportHandle>,
    ) -> Self {
        Self {
            channel_index,
            kind: EventKind::ConnectResponse,
            error,
            transport,
            packet: Bytes::new(),
        }
    }

    pub(crate) fn connection_lost(
        channel_index: usize,
        error: IoError,
        transport: TransportHandle,
    ) -> Self {
        Self {
            channel_index,
            kind: EventKind::ConnectionLost,
            error: Some(error),
            transport: Some(transport),
            packet: Bytes::new(),
        }
    }

    pub(crate) fn recv_packet(
        channel_index: usize,
        transport: TransportHandle,
        packet: Bytes,
    ) -> Self {
        Self {
            channel_index,
            kind: EventKind::RecvPacket,
            error: None,
            transport: Some(transport),
            packet,
        }
    }
}

pub type EventCallback = Arc<dyn Fn(IoEvent) + Send + Sync>;

/// Delivers events either inline from the loop thread or through a
/// FIFO drained by the caller's own pump, depending on `deferred`.
pub(crate) struct EventDispatcher {
    deferred: AtomicBool,
    queue: Mutex<VecDeque<IoEvent>>,
    on_event: RwLock<Option<EventCallback>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            deferred: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            on_event: RwLock::new(None),
        }
    }

    pub fn set_callback(&self, callback: EventCallback) {
        *self.on_event.write() = Some(callback);
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::Relaxed);
    }

    pub fn handle(&self, event: IoEvent) {
        if self.deferred.load(Ordering::Relaxed) {
            self.queue.lock().push_back(event);
            return;
        }
        let callback = self.on_event.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Pulls at most `count` queued events. Events are popped one at a
    /// time so a callback that enqueues more work never deadlocks on the
    /// queue lock.
    pub fn dispatch(&self, count: usize) -> usize {
        let callback = match self.on_event.read().clone() {
            Some(callback) => callback,
            None => return 0,
        };

        let mut delivered = 0;
        while delivered < count {
            let Some(event) = self.queue.lock().pop_front() else {
                break;
            };
            callback(event);
            delivered += 1;
        }
        delivered
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
        *self.on_event.write() = None;
    }
}
