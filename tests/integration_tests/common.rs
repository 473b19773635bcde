// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::mpsc::{Receiver, TryRecvError, channel},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use iomux::{EventKind, IoEvent, IoService, LengthFieldParams};

/// Event sink feeding a collector; the callback itself stays trivially
/// cheap so loop timing is undisturbed.
pub fn event_sink() -> (impl Fn(IoEvent) + Send + Sync + 'static, EventLog) {
    let (tx, rx) = channel();
    (
        move |event| {
            let _ = tx.send(event);
        },
        EventLog { rx, seen: Vec::new() },
    )
}

/// Accumulates everything a service reported, in order, while pumping
/// deferred queues.
pub struct EventLog {
    rx: Receiver<IoEvent>,
    pub seen: Vec<IoEvent>,
}

impl EventLog {
    fn drain(&mut self, services: &[&IoService]) {
        for service in services {
            service.dispatch_events(64);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.seen.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Pumps until `count` events match `pred` or the timeout lapses.
    pub fn pump_until_count(
        &mut self,
        services: &[&IoService],
        timeout: Duration,
        count: usize,
        pred: impl Fn(&IoEvent) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain(services);
            if self.seen.iter().filter(|event| pred(event)).count() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn pump_until(
        &mut self,
        services: &[&IoService],
        timeout: Duration,
        pred: impl Fn(&IoEvent) -> bool,
    ) -> Option<IoEvent> {
        if self.pump_until_count(services, timeout, 1, &pred) {
            self.seen.iter().find(|event| pred(event)).cloned()
        } else {
            None
        }
    }

    /// Keeps pumping for `duration` regardless of matches.
    pub fn pump_for(&mut self, services: &[&IoService], duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.drain(services);
            thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn packets(&self) -> Vec<Bytes> {
        self.seen
            .iter()
            .filter(|event| event.kind == EventKind::RecvPacket)
            .map(|event| event.packet.clone())
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.seen.iter().filter(|event| event.kind == kind).count()
    }
}

/// S1-style framing: a 4-byte big-endian prefix carrying the total
/// frame size.
pub fn exact_framing() -> LengthFieldParams {
    LengthFieldParams {
        max_frame_length: 65536,
        length_field_offset: 0,
        length_field_length: 4,
        length_adjustment: 0,
    }
}

/// Encodes one frame under [`exact_framing`].
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32 + 4).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Polls until the channel reports its bound endpoint (a listener came
/// up) or panics.
pub fn wait_local_endpoint(service: &IoService, channel_index: usize) -> SocketAddr {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(addr) = service.local_endpoint(channel_index) {
            return addr;
        }
        assert!(Instant::now() < deadline, "channel {channel_index} never opened");
        thread::sleep(Duration::from_millis(2));
    }
}
