// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use slab::Slab;

use crate::{channel::ShutdownMask, event::TransportHandle};

/// One queued outbound packet with its per-packet deadline.
pub(crate) struct OutPdu {
    pub data: Bytes,
    /// Bytes of `data` already handed to the socket.
    pub offset: usize,
    expire_at: Instant,
}

impl OutPdu {
    pub fn new(data: Bytes, timeout: Duration) -> Self {
        Self {
            data,
            offset: 0,
            expire_at: Instant::now() + timeout,
        }
    }

    pub fn expired(&self) -> bool {
        self.expire_at <= Instant::now()
    }

    pub fn expire_at(&self) -> Instant {
        self.expire_at
    }
}

/// The cross-thread half of a transport: everything `write` and `close`
/// touch from API threads. Socket, buffers and framing state stay with
/// the event loop.
pub(crate) struct TransportShared {
    pub channel_index: usize,
    pub generation: u64,
    pub send_queue: Mutex<VecDeque<OutPdu>>,
    shutdown: AtomicU8,
    alive: AtomicBool,
}

impl TransportShared {
    pub fn shutdown_mask(&self) -> ShutdownMask {
        ShutdownMask::from_bits_truncate(self.shutdown.load(Ordering::Acquire))
    }

    pub fn request_shutdown(&self, mask: ShutdownMask) {
        self.shutdown.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Generational slot arena of live transports.
///
/// Handles carry (slot, generation); a slot reused after destruction gets
/// a fresh generation, so stale handles resolve to nothing instead of
/// somebody else's connection.
pub(crate) struct TransportRegistry {
    slots: Mutex<Slab<Arc<TransportShared>>>,
    generation: AtomicU64,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slab::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, channel_index: usize) -> (TransportHandle, Arc<TransportShared>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let shared = Arc::new(TransportShared {
            channel_index,
            generation,
            send_queue: Mutex::new(VecDeque::new()),
            shutdown: AtomicU8::new(0),
            alive: AtomicBool::new(true),
        });
        let slot = self.slots.lock().insert(shared.clone());
        (TransportHandle { slot, generation }, shared)
    }

    pub fn get(&self, handle: TransportHandle) -> Option<Arc<TransportShared>> {
        self.slots
            .lock()
            .get(handle.slot)
            .filter(|shared| {
                shared.generation == handle.generation && shared.is_alive()
            })
            .cloned()
    }

    pub fn remove(&self, handle: TransportHandle) {
        let mut slots = self.slots.lock();
        let matches = slots
            .get(handle.slot)
            .map(|shared| shared.generation == handle.generation)
            .unwrap_or(false);
        if matches {
            let shared = slots.remove(handle.slot);
            shared.alive.store(false, Ordering::Release);
        }
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        for (_, shared) in slots.iter() {
            shared.alive.store(false, Ordering::Release);
        }
        slots.clear();
    }
}
