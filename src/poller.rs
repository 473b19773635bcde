// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, event::Source};

/// Token reserved for the interrupter; everything below is channels and
/// transports.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Transport tokens start here; channel tokens are the channel index.
pub(crate) const TRANSPORT_TOKEN_BASE: usize = 1 << 20;

/// Wakes the readiness wait from any thread.
///
/// The armed flag keeps the waker edge-like: repeated `interrupt` calls
/// collapse into one wake until the loop `reset`s after observing the
/// waker token. Spurious wakes are tolerated by the loop.
pub(crate) struct Interrupter {
    waker: mio::Waker,
    armed: AtomicBool,
}

impl Interrupter {
    pub fn new(registry: &mio::Registry) -> io::Result<Self> {
        Ok(Self {
            waker: mio::Waker::new(registry, WAKER_TOKEN)?,
            armed: AtomicBool::new(false),
        })
    }

    pub fn interrupt(&self) {
        if !self.armed.swap(true, Ordering::AcqRel)
            && let Err(err) = self.waker.wake()
        {
            tracing::warn!("failed to wake the event loop: {err}");
        }
    }

    pub fn reset(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

/// The readiness set and wait: an interest registry over mio's poll.
///
/// Registration is the snapshot; `wait` blocks until a registered source
/// is ready, the interrupter fires or the timeout lapses. The interface
/// deliberately hides mio so the loop would survive a swap to another
/// readiness backend.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    pub fn register(
        &self,
        source: &mut impl Source,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interests)
    }

    pub fn deregister(&self, source: &mut impl Source) {
        if let Err(err) = self.poll.registry().deregister(source) {
            tracing::debug!("deregister failed: {err}");
        }
    }

    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)
    }

    pub fn events(&self) -> &Events {
        &self.events
    }
}
