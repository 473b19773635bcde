// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU8, Ordering},
};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::{errors::IoError, resolver::ResolveSlot};

bitflags! {
    /// Role of a channel: one of CLIENT/SERVER combined with one of
    /// TCP/UDP.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelKind: u8 {
        const CLIENT = 0b0001;
        const SERVER = 0b0010;
        const TCP    = 0b0100;
        const UDP    = 0b1000;
    }
}

impl ChannelKind {
    pub const TCP_CLIENT: Self = Self::CLIENT.union(Self::TCP);
    pub const TCP_SERVER: Self = Self::SERVER.union(Self::TCP);
    pub const UDP_CLIENT: Self = Self::CLIENT.union(Self::UDP);
    pub const UDP_SERVER: Self = Self::SERVER.union(Self::UDP);

    /// Exactly one role bit and one protocol bit.
    pub fn is_valid(self) -> bool {
        matches!(
            self,
            Self::TCP_CLIENT | Self::TCP_SERVER | Self::UDP_CLIENT | Self::UDP_SERVER
        )
    }

    pub fn is_client(self) -> bool {
        self.contains(Self::CLIENT)
    }

    pub fn is_server(self) -> bool {
        self.contains(Self::SERVER)
    }

    pub fn is_tcp(self) -> bool {
        self.contains(Self::TCP)
    }

    pub fn is_udp(self) -> bool {
        self.contains(Self::UDP)
    }
}

bitflags! {
    /// Half-close requests posted by the API threads and consumed by the
    /// event loop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ShutdownMask: u8 {
        const TRANSPORT = 0b01;
        const CHANNEL   = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Closed = 0,
    RequestOpen = 1,
    Opening = 2,
    Opened = 3,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ChannelState::RequestOpen,
            2 => ChannelState::Opening,
            3 => ChannelState::Opened,
            _ => ChannelState::Closed,
        }
    }
}

/// User-settable endpoint configuration of a channel.
#[derive(Debug, Clone)]
pub(crate) struct ChannelConfig {
    pub host: String,
    pub port: u16,
    pub local_port: u16,
}

/// A configured communication endpoint: identity, role, state machine
/// stage and resolution slot. Sockets belong to the event loop; this is
/// the half shared with API threads.
pub(crate) struct Channel {
    pub index: usize,
    pub cfg: Mutex<ChannelConfig>,
    kind: AtomicU8,
    state: AtomicU8,
    shutdown: AtomicU8,
    pub resolve: ResolveSlot,
    pub last_error: Mutex<Option<IoError>>,
    /// Locally bound address once a server channel opens (or a client
    /// transport connects); lets callers learn a system-assigned port.
    pub local_addr: Mutex<Option<SocketAddr>>,
}

impl Channel {
    pub fn new(index: usize, host: &str, port: u16) -> Self {
        let resolve = ResolveSlot::new();
        resolve.assign(host, port);
        Self {
            index,
            cfg: Mutex::new(ChannelConfig {
                host: host.to_string(),
                port,
                local_port: 0,
            }),
            kind: AtomicU8::new(0),
            state: AtomicU8::new(ChannelState::Closed as u8),
            shutdown: AtomicU8::new(0),
            resolve,
            last_error: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        ChannelKind::from_bits_truncate(self.kind.load(Ordering::Relaxed))
    }

    pub fn set_kind(&self, kind: ChannelKind) {
        self.kind.store(kind.bits(), Ordering::Relaxed);
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn shutdown_mask(&self) -> ShutdownMask {
        ShutdownMask::from_bits_truncate(self.shutdown.load(Ordering::Acquire))
    }

    pub fn request_shutdown(&self, mask: ShutdownMask) {
        self.shutdown.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    pub fn clear_shutdown(&self, mask: ShutdownMask) {
        self.shutdown.fetch_and(!mask.bits(), Ordering::AcqRel);
    }

    pub fn set_error(&self, error: IoError) {
        *self.last_error.lock() = Some(error);
    }
}
