// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, ToSocketAddrs},
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};

use crate::errors::IoError;

/// Stage of a channel's name-to-endpoint mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResolveState {
    Ready = 0,
    Dirty = 1,
    InProgress = 2,
    Failed = 3,
}

impl ResolveState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ResolveState::Ready,
            1 => ResolveState::Dirty,
            2 => ResolveState::InProgress,
            _ => ResolveState::Failed,
        }
    }
}

/// Signature for a user-supplied resolver override.
pub type ResolveFn = dyn Fn(&str, u16) -> io::Result<Vec<SocketAddr>> + Send + Sync;

/// Resolution state for one channel.
///
/// Only the resolve worker writes `endpoints` while the state is
/// `InProgress`; the event loop reads them only once the state moved on
/// (Release on completion, Acquire on read), so the loop never observes a
/// half-written list.
pub(crate) struct ResolveSlot {
    state: AtomicU8,
    /// Whether the host is a name that actually needs a DNS query.
    needs_query: AtomicBool,
    endpoints: Mutex<Vec<SocketAddr>>,
    resolved_at: Mutex<Option<Instant>>,
    /// Why the last resolution failed; reported with the
    /// CONNECT_RESPONSE of the open that needed it.
    failure: Mutex<IoError>,
}

impl ResolveSlot {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ResolveState::Failed as u8),
            needs_query: AtomicBool::new(false),
            endpoints: Mutex::new(Vec::new()),
            resolved_at: Mutex::new(None),
            failure: Mutex::new(IoError::ResolveHostFailed),
        }
    }

    pub fn state(&self) -> ResolveState {
        ResolveState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ResolveState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.endpoints.lock().clone()
    }

    pub fn clear_endpoints(&self) {
        self.endpoints.lock().clear();
    }

    /// Re-derives the state from a (host, port) assignment. IP literals
    /// go straight to `Ready` and never query; a zero port can never
    /// resolve.
    pub fn assign(&self, host: &str, port: u16) {
        if port == 0 {
            self.needs_query.store(false, Ordering::Relaxed);
            *self.failure.lock() = IoError::ResolveHostFailed;
            self.set_state(ResolveState::Failed);
            return;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                *self.endpoints.lock() = vec![SocketAddr::new(ip, port)];
                self.needs_query.store(false, Ordering::Relaxed);
                self.set_state(ResolveState::Ready);
            },
            Err(_) => {
                self.endpoints.lock().clear();
                self.needs_query.store(true, Ordering::Relaxed);
                self.set_state(ResolveState::Dirty);
            },
        }
    }

    /// A cached query result older than `max_age` must be redone.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        if !self.needs_query.load(Ordering::Relaxed) {
            return false;
        }
        if self.state() != ResolveState::Ready {
            return false;
        }
        match *self.resolved_at.lock() {
            Some(at) => at.elapsed() >= max_age,
            None => true,
        }
    }

    /// Worker-side completion. `addrs` must be non-empty.
    pub fn complete_ok(&self, addrs: Vec<SocketAddr>) {
        debug_assert!(!addrs.is_empty());
        *self.endpoints.lock() = addrs;
        *self.resolved_at.lock() = Some(Instant::now());
        self.set_state(ResolveState::Ready);
    }

    pub fn complete_failed(&self, error: IoError) {
        *self.failure.lock() = error;
        self.set_state(ResolveState::Failed);
    }

    pub fn failure(&self) -> IoError {
        *self.failure.lock()
    }
}

/// Address families the local stack can actually use, probed the way the
/// channels open sockets: a wildcard-bound datagram socket per family.
#[derive(Debug, Clone, Copy)]
struct IpStack {
    v4: bool,
    v6: bool,
}

impl IpStack {
    fn probe() -> Self {
        fn usable(domain: Domain, addr: SocketAddr) -> bool {
            Socket::new(domain, Type::DGRAM, None)
                .and_then(|socket| socket.bind(&addr.into()))
                .is_ok()
        }
        Self {
            v4: usable(Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into()),
            v6: usable(Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into()),
        }
    }
}

/// Picks the endpoints a resolve may hand to the connect path.
///
/// IPv4-capable stacks take the IPv4 records. On an IPv6-only network
/// the v6 records are used, falling back to the v4 records re-expressed
/// as v4-mapped-v6 (`::ffff:a.b.c.d`); when neither form exists the
/// host cannot be reached over v6 and the failure says so.
fn select_endpoints(
    stack: IpStack,
    addrs: Vec<SocketAddr>,
) -> Result<Vec<SocketAddr>, IoError> {
    if stack.v4 {
        let v4: Vec<SocketAddr> = addrs
            .iter()
            .copied()
            .filter(|addr| addr.is_ipv4())
            .collect();
        if !v4.is_empty() {
            return Ok(v4);
        }
        if !stack.v6 {
            return Err(IoError::ResolveHostFailed);
        }
    }
    if stack.v6 {
        let v6: Vec<SocketAddr> = addrs
            .iter()
            .copied()
            .filter(|addr| addr.is_ipv6())
            .collect();
        if !v6.is_empty() {
            return Ok(v6);
        }
        let mapped: Vec<SocketAddr> = addrs
            .iter()
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(SocketAddr::V6(SocketAddrV6::new(
                    v4.ip().to_ipv6_mapped(),
                    v4.port(),
                    0,
                    0,
                ))),
                SocketAddr::V6(_) => None,
            })
            .collect();
        if !mapped.is_empty() {
            return Ok(mapped);
        }
        return Err(IoError::ResolveHostIpv6Required);
    }
    Err(IoError::ResolveHostFailed)
}

/// Default resolver: the platform's `getaddrinfo` via `ToSocketAddrs`,
/// narrowed by the local stack — IPv4 records on an IPv4-capable host,
/// with the v6 → v4-mapped-v6 fallback on IPv6-only networks.
pub(crate) fn default_resolve(
    host: &str,
    port: u16,
) -> Result<Vec<SocketAddr>, IoError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| IoError::ResolveHostFailed)?
        .collect();
    select_endpoints(IpStack::probe(), addrs)
}
