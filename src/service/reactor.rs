// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use mio::{
    Interest, Token,
    net::{TcpListener, TcpStream, UdpSocket},
};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::{debug, error, info, warn};

use crate::{
    cfg::config::TcpKeepaliveOptions,
    channel::{Channel, ChannelKind, ChannelState, ShutdownMask},
    errors::IoError,
    event::{IoEvent, TransportHandle},
    framing::{self, FrameHint, MAX_PDU_RESERVE},
    poller::{Interrupter, Poller, TRANSPORT_TOKEN_BASE, WAKER_TOKEN},
    resolver::{ResolveState, default_resolve},
    service::core::{Inner, ServiceState},
    timer::TimerEntry,
    transport::TransportShared,
};

/// Upper bound for one readiness wait; timers and I/O deadlines shorten
/// it.
const MAX_WAIT_DURATION: Duration = Duration::from_secs(5 * 60);

/// Scratch buffer of each transport; one non-blocking receive per tick
/// lands here before framing.
const RECV_BUFFER_SIZE: usize = 65536;

/// Largest datagram the UDP accept path can take in.
const DATAGRAM_BUFFER_SIZE: usize = 65535;

const LISTEN_BACKLOG: i32 = 128;

enum ChannelSocket {
    Listener(TcpListener),
    Udp(UdpSocket),
    Connecting(TcpStream),
}

/// Loop-private per-channel I/O state. Readiness flags are edge-carried:
/// set when the poll reports the token, cleared only when an operation
/// hits `WouldBlock`.
#[derive(Default)]
struct ChannelIo {
    socket: Option<ChannelSocket>,
    readable: bool,
    writable: bool,
    connect_deadline: Option<Instant>,
}

enum TransportSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl TransportSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TransportSocket::Tcp(stream) => stream.read(buf),
            TransportSocket::Udp(socket) => socket.recv(buf),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TransportSocket::Tcp(stream) => stream.write(buf),
            TransportSocket::Udp(socket) => socket.send(buf),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            TransportSocket::Tcp(stream) => stream.local_addr(),
            TransportSocket::Udp(socket) => socket.local_addr(),
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            TransportSocket::Tcp(stream) => stream.peer_addr(),
            TransportSocket::Udp(socket) => socket.peer_addr(),
        }
    }
}

/// Loop-private half of a live connection: the socket, the inbound
/// scratch buffer and the framing state. The cross-thread half lives in
/// [`TransportShared`].
struct TransportIo {
    handle: TransportHandle,
    shared: Arc<TransportShared>,
    channel_index: usize,
    socket: TransportSocket,
    buf: Box<[u8]>,
    /// Valid bytes at the head of `buf`.
    offset: usize,
    /// Total size of the frame being accumulated; `None` until its
    /// header decodes.
    expected_size: Option<usize>,
    /// Leading bytes of the current frame withheld from the PDU.
    strip: usize,
    packet: BytesMut,
    readable: bool,
    writable: bool,
    error: Option<IoError>,
}

/// The event loop. Owns every socket; everything shared with API
/// threads goes through [`Inner`].
pub(crate) struct Reactor {
    inner: Arc<Inner>,
    poller: Poller,
    interrupter: Arc<Interrupter>,
    chan_io: Vec<ChannelIo>,
    transports: HashMap<usize, TransportIo>,
    /// Known pending progress; a non-zero value skips the next blocking
    /// wait.
    outstanding_work: usize,
    datagram_buf: Box<[u8]>,
}

impl Reactor {
    pub fn new(inner: Arc<Inner>, poller: Poller, interrupter: Arc<Interrupter>) -> Self {
        Self {
            inner,
            poller,
            interrupter,
            chan_io: Vec::new(),
            transports: HashMap::new(),
            outstanding_work: 0,
            datagram_buf: vec![0u8; DATAGRAM_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    pub fn run(mut self) {
        let channel_count = self.inner.channels.read().len();
        self.chan_io = (0..channel_count).map(|_| ChannelIo::default()).collect();
        info!("event loop started, channels:{channel_count}");

        while self.inner.service_state() == ServiceState::Running {
            if !self.do_evpoll() {
                break;
            }
            if self.inner.service_state() != ServiceState::Running {
                break;
            }
            self.perform_transports();
            self.perform_channels();
            self.inner.timers.fire_expired();
        }

        info!("event loop exited");
    }

    /// One readiness pass. Returns false only on a fatal poll error.
    fn do_evpoll(&mut self) -> bool {
        let mut nfds = std::mem::take(&mut self.outstanding_work);
        if nfds == 0 {
            let wait = self
                .inner
                .timers
                .next_wait(MAX_WAIT_DURATION)
                .min(self.next_io_deadline());
            if wait > Duration::ZERO {
                match self.poller.wait(Some(wait)) {
                    Ok(()) => nfds = self.apply_readiness(),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                    Err(err) => {
                        error!(
                            "readiness wait failed, ec:{:?}, detail:{err}",
                            err.raw_os_error()
                        );
                        if is_fatal_poll_error(&err) {
                            return false;
                        }
                    },
                }
            } else {
                nfds = self.chan_io.len() * 2;
            }
        }
        debug!("evpoll pass, nfds:{nfds}");
        true
    }

    fn apply_readiness(&mut self) -> usize {
        let mut nfds = 0;
        for event in self.poller.events() {
            let token = event.token();
            if token == WAKER_TOKEN {
                self.interrupter.reset();
                continue;
            }
            nfds += 1;
            let readable =
                event.is_readable() || event.is_read_closed() || event.is_error();
            let writable =
                event.is_writable() || event.is_write_closed() || event.is_error();
            if token.0 >= TRANSPORT_TOKEN_BASE {
                if let Some(t) = self.transports.get_mut(&(token.0 - TRANSPORT_TOKEN_BASE))
                {
                    t.readable |= readable;
                    t.writable |= writable;
                }
            } else if let Some(io) = self.chan_io.get_mut(token.0) {
                io.readable |= readable;
                io.writable |= writable;
            }
        }
        nfds
    }

    /// Earliest connect deadline or send-queue head expiry, so a stalled
    /// socket cannot outsleep its timeout.
    fn next_io_deadline(&self) -> Duration {
        let now = Instant::now();
        let mut wait = MAX_WAIT_DURATION;
        for io in &self.chan_io {
            if let Some(deadline) = io.connect_deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
        }
        for t in self.transports.values() {
            if let Some(front) = t.shared.send_queue.lock().front() {
                wait = wait.min(front.expire_at().saturating_duration_since(now));
            }
        }
        wait
    }

    fn perform_transports(&mut self) {
        let slots: Vec<usize> = self.transports.keys().copied().collect();
        for slot in slots {
            let Some(mut t) = self.transports.remove(&slot) else {
                continue;
            };
            let channel_mask = self
                .inner
                .channel(t.channel_index)
                .map(|ctx| ctx.shutdown_mask())
                .unwrap_or(ShutdownMask::empty());

            let mut doomed = false;
            if (t.shared.shutdown_mask() | channel_mask).contains(ShutdownMask::TRANSPORT)
            {
                t.error = Some(IoError::Shutdown);
                doomed = true;
            } else if t.offset > 0 || t.readable {
                doomed = !self.do_read(&mut t);
            }

            if !doomed && !t.shared.send_queue.lock().is_empty() {
                doomed = !self.do_write(&mut t);
            }

            if doomed {
                self.handle_close(t);
            } else {
                self.transports.insert(slot, t);
            }
        }
    }

    fn do_read(&mut self, t: &mut TransportIo) -> bool {
        let n = match t.socket.recv(&mut t.buf[t.offset..]) {
            Ok(0) => {
                info!(
                    "[index: {}] the remote host closed the connection",
                    t.channel_index
                );
                t.error = Some(IoError::ConnectionLost);
                return false;
            },
            Ok(n) => {
                // The socket may hold more than one receive's worth.
                self.outstanding_work += 1;
                n
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                t.readable = false;
                0
            },
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => {
                warn!(
                    "[index: {}] recv failed, ec:{:?}, detail:{err}",
                    t.channel_index,
                    err.raw_os_error()
                );
                t.error = Some(IoError::from_io(&err));
                return false;
            },
        };

        let available = t.offset + n;
        match t.expected_size {
            None => {
                if available == 0 {
                    return true;
                }
                let (hint, strip) = self.decode_frame(&t.buf[..available]);
                match hint {
                    FrameHint::Frame(length) => {
                        t.expected_size = Some(length);
                        t.strip = strip;
                        t.packet.reserve(length.min(MAX_PDU_RESERVE));
                        self.do_unpack(t, length, n);
                    },
                    FrameHint::Partial => t.offset = available,
                    FrameHint::Invalid => {
                        error!(
                            "[index: {}] decode length of pdu failed, the \
                             connection will be closed",
                            t.channel_index
                        );
                        t.error = Some(IoError::IllegalPdu);
                        return false;
                    },
                }
            },
            Some(expected) => {
                let remaining = expected - t.packet.len();
                self.do_unpack(t, remaining, n);
            },
        }
        true
    }

    fn decode_frame(&self, buf: &[u8]) -> (FrameHint, usize) {
        let custom = self.inner.decode_fn.read().clone();
        let (hint, strip) = match custom {
            Some(decode) => (decode(buf), 0),
            None => {
                let params = self.inner.options.lock().framing;
                (
                    framing::decode_frame_length(&params, buf),
                    framing::prefix_len(&params),
                )
            },
        };
        // A zero-size frame would never advance the stream.
        match hint {
            FrameHint::Frame(0) => (FrameHint::Invalid, 0),
            _ => (hint, strip),
        }
    }

    /// Moves up to `bytes_expected` buffered bytes into the PDU
    /// accumulator and emits the packet once complete. Residual bytes
    /// shift to the buffer head and keep the loop spinning.
    fn do_unpack(&mut self, t: &mut TransportIo, bytes_expected: usize, n: usize) {
        let available = t.offset + n;
        let take = bytes_expected.min(available);
        t.packet.extend_from_slice(&t.buf[..take]);

        if available >= bytes_expected {
            let residual = available - bytes_expected;
            if residual > 0 {
                t.buf.copy_within(bytes_expected..available, 0);
                self.outstanding_work += 1;
            }
            t.offset = residual;

            let frame = std::mem::take(&mut t.packet).freeze();
            debug!(
                "[index: {}] received a packet, frame size:{}",
                t.channel_index,
                frame.len()
            );
            let payload = frame.slice(t.strip.min(frame.len())..);
            t.expected_size = None;
            t.strip = 0;
            self.inner
                .handle_event(IoEvent::recv_packet(t.channel_index, t.handle, payload));
        } else {
            t.offset = 0;
        }
    }

    fn do_write(&mut self, t: &mut TransportIo) -> bool {
        let mut queue = t.shared.send_queue.lock();

        // Heads that expired while the socket was jammed are dropped so
        // the queue keeps moving.
        while queue.front().map(|pdu| pdu.expired()).unwrap_or(false) {
            if let Some(pdu) = queue.pop_front() {
                warn!(
                    "[index: {}] send timeout, dropping a packet, size:{}",
                    t.channel_index,
                    pdu.data.len()
                );
            }
        }

        let Some(front) = queue.front_mut() else {
            return true;
        };
        let remaining = front.data.len() - front.offset;
        match t.socket.send(&front.data[front.offset..]) {
            Ok(n) if n == remaining => {
                let size = front.data.len();
                queue.pop_front();
                debug!("[index: {}] a packet sent, size:{size}", t.channel_index);
                if !queue.is_empty() {
                    self.outstanding_work += 1;
                }
            },
            Ok(n) if n > 0 => {
                front.offset += n;
                debug!(
                    "[index: {}] partial send, {} bytes still outstanding",
                    t.channel_index,
                    remaining - n
                );
                self.outstanding_work += 1;
            },
            Ok(_) => t.writable = false,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                t.writable = false;
            },
            Err(err) => {
                warn!(
                    "[index: {}] send failed, ec:{:?}, detail:{err}",
                    t.channel_index,
                    err.raw_os_error()
                );
                t.error = Some(IoError::from_io(&err));
                return false;
            },
        }
        true
    }

    /// Tears a transport down: socket closed, handle invalidated,
    /// `ConnectionLost` enqueued, and for TCP clients a reconnect timer
    /// armed when configured.
    fn handle_close(&mut self, mut t: TransportIo) {
        let error = t.error.take().unwrap_or(IoError::ConnectionLost);
        info!(
            "[index: {}] the connection is lost, error:{error}",
            t.channel_index
        );

        match &mut t.socket {
            TransportSocket::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
                self.poller.deregister(stream);
            },
            TransportSocket::Udp(socket) => self.poller.deregister(socket),
        }
        self.inner.registry.remove(t.handle);

        let ctx = self.inner.channel(t.channel_index);
        if let Some(ctx) = &ctx {
            ctx.clear_shutdown(ShutdownMask::TRANSPORT);
            ctx.set_error(error);
        }
        self.inner
            .handle_event(IoEvent::connection_lost(t.channel_index, error, t.handle));

        if let Some(ctx) = ctx
            && ctx.kind() == ChannelKind::TCP_CLIENT
        {
            if ctx.state() != ChannelState::RequestOpen {
                ctx.set_state(ChannelState::Closed);
            }
            let reconnect = self.inner.options.lock().reconnect_timeout;
            if let Some(delay) = reconnect
                && error != IoError::Shutdown
                && self.inner.service_state() == ServiceState::Running
            {
                debug!("[index: {}] reconnecting in {delay:?}", ctx.index);
                let entry = TimerEntry::new();
                entry.expires_from_now(delay);
                let service = Arc::downgrade(&self.inner);
                let index = ctx.index;
                entry.set_callback(Box::new(move |cancelled| {
                    if cancelled {
                        return;
                    }
                    if let Some(inner) = service.upgrade()
                        && let Some(ctx) = inner.channel(index)
                    {
                        inner.open_internal(&ctx);
                    }
                }));
                // The timer queue owns the entry until it fires.
                self.inner.schedule_timer(&entry);
            }
        }
    }

    fn perform_channels(&mut self) {
        let snapshot: Vec<usize> = self.inner.active.lock().clone();
        if snapshot.is_empty() {
            return;
        }

        let mut finished: Vec<usize> = Vec::new();
        for index in snapshot {
            let Some(ctx) = self.inner.channel(index) else {
                finished.push(index);
                continue;
            };
            let kind = ctx.kind();
            let mut finish = false;
            if kind.is_client() {
                match ctx.state() {
                    ChannelState::RequestOpen => {
                        finish = self.do_nonblocking_connect(&ctx);
                    },
                    ChannelState::Opening => {
                        finish = self.do_connect_completion(&ctx);
                    },
                    ChannelState::Closed => {
                        // A close raced the connect; drop the in-flight
                        // socket and its deadline.
                        self.close_channel_socket(index);
                        finish = true;
                    },
                    ChannelState::Opened => finish = true,
                }
            } else if kind.is_server() {
                match ctx.state() {
                    ChannelState::RequestOpen => self.do_listen(&ctx),
                    ChannelState::Opened => self.do_accept(&ctx),
                    ChannelState::Closed => {
                        self.close_channel_socket(index);
                        ctx.clear_shutdown(ShutdownMask::all());
                        info!("the channel: {index} is closed!");
                        finish = true;
                    },
                    ChannelState::Opening => {},
                }
            } else {
                finish = true;
            }
            if finish {
                finished.push(index);
            }
        }

        if !finished.is_empty() {
            let mut active = self.inner.active.lock();
            // An event callback may have re-opened a finished channel; a
            // fresh REQUEST_OPEN stays on the active list.
            active.retain(|index| {
                if !finished.contains(index) {
                    return true;
                }
                self.inner
                    .channel(*index)
                    .map(|ctx| ctx.state() == ChannelState::RequestOpen)
                    .unwrap_or(false)
            });
        }
    }

    /// Client REQUEST_OPEN: resolve if needed, then start the
    /// non-blocking connect. Returns whether the channel is done with
    /// the active list.
    fn do_nonblocking_connect(&mut self, ctx: &Arc<Channel>) -> bool {
        let (connect_timeout, dns_cache_timeout) = {
            let options = self.inner.options.lock();
            (options.connect_timeout, options.dns_cache_timeout)
        };

        if ctx.resolve.is_stale(dns_cache_timeout) {
            ctx.resolve.set_state(ResolveState::Dirty);
        }

        match ctx.resolve.state() {
            ResolveState::Ready => {
                self.close_channel_socket(ctx.index);
                ctx.clear_shutdown(ShutdownMask::all());
                ctx.set_state(ChannelState::Opening);

                let endpoints = ctx.resolve.endpoints();
                let Some(&endpoint) = endpoints.first() else {
                    self.handle_connect_failed(ctx, IoError::ResolveHostFailed);
                    return true;
                };
                let (host, port, local_port) = {
                    let cfg = ctx.cfg.lock();
                    (cfg.host.clone(), cfg.port, cfg.local_port)
                };

                if ctx.kind().is_tcp() {
                    info!("[index: {}] connecting server {host}:{port}...", ctx.index);
                    match self.begin_tcp_connect(ctx.index, endpoint, local_port) {
                        Ok(()) => {
                            self.chan_io[ctx.index].connect_deadline =
                                Some(Instant::now() + connect_timeout);
                            false
                        },
                        Err(err) => {
                            warn!(
                                "[index: {}] connect start failed: {err}",
                                ctx.index
                            );
                            self.handle_connect_failed(ctx, IoError::from_io(&err));
                            true
                        },
                    }
                } else {
                    // UDP client connect is synchronous: assign the peer
                    // address and the channel is open.
                    match udp_client_socket(endpoint, local_port) {
                        Ok(socket) => {
                            self.handle_connect_succeed(
                                ctx,
                                TransportSocket::Udp(socket),
                            );
                            true
                        },
                        Err(err) => {
                            self.handle_connect_failed(ctx, IoError::from_io(&err));
                            true
                        },
                    }
                }
            },
            ResolveState::Failed => {
                let error = ctx.resolve.failure();
                self.handle_connect_failed(ctx, error);
                true
            },
            ResolveState::Dirty => {
                self.start_resolve(ctx);
                false
            },
            ResolveState::InProgress => false,
        }
    }

    fn begin_tcp_connect(
        &mut self,
        index: usize,
        endpoint: SocketAddr,
        local_port: u16,
    ) -> io::Result<()> {
        let socket =
            Socket::new(Domain::for_address(endpoint), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        if local_port != 0 {
            let local: SocketAddr = match endpoint {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, local_port).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, local_port).into(),
            };
            socket.bind(&local.into())?;
        }
        match socket.connect(&endpoint.into()) {
            Ok(()) => {},
            Err(err) if connect_in_progress(&err) => {},
            Err(err) => return Err(err),
        }

        let mut stream = TcpStream::from_std(socket.into());
        self.poller.register(
            &mut stream,
            Token(index),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let io = &mut self.chan_io[index];
        io.socket = Some(ChannelSocket::Connecting(stream));
        io.readable = false;
        io.writable = false;
        Ok(())
    }

    /// Client OPENING: the connect finished when the socket reports
    /// writability; write-readiness alone is not success, the pending
    /// socket error decides.
    fn do_connect_completion(&mut self, ctx: &Arc<Channel>) -> bool {
        let index = ctx.index;
        let ready = {
            let io = &self.chan_io[index];
            io.readable || io.writable
        };

        if ready {
            let Some(ChannelSocket::Connecting(mut stream)) =
                self.chan_io[index].socket.take()
            else {
                self.handle_connect_failed(ctx, IoError::ConnectFailed);
                return true;
            };

            let connect_error = match stream.take_error() {
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => None,
                    Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                        // Spurious wake: the handshake is still running.
                        let io = &mut self.chan_io[index];
                        io.socket = Some(ChannelSocket::Connecting(stream));
                        io.readable = false;
                        io.writable = false;
                        return false;
                    },
                    Err(err) => Some(IoError::from_io(&err)),
                },
                Ok(Some(err)) | Err(err) => {
                    warn!(
                        "[index: {index}] connect completion error, ec:{:?}, \
                         detail:{err}",
                        err.raw_os_error()
                    );
                    Some(IoError::ConnectFailed)
                },
            };

            self.chan_io[index].connect_deadline = None;
            match connect_error {
                None => {
                    // Re-registered under a transport token, read side
                    // first; the connect-time write interest goes away
                    // with the old registration.
                    self.poller.deregister(&mut stream);
                    self.handle_connect_succeed(ctx, TransportSocket::Tcp(stream));
                },
                Some(error) => {
                    self.poller.deregister(&mut stream);
                    drop(stream);
                    self.handle_connect_failed(ctx, error);
                },
            }
            true
        } else if self.chan_io[index]
            .connect_deadline
            .map(|deadline| deadline <= Instant::now())
            .unwrap_or(false)
        {
            self.chan_io[index].connect_deadline = None;
            self.handle_connect_failed(ctx, IoError::ConnectTimeout);
            true
        } else {
            false
        }
    }

    /// Server REQUEST_OPEN: bind (and listen for TCP), register for
    /// read. Failures close the channel and report through
    /// CONNECT_RESPONSE.
    fn do_listen(&mut self, ctx: &Arc<Channel>) {
        self.close_channel_socket(ctx.index);
        ctx.clear_shutdown(ShutdownMask::all());

        let (host, port) = {
            let cfg = ctx.cfg.lock();
            (cfg.host.clone(), cfg.port)
        };
        let bind_addr: SocketAddr = match host.parse::<IpAddr>() {
            Ok(ip) => (ip, port).into(),
            Err(_) => (Ipv4Addr::UNSPECIFIED, port).into(),
        };

        let opened = if ctx.kind().is_tcp() {
            tcp_listener(bind_addr).map(ChannelSocket::Listener)
        } else {
            udp_listener(bind_addr).map(ChannelSocket::Udp)
        };

        match opened {
            Ok(mut socket) => {
                let local = match &socket {
                    ChannelSocket::Listener(listener) => listener.local_addr(),
                    ChannelSocket::Udp(udp) => udp.local_addr(),
                    ChannelSocket::Connecting(_) => unreachable!(),
                };
                let registered = match &mut socket {
                    ChannelSocket::Listener(listener) => self.poller.register(
                        listener,
                        Token(ctx.index),
                        Interest::READABLE,
                    ),
                    ChannelSocket::Udp(udp) => {
                        self.poller.register(udp, Token(ctx.index), Interest::READABLE)
                    },
                    ChannelSocket::Connecting(_) => unreachable!(),
                };
                if let Err(err) = registered {
                    error!("[index: {}] register listener failed: {err}", ctx.index);
                    ctx.set_state(ChannelState::Closed);
                    let error = IoError::from_io(&err);
                    ctx.set_error(error);
                    self.inner.handle_event(IoEvent::connect_response(
                        ctx.index,
                        Some(error),
                        None,
                    ));
                    return;
                }
                *ctx.local_addr.lock() = local.as_ref().ok().copied();
                ctx.set_state(ChannelState::Opened);
                info!("[index: {}] listening at {local:?}...", ctx.index);
                let io = &mut self.chan_io[ctx.index];
                io.socket = Some(socket);
                io.readable = false;
                io.writable = false;
            },
            Err(err) => {
                error!(
                    "[index: {}] bind or listen failed, ec:{:?}, detail:{err}",
                    ctx.index,
                    err.raw_os_error()
                );
                let error = IoError::from_io(&err);
                ctx.set_state(ChannelState::Closed);
                ctx.set_error(error);
                self.inner.handle_event(IoEvent::connect_response(
                    ctx.index,
                    Some(error),
                    None,
                ));
            },
        }
    }

    /// Server OPENED: accept one pending client per tick; further
    /// backlog is picked up through outstanding work.
    fn do_accept(&mut self, ctx: &Arc<Channel>) {
        if !self.chan_io[ctx.index].readable {
            return;
        }
        let Some(socket) = self.chan_io[ctx.index].socket.take() else {
            return;
        };

        match socket {
            ChannelSocket::Listener(listener) => {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        self.outstanding_work += 1;
                        debug!("[index: {}] accepted client {peer}", ctx.index);
                        self.handle_connect_succeed(ctx, TransportSocket::Tcp(stream));
                    },
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.chan_io[ctx.index].readable = false;
                    },
                    Err(err) => {
                        warn!("[index: {}] accept failed: {err}", ctx.index);
                    },
                }
                self.chan_io[ctx.index].socket = Some(ChannelSocket::Listener(listener));
            },
            ChannelSocket::Udp(listener) => {
                match listener.recv_from(&mut self.datagram_buf) {
                    Ok((n, peer)) => {
                        self.outstanding_work += 1;
                        info!("udp-server: recvfrom peer: {peer}");
                        // A local -> peer session socket, just like a TCP
                        // accept; the triggering datagram rides along.
                        let local = *ctx.local_addr.lock();
                        match local
                            .ok_or_else(|| io::Error::other("no bound address"))
                            .and_then(|local| udp_session_socket(local, peer))
                        {
                            Ok(session) => {
                                if let Some(handle) = self.handle_connect_succeed(
                                    ctx,
                                    TransportSocket::Udp(session),
                                ) {
                                    let packet =
                                        Bytes::copy_from_slice(&self.datagram_buf[..n]);
                                    self.inner.handle_event(IoEvent::recv_packet(
                                        ctx.index, handle, packet,
                                    ));
                                }
                            },
                            Err(err) => {
                                warn!("udp-server: open session socket failed: {err}");
                            },
                        }
                    },
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.chan_io[ctx.index].readable = false;
                    },
                    Err(err) => {
                        warn!("[index: {}] recvfrom failed: {err}", ctx.index);
                    },
                }
                self.chan_io[ctx.index].socket = Some(ChannelSocket::Udp(listener));
            },
            other => self.chan_io[ctx.index].socket = Some(other),
        }
    }

    /// Spawns the transport for an established connection and reports
    /// CONNECT_RESPONSE(ok).
    fn handle_connect_succeed(
        &mut self,
        ctx: &Arc<Channel>,
        socket: TransportSocket,
    ) -> Option<TransportHandle> {
        ctx.clear_shutdown(ShutdownMask::TRANSPORT);
        if ctx.kind().is_client() {
            ctx.set_state(ChannelState::Opened);
        }

        if ctx.kind().is_tcp()
            && let Some(keepalive) = self.inner.options.lock().tcp_keepalive
            && let TransportSocket::Tcp(stream) = &socket
            && let Err(err) = apply_keepalive(stream, keepalive)
        {
            warn!("[index: {}] failed to apply tcp keepalive: {err}", ctx.index);
        }

        let local = socket.local_addr().ok();
        let peer = socket.peer_addr().ok();
        if ctx.kind().is_client() {
            *ctx.local_addr.lock() = local;
        }

        let (handle, shared) = self.inner.registry.insert(ctx.index);
        let mut transport = TransportIo {
            handle,
            shared,
            channel_index: ctx.index,
            socket,
            buf: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            offset: 0,
            expected_size: None,
            strip: 0,
            packet: BytesMut::new(),
            readable: false,
            writable: false,
            error: None,
        };

        let token = Token(TRANSPORT_TOKEN_BASE + handle.slot);
        let registered = match &mut transport.socket {
            TransportSocket::Tcp(stream) => self.poller.register(
                stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ),
            TransportSocket::Udp(udp) => self.poller.register(
                udp,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ),
        };
        if let Err(err) = registered {
            error!("[index: {}] register transport failed: {err}", ctx.index);
            self.inner.registry.remove(handle);
            self.handle_connect_failed(ctx, IoError::from_io(&err));
            return None;
        }

        self.transports.insert(handle.slot, transport);
        info!(
            "[index: {}] the connection [{local:?}] ---> {peer:?} is established",
            ctx.index
        );
        self.inner
            .handle_event(IoEvent::connect_response(ctx.index, None, Some(handle)));
        Some(handle)
    }

    fn handle_connect_failed(&mut self, ctx: &Arc<Channel>, error: IoError) {
        self.close_channel_socket(ctx.index);
        ctx.set_state(ChannelState::Closed);
        ctx.set_error(error);
        self.inner
            .handle_event(IoEvent::connect_response(ctx.index, Some(error), None));

        let (host, port) = {
            let cfg = ctx.cfg.lock();
            (cfg.host.clone(), cfg.port)
        };
        error!(
            "[index: {}] connect server {host}:{port} failed, detail:{error}",
            ctx.index
        );
    }

    fn close_channel_socket(&mut self, index: usize) {
        let socket = {
            let Some(io) = self.chan_io.get_mut(index) else {
                return;
            };
            io.connect_deadline = None;
            io.readable = false;
            io.writable = false;
            io.socket.take()
        };
        match socket {
            Some(ChannelSocket::Listener(mut listener)) => {
                self.poller.deregister(&mut listener);
            },
            Some(ChannelSocket::Udp(mut udp)) => self.poller.deregister(&mut udp),
            Some(ChannelSocket::Connecting(mut stream)) => {
                self.poller.deregister(&mut stream);
            },
            None => {},
        }
    }

    /// Kicks a detached resolve worker for a DIRTY channel; completion
    /// mutates the slot and interrupts the loop.
    fn start_resolve(&mut self, ctx: &Arc<Channel>) {
        if ctx.resolve.state() != ResolveState::Dirty {
            return;
        }
        ctx.resolve.set_state(ResolveState::InProgress);
        ctx.resolve.clear_endpoints();

        let (host, port) = {
            let cfg = ctx.cfg.lock();
            (cfg.host.clone(), cfg.port)
        };
        info!("[index: {}] start async resolving for {host}", ctx.index);

        let resolver = self.inner.resolve_fn.read().clone();
        let interrupter = self.interrupter.clone();
        let worker_ctx = ctx.clone();
        let spawned = thread::Builder::new()
            .name("iomux-resolve".into())
            .spawn(move || {
                let outcome = match &resolver {
                    Some(resolve) => resolve(&host, port)
                        .map_err(|_| IoError::ResolveHostFailed),
                    None => default_resolve(&host, port),
                };
                match outcome {
                    Ok(addrs) if !addrs.is_empty() => {
                        info!(
                            "[index: {}] resolve {host} succeed, ip:{}",
                            worker_ctx.index, addrs[0]
                        );
                        worker_ctx.resolve.complete_ok(addrs);
                    },
                    Ok(_) => {
                        warn!(
                            "[index: {}] resolve {host} returned no endpoints",
                            worker_ctx.index
                        );
                        worker_ctx.resolve.complete_failed(IoError::ResolveHostFailed);
                    },
                    Err(error) => {
                        warn!("[index: {}] resolve {host} failed: {error}", worker_ctx.index);
                        worker_ctx.resolve.complete_failed(error);
                    },
                }
                interrupter.interrupt();
            });
        if let Err(err) = spawned {
            error!("failed to spawn the resolve worker: {err}");
            ctx.resolve.complete_failed(IoError::ResolveHostFailed);
        }
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == io::ErrorKind::WouldBlock
}

fn is_fatal_poll_error(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EBADF) {
        return true;
    }
    let _ = err;
    false
}

fn udp_client_socket(endpoint: SocketAddr, local_port: u16) -> io::Result<UdpSocket> {
    let socket =
        Socket::new(Domain::for_address(endpoint), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    let local: SocketAddr = match endpoint {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, local_port).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, local_port).into(),
    };
    socket.bind(&local.into())?;
    socket.connect(&endpoint.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

fn tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn udp_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

/// Per-peer UDP session socket: bound to the listener's own address so
/// the peer keeps talking to the same port, then connected to the peer.
fn udp_session_socket(local: SocketAddr, peer: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&local.into())?;
    socket.connect(&peer.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

fn apply_keepalive(stream: &TcpStream, options: TcpKeepaliveOptions) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(options.idle.into()))
        .with_interval(Duration::from_secs(options.interval.into()));
    #[cfg(not(windows))]
    let keepalive = keepalive.with_retries(options.probes);
    #[cfg(windows)]
    let _ = options.probes;
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
