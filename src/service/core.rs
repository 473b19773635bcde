// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::{
    cfg::config::{HostPort, LengthFieldParams, ServiceOptions, TcpKeepaliveOptions},
    channel::{Channel, ChannelKind, ChannelState, ShutdownMask},
    event::{EventDispatcher, IoEvent, TransportHandle},
    framing::{DecodeLengthFn, FrameHint},
    poller::{Interrupter, Poller},
    resolver::ResolveFn,
    service::reactor::Reactor,
    timer::{TimerEntry, TimerQueue},
    transport::{OutPdu, TransportRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ServiceState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServiceState::Running,
            2 => ServiceState::Stopping,
            3 => ServiceState::Stopped,
            _ => ServiceState::Idle,
        }
    }
}

/// State shared between the public API, the event loop and background
/// workers. Each structure an external thread may touch has its own
/// lock, and every mutation ends with an interrupt so the loop observes
/// it promptly.
pub(crate) struct Inner {
    state: AtomicU8,
    pub options: Mutex<ServiceOptions>,
    pub channels: RwLock<Vec<Arc<Channel>>>,
    /// Indexes of channels whose state machine the loop must advance.
    pub active: Mutex<Vec<usize>>,
    pub timers: TimerQueue,
    pub dispatcher: EventDispatcher,
    pub registry: TransportRegistry,
    pub interrupter: RwLock<Option<Arc<Interrupter>>>,
    pub resolve_fn: RwLock<Option<Arc<ResolveFn>>>,
    pub decode_fn: RwLock<Option<Arc<DecodeLengthFn>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    worker_id: Mutex<Option<thread::ThreadId>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ServiceState::Idle as u8),
            options: Mutex::new(ServiceOptions::default()),
            channels: RwLock::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            timers: TimerQueue::default(),
            dispatcher: EventDispatcher::new(),
            registry: TransportRegistry::new(),
            interrupter: RwLock::new(None),
            resolve_fn: RwLock::new(None),
            decode_fn: RwLock::new(None),
            worker: Mutex::new(None),
            worker_id: Mutex::new(None),
        }
    }

    pub fn service_state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_service_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn interrupt(&self) {
        let interrupter = self.interrupter.read().clone();
        if let Some(interrupter) = interrupter {
            interrupter.interrupt();
        }
    }

    pub fn channel(&self, index: usize) -> Option<Arc<Channel>> {
        self.channels.read().get(index).cloned()
    }

    pub fn handle_event(&self, event: IoEvent) {
        self.dispatcher.handle(event);
    }

    pub fn schedule_timer(&self, entry: &Arc<TimerEntry>) {
        if self.timers.schedule(entry) {
            self.interrupt();
        }
    }

    pub fn cancel_timer(&self, entry: &Arc<TimerEntry>) {
        self.timers.cancel(entry);
    }

    /// Puts a channel back on the open path. Safe from any thread and
    /// from event/timer callbacks: it only touches shared structures.
    pub fn open_internal(&self, ctx: &Arc<Channel>) {
        match ctx.state() {
            ChannelState::RequestOpen | ChannelState::Opening => {
                info!("[index: {}] the channel is in opening!", ctx.index);
                return;
            },
            _ => {},
        }

        if ctx.resolve.state() != crate::resolver::ResolveState::Ready {
            let (host, port) = {
                let cfg = ctx.cfg.lock();
                (cfg.host.clone(), cfg.port)
            };
            ctx.resolve.assign(&host, port);
        }

        ctx.set_state(ChannelState::RequestOpen);
        self.close_internal(ctx);

        {
            let mut active = self.active.lock();
            if !active.contains(&ctx.index) {
                active.push(ctx.index);
            }
        }
        self.interrupt();
    }

    /// Posts a half-close request; the loop performs the actual socket
    /// teardown.
    pub fn close_internal(&self, ctx: &Channel) {
        if ctx.kind().is_client() {
            ctx.request_shutdown(ShutdownMask::TRANSPORT);
        } else {
            ctx.request_shutdown(ShutdownMask::CHANNEL);
        }
    }

    fn wait_service(&self) {
        let on_loop_thread =
            matches!(*self.worker_id.lock(), Some(id) if id == thread::current().id());
        if on_loop_thread {
            // EAGAIN in spirit: joining here would deadlock.
            warn!("stop_service called from the event-loop thread; skipping join");
            return;
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("the event-loop thread panicked");
            }
            self.set_service_state(ServiceState::Stopped);
            self.cleanup();
        }
    }

    pub fn cleanup(&self) {
        if self.service_state() != ServiceState::Stopped {
            return;
        }
        self.registry.clear();
        self.channels.write().clear();
        self.active.lock().clear();
        self.timers.clear();
        self.dispatcher.clear();
        *self.interrupter.write() = None;
        *self.worker_id.lock() = None;
        self.set_service_state(ServiceState::Idle);
    }
}

/// The I/O service: a set of channels driven by one reactor thread.
///
/// All entry points are fire-and-forget and callable from any thread;
/// failures surface through the event callback and the log, never as
/// return values.
pub struct IoService {
    inner: Arc<Inner>,
}

impl Default for IoService {
    fn default() -> Self {
        Self::new()
    }
}

impl IoService {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner::new()) }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Creates one channel per endpoint and starts the event loop, on a
    /// worker thread by default or inline when `no_worker_thread` is set
    /// (in which case this call returns only after `stop_service`).
    pub fn start_service<F>(&self, channel_endpoints: &[HostPort], on_event: F)
    where F: Fn(IoEvent) + Send + Sync + 'static {
        let inner = &self.inner;
        if inner.service_state() != ServiceState::Idle {
            warn!("start_service ignored: the service is already running");
            return;
        }
        if channel_endpoints.is_empty() {
            warn!("start_service ignored: no channel endpoints");
            return;
        }

        let options = inner.options.lock().clone();

        let poller = match Poller::new() {
            Ok(poller) => poller,
            Err(err) => {
                error!("failed to create the readiness poller: {err}");
                return;
            },
        };
        let interrupter = match Interrupter::new(poller.registry()) {
            Ok(interrupter) => Arc::new(interrupter),
            Err(err) => {
                error!("failed to create the interrupter: {err}");
                return;
            },
        };
        *inner.interrupter.write() = Some(interrupter.clone());

        inner.dispatcher.set_callback(Arc::new(on_event));
        inner
            .dispatcher
            .set_deferred(options.deferred_event && !options.no_worker_thread);

        {
            let mut channels = inner.channels.write();
            channels.clear();
            for (index, endpoint) in channel_endpoints.iter().enumerate() {
                channels.push(Arc::new(Channel::new(
                    index,
                    &endpoint.host,
                    endpoint.port,
                )));
            }
        }

        inner.set_service_state(ServiceState::Running);

        if options.no_worker_thread {
            *inner.worker_id.lock() = Some(thread::current().id());
            Reactor::new(inner.clone(), poller, interrupter).run();
            inner.set_service_state(ServiceState::Stopped);
            inner.cleanup();
        } else {
            let loop_inner = inner.clone();
            let spawned = thread::Builder::new()
                .name("iomux-evloop".into())
                .spawn(move || Reactor::new(loop_inner, poller, interrupter).run());
            match spawned {
                Ok(handle) => {
                    *inner.worker_id.lock() = Some(handle.thread().id());
                    *inner.worker.lock() = Some(handle);
                },
                Err(err) => {
                    error!("failed to spawn the event-loop thread: {err}");
                    inner.set_service_state(ServiceState::Stopped);
                    inner.cleanup();
                },
            }
        }
    }

    /// Stops the loop and releases every channel and transport.
    /// Idempotent; returns once the loop has exited, unless called from
    /// the loop thread itself.
    pub fn stop_service(&self) {
        match self.inner.service_state() {
            ServiceState::Running => {
                self.inner.set_service_state(ServiceState::Stopping);
                let channels: Vec<Arc<Channel>> =
                    self.inner.channels.read().clone();
                for ctx in &channels {
                    self.inner.close_internal(ctx);
                }
                self.inner.interrupt();
                self.inner.wait_service();
            },
            ServiceState::Stopping => self.inner.wait_service(),
            _ => {},
        }
    }

    /// Opens `channel_index` with the given role. Invalid role masks are
    /// logged and ignored; `UDP_SERVER` is unsupported on Windows.
    pub fn open(&self, channel_index: usize, kind: ChannelKind) {
        if !kind.is_valid() {
            error!("[index: {channel_index}] invalid channel kind {kind:?}");
            return;
        }
        if cfg!(windows) && kind == ChannelKind::UDP_SERVER {
            error!(
                "[index: {channel_index}] UDP_SERVER is not supported with the \
                 Winsock provider, use UDP_CLIENT to communicate with the peer"
            );
            return;
        }
        let Some(ctx) = self.inner.channel(channel_index) else {
            return;
        };
        ctx.set_kind(kind);
        self.inner.open_internal(&ctx);
    }

    /// Gracefully closes a channel; any live transport of that channel
    /// goes down with a `ConnectionLost` event.
    pub fn close(&self, channel_index: usize) {
        let Some(ctx) = self.inner.channel(channel_index) else {
            return;
        };
        if ctx.state() != ChannelState::Closed {
            ctx.set_state(ChannelState::Closed);
            self.inner.close_internal(&ctx);
            self.inner.interrupt();
        }
    }

    /// Gracefully closes one transport. For TCP the loop shuts the
    /// socket down before destroying it.
    pub fn close_transport(&self, transport: TransportHandle) {
        let Some(shared) = self.inner.registry.get(transport) else {
            return;
        };
        if shared.shutdown_mask().is_empty() {
            info!("close the transport {transport:?}");
            shared.request_shutdown(ShutdownMask::TRANSPORT);
            self.inner.interrupt();
        }
    }

    pub fn is_open(&self, channel_index: usize) -> bool {
        self.inner
            .channel(channel_index)
            .map(|ctx| ctx.state() == ChannelState::Opened)
            .unwrap_or(false)
    }

    /// The locally bound address of an opened channel; the way to learn
    /// a system-assigned listening port.
    pub fn local_endpoint(&self, channel_index: usize) -> Option<SocketAddr> {
        self.inner
            .channel(channel_index)
            .and_then(|ctx| *ctx.local_addr.lock())
    }

    /// Queues `data` on the transport. No result: a dead handle is
    /// logged, transport failures surface later as `ConnectionLost`.
    pub fn write(&self, transport: TransportHandle, data: impl Into<Bytes>) {
        let Some(shared) = self.inner.registry.get(transport) else {
            warn!("[transport: {transport:?}] send failed, the connection not ok!");
            return;
        };
        let timeout = self.inner.options.lock().send_timeout;
        shared
            .send_queue
            .lock()
            .push_back(OutPdu::new(data.into(), timeout));
        self.inner.interrupt();
    }

    /// Pulls at most `count` deferred events, invoking the event
    /// callback for each on the caller's thread.
    pub fn dispatch_events(&self, count: usize) -> usize {
        self.inner.dispatcher.dispatch(count)
    }

    /// Wakes the readiness wait.
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    pub fn set_options(&self, options: ServiceOptions) {
        *self.inner.options.lock() = options;
    }

    pub fn options(&self) -> ServiceOptions {
        self.inner.options.lock().clone()
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.inner.options.lock().connect_timeout = timeout;
    }

    pub fn set_send_timeout(&self, timeout: Duration) {
        self.inner.options.lock().send_timeout = timeout;
    }

    /// `None` disables automatic reconnection of TCP client channels.
    pub fn set_reconnect_timeout(&self, timeout: Option<Duration>) {
        self.inner.options.lock().reconnect_timeout = timeout;
    }

    pub fn set_dns_cache_timeout(&self, timeout: Duration) {
        self.inner.options.lock().dns_cache_timeout = timeout;
    }

    pub fn set_deferred_event(&self, deferred: bool) {
        self.inner.options.lock().deferred_event = deferred;
        self.inner.dispatcher.set_deferred(deferred);
    }

    pub fn set_tcp_keepalive(&self, keepalive: Option<TcpKeepaliveOptions>) {
        self.inner.options.lock().tcp_keepalive = keepalive;
    }

    pub fn set_framing(&self, framing: LengthFieldParams) {
        self.inner.options.lock().framing = framing;
    }

    /// Points `channel_index` at a new remote endpoint; takes effect on
    /// the next open.
    pub fn set_channel_endpoint(&self, channel_index: usize, host: &str, port: u16) {
        let Some(ctx) = self.inner.channel(channel_index) else {
            return;
        };
        {
            let mut cfg = ctx.cfg.lock();
            cfg.host = host.to_string();
            cfg.port = port;
        }
        ctx.resolve.assign(host, port);
    }

    pub fn set_channel_local_port(&self, channel_index: usize, local_port: u16) {
        if let Some(ctx) = self.inner.channel(channel_index) {
            ctx.cfg.lock().local_port = local_port;
        }
    }

    /// Replaces the built-in resolver (`getaddrinfo`).
    pub fn set_resolve_fn<F>(&self, resolve: F)
    where F: Fn(&str, u16) -> std::io::Result<Vec<SocketAddr>> + Send + Sync + 'static
    {
        *self.inner.resolve_fn.write() = Some(Arc::new(resolve));
    }

    /// Replaces the built-in length-prefix decoder. Frames produced by a
    /// custom decoder are delivered whole, header included.
    pub fn set_decode_frame_length_fn<F>(&self, decode: F)
    where F: Fn(&[u8]) -> FrameHint + Send + Sync + 'static {
        *self.inner.decode_fn.write() = Some(Arc::new(decode));
    }
}

impl Drop for IoService {
    fn drop(&mut self) {
        self.stop_service();
    }
}
