// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cfg;
pub mod channel;
pub mod errors;
pub mod event;
pub mod framing;
pub mod resolver;
pub mod service;
pub mod timer;

pub(crate) mod poller;
pub(crate) mod transport;

pub use crate::{
    cfg::config::{HostPort, LengthFieldParams, ServiceOptions, TcpKeepaliveOptions},
    channel::{ChannelKind, ChannelState},
    errors::IoError,
    event::{EventKind, IoEvent, TransportHandle},
    framing::FrameHint,
    service::IoService,
    timer::DeadlineTimer,
};
