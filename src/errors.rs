// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io;

use thiserror::Error;

/// Stable error kinds surfaced through [`IoEvent`](crate::event::IoEvent)
/// and the log. Operating-system errors that have no dedicated kind are
/// passed through as [`IoError::Os`] with their raw code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("connect failed")]
    ConnectFailed,
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("send failed")]
    SendFailed,
    #[error("send timeout")]
    SendTimeout,
    #[error("recv failed")]
    RecvFailed,
    #[error("the network unreachable")]
    NetworkUnreachable,
    #[error("the connection lost")]
    ConnectionLost,
    /// Frame-length decoding rejected the inbound byte stream.
    #[error("decode frame length failed")]
    IllegalPdu,
    #[error("resolve host failed")]
    ResolveHostFailed,
    #[error("resolve host timeout")]
    ResolveHostTimeout,
    #[error("resolve host ipv6 required")]
    ResolveHostIpv6Required,
    /// The local side requested the shutdown.
    #[error("shutdown by local request")]
    Shutdown,
    #[error("os error {0}")]
    Os(i32),
}

impl IoError {
    /// Maps an `io::Error` onto a stable kind, keeping the raw OS code
    /// where one exists.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => IoError::ConnectTimeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => IoError::ConnectionLost,
            io::ErrorKind::NetworkUnreachable => IoError::NetworkUnreachable,
            _ => match err.raw_os_error() {
                Some(code) => IoError::Os(code),
                None => IoError::ConnectFailed,
            },
        }
    }
}
