// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// A remote or local endpoint as the user writes it: a host name or IP
/// literal plus a port. Resolution to socket addresses happens lazily,
/// per channel.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

/// Length-prefix framing rule applied to every transport.
///
/// The length field is read at `length_field_offset`, spans
/// `length_field_length` bytes big-endian, and `length_adjustment` is
/// added to the parsed value to yield the total frame size (prefix
/// included). Totals above `max_frame_length` are a protocol violation
/// and close the transport. A negative offset disables framing: each
/// read is delivered as one PDU.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct LengthFieldParams {
    pub max_frame_length: u32,
    pub length_field_offset: i32,
    pub length_field_length: usize,
    pub length_adjustment: i32,
}

impl Default for LengthFieldParams {
    fn default() -> Self {
        Self {
            max_frame_length: 1 << 20,
            length_field_offset: -1,
            length_field_length: 4,
            length_adjustment: 0,
        }
    }
}

/// TCP keepalive knobs, applied to every established TCP transport.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpKeepaliveOptions {
    /// Seconds of idle time before the first probe.
    pub idle: u32,
    /// Seconds between probes.
    pub interval: u32,
    /// Probes sent before the connection is declared dead.
    pub probes: u32,
}

/// Runtime parameters of the I/O service.
///
/// The record is serde-friendly so deployments can keep it in YAML next
/// to the logger configuration; unknown keys are ignored for forward
/// compatibility. All of it can also be built in code and handed to
/// [`IoService::set_options`](crate::service::IoService::set_options)
/// before the service starts.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ServiceOptions {
    /// How long a non-blocking connect may stay in flight.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Per-PDU deadline: an outbound packet still queued past this is
    /// dropped.
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,
    /// Delay before a lost TCP client connection is reopened; `None`
    /// disables automatic reconnection.
    #[serde(with = "duration_ms_opt")]
    pub reconnect_timeout: Option<Duration>,
    /// Age after which a cached name resolution is considered stale.
    #[serde(with = "duration_ms")]
    pub dns_cache_timeout: Duration,
    /// Queue events for [`dispatch_events`] instead of invoking the
    /// callback from the loop thread.
    ///
    /// [`dispatch_events`]: crate::service::IoService::dispatch_events
    pub deferred_event: bool,
    pub tcp_keepalive: Option<TcpKeepaliveOptions>,
    pub framing: LengthFieldParams,
    /// Run the event loop on the caller's thread inside `start_service`
    /// instead of spawning a worker. Forces `deferred_event` off.
    pub no_worker_thread: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            reconnect_timeout: None,
            dns_cache_timeout: Duration::from_secs(600),
            deferred_event: true,
            tcp_keepalive: None,
            framing: LengthFieldParams::default(),
            no_worker_thread: false,
        }
    }
}

impl ServiceOptions {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read options file: {path:?}"))?;
        let options: ServiceOptions = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse options file: {path:?}"))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let framing = &self.framing;
        if framing.length_field_offset >= 0 {
            ensure!(
                (1..=4).contains(&framing.length_field_length),
                "length_field_length must be 1..=4, got {}",
                framing.length_field_length
            );
            ensure!(
                framing.max_frame_length > 0,
                "max_frame_length must be positive"
            );
        }
        Ok(())
    }
}

/// Serde helpers representing `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Same as [`duration_ms`] for optional durations; `null` or an absent
/// key means disabled.
pub mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}
