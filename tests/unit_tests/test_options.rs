// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use iomux::ServiceOptions;

#[test]
fn defaults_are_sane() {
    let options = ServiceOptions::default();
    assert_eq!(options.connect_timeout, Duration::from_secs(10));
    assert_eq!(options.reconnect_timeout, None);
    assert!(options.deferred_event);
    assert!(options.tcp_keepalive.is_none());
    assert_eq!(options.framing.length_field_offset, -1, "framing off by default");
    assert!(options.validate().is_ok());
}

#[test]
fn yaml_round_trip() {
    let mut options = ServiceOptions::default();
    options.connect_timeout = Duration::from_millis(1500);
    options.reconnect_timeout = Some(Duration::from_millis(50));
    options.framing.length_field_offset = 0;
    options.framing.max_frame_length = 65536;

    let yaml = serde_yaml::to_string(&options).expect("serialize");
    let parsed: ServiceOptions = serde_yaml::from_str(&yaml).expect("parse");
    assert_eq!(parsed.connect_timeout, Duration::from_millis(1500));
    assert_eq!(parsed.reconnect_timeout, Some(Duration::from_millis(50)));
    assert_eq!(parsed.framing.max_frame_length, 65536);
}

#[test]
fn unknown_keys_are_ignored() {
    let yaml = "connect_timeout: 2000\nsome_future_option: true\n";
    let parsed: ServiceOptions = serde_yaml::from_str(yaml).expect("parse");
    assert_eq!(parsed.connect_timeout, Duration::from_secs(2));
    assert_eq!(parsed.send_timeout, ServiceOptions::default().send_timeout);
}

#[test]
fn absent_reconnect_means_disabled() {
    let parsed: ServiceOptions = serde_yaml::from_str("{}").expect("parse");
    assert_eq!(parsed.reconnect_timeout, None);
}

#[test]
fn validate_rejects_bad_field_width() {
    let mut options = ServiceOptions::default();
    options.framing.length_field_offset = 0;
    options.framing.length_field_length = 7;
    assert!(options.validate().is_err());
}
