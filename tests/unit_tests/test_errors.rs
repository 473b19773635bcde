// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io;

use iomux::IoError;

#[test]
fn stable_display_strings() {
    assert_eq!(IoError::ConnectFailed.to_string(), "connect failed");
    assert_eq!(IoError::ConnectTimeout.to_string(), "connect timeout");
    assert_eq!(IoError::SendTimeout.to_string(), "send timeout");
    assert_eq!(IoError::ConnectionLost.to_string(), "the connection lost");
    assert_eq!(IoError::IllegalPdu.to_string(), "decode frame length failed");
    assert_eq!(IoError::ResolveHostFailed.to_string(), "resolve host failed");
    assert_eq!(IoError::Os(104).to_string(), "os error 104");
}

#[test]
fn io_error_mapping() {
    let err = io::Error::from(io::ErrorKind::TimedOut);
    assert_eq!(IoError::from_io(&err), IoError::ConnectTimeout);

    let err = io::Error::from(io::ErrorKind::ConnectionReset);
    assert_eq!(IoError::from_io(&err), IoError::ConnectionLost);

    let err = io::Error::from_raw_os_error(13);
    assert_eq!(IoError::from_io(&err), IoError::Os(13));
}
