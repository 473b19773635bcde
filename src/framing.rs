// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::cfg::config::LengthFieldParams;

/// Cap for pre-reserving a PDU accumulator, so a hostile length field
/// cannot force a huge allocation before any payload arrives.
pub const MAX_PDU_RESERVE: usize = 1 << 20;

/// Outcome of probing the head of the inbound buffer for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHint {
    /// A complete frame header was decoded; the value is the total frame
    /// size in bytes, length field included.
    Frame(usize),
    /// Not enough bytes buffered to decode the length field yet.
    Partial,
    /// The length field is malformed or exceeds `max_frame_length`.
    Invalid,
}

/// Signature for a user-supplied frame-length decoder. The decoder is pure:
/// it sees the buffered head of the stream and reports the total size of
/// the first frame, if determinable.
pub type DecodeLengthFn = dyn Fn(&[u8]) -> FrameHint + Send + Sync;

/// Decodes the total length of the frame at the head of `buf` using the
/// built-in length-prefix rule.
///
/// The length field sits at `length_field_offset`, is
/// `length_field_length` bytes wide, big-endian (a 3-byte field occupies
/// the top 24 bits of a 32-bit big-endian read), and
/// `length_adjustment` is added to the parsed value to produce the total
/// frame size. A negative `length_field_offset` disables framing: the
/// whole buffered read is one frame.
pub fn decode_frame_length(params: &LengthFieldParams, buf: &[u8]) -> FrameHint {
    if params.length_field_offset < 0 {
        return FrameHint::Frame(buf.len());
    }

    let offset = params.length_field_offset as usize;
    let width = params.length_field_length;
    if !(1..=4).contains(&width) {
        return FrameHint::Invalid;
    }
    if buf.len() < offset + width {
        return FrameHint::Partial;
    }

    let field = &buf[offset..offset + width];
    let mut raw: u32 = 0;
    for &b in field {
        raw = (raw << 8) | u32::from(b);
    }

    let total = i64::from(raw) + i64::from(params.length_adjustment);
    // A frame that cannot even contain its own prefix would never advance
    // the stream.
    if total < (offset + width) as i64 || total > i64::from(params.max_frame_length) {
        return FrameHint::Invalid;
    }

    FrameHint::Frame(total as usize)
}

/// Number of leading bytes stripped from a decoded frame before it is
/// surfaced as a PDU: everything up to and including the length field.
pub fn prefix_len(params: &LengthFieldParams) -> usize {
    if params.length_field_offset < 0 {
        0
    } else {
        params.length_field_offset as usize + params.length_field_length
    }
}
