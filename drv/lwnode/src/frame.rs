// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Downlink frame parsing.
//!
//! A buffer read through the data registers holds one or more frames of
//! the shape
//!
//! ```text
//! "+RECV=" RSSI SNR LEN PAYLOAD[LEN] [CR LF]
//! ```
//!
//! where RSSI is the signal magnitude (the sign is restored here), SNR is
//! biased by 50, and the CR LF trailer is optional. [`frames`] walks such
//! a buffer and yields each decoded frame in order, stopping at the first
//! malformation.

use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::SNR_BIAS;

pub(crate) const RECV_PREFIX: &[u8] = b"+RECV=";

// Raw metadata between the marker and the payload.
//
// Note that this three-byte framing is distinct from the nine-byte
// metadata header on the reader path (`Lwnode::read_data`): both carry
// RSSI and SNR with the same sign/bias encoding, but at different
// offsets. They are two framings of the same link information.
#[derive(Copy, Clone, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct RecvHeader {
    rssi: u8,
    snr: u8,
    len: u8,
}

/// One decoded downlink frame, borrowing its payload from the buffer
/// under iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Received signal strength in dBm.
    pub rssi: i8,
    /// Signal-to-noise ratio in dB.
    pub snr: i8,
    pub payload: &'a [u8],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer position does not carry the `+RECV=` marker.
    BadPrefix,
    /// Buffer ends inside a frame's marker or metadata.
    TruncatedHeader,
    /// Frame's declared payload overruns the buffer.
    TruncatedPayload,
}

/// Iterates over the frames in `buf`.
///
/// The iterator ends cleanly after the last well-formed frame; a few
/// stray bytes shorter than a frame marker are tolerated after it. Any
/// other malformation, including a buffer with no frame at all, yields
/// one `Err` and then ends. A buffer passes validation as a whole exactly
/// when the iterator produced at least one item and no `Err`.
pub fn frames(buf: &[u8]) -> Frames<'_> {
    Frames {
        rest: buf,
        consumed_any: false,
        done: false,
    }
}

pub struct Frames<'a> {
    rest: &'a [u8],
    consumed_any: bool,
    done: bool,
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<Frame<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.rest.len() < RECV_PREFIX.len() {
            self.done = true;
            if self.consumed_any {
                // Sub-marker residue after a good frame; clean end.
                return None;
            }
            return Some(Err(FrameError::TruncatedHeader));
        }

        let (marker, after) = self.rest.split_at(RECV_PREFIX.len());
        if marker != RECV_PREFIX {
            self.done = true;
            return Some(Err(FrameError::BadPrefix));
        }

        let (header, after) = match RecvHeader::read_from_prefix(after) {
            Ok(decoded) => decoded,
            Err(_) => {
                self.done = true;
                return Some(Err(FrameError::TruncatedHeader));
            }
        };

        if after.len() < usize::from(header.len) {
            self.done = true;
            return Some(Err(FrameError::TruncatedPayload));
        }
        let (payload, mut tail) = after.split_at(usize::from(header.len));

        if tail.len() >= 2 && tail[0] == b'\r' {
            tail = &tail[2..];
        }

        self.rest = tail;
        self.consumed_any = true;
        Some(Ok(Frame {
            rssi: (header.rssi as i8).wrapping_neg(),
            snr: (header.snr as i8).wrapping_sub(SNR_BIAS),
            payload,
        }))
    }
}
