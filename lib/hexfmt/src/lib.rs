// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Uppercase-hex rendering and parsing helpers.
//!
//! Command protocols that carry binary payloads as ASCII want the same
//! few operations over and over: render bytes as uppercase hex, parse hex
//! back into bytes, and normalize caller-supplied hex strings to the
//! canonical uppercase form. These helpers do that with caller-provided
//! storage and no allocation.

#![cfg_attr(not(test), no_std)]

use heapless::String;

const DIGITS: &[u8; 16] = b"0123456789ABCDEF";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HexError {
    /// Destination cannot hold the rendering.
    Overflow,
    /// Input byte at this offset is not a hex digit.
    BadDigit { at: usize },
    /// Hex input does not pair up into whole bytes.
    OddLength,
}

/// Appends `src` to `dst` as uppercase hex, two digits per byte.
pub fn push_hex_upper<const N: usize>(
    dst: &mut String<N>,
    src: &[u8],
) -> Result<(), HexError> {
    for &byte in src {
        dst.push(char::from(DIGITS[usize::from(byte >> 4)]))
            .map_err(|_| HexError::Overflow)?;
        dst.push(char::from(DIGITS[usize::from(byte & 0xf)]))
            .map_err(|_| HexError::Overflow)?;
    }
    Ok(())
}

/// Parses hex digits (either case) into `out`, returning the number of
/// bytes written.
pub fn decode(src: &str, out: &mut [u8]) -> Result<usize, HexError> {
    let src = src.as_bytes();
    if src.len() % 2 != 0 {
        return Err(HexError::OddLength);
    }

    let n = src.len() / 2;
    if n > out.len() {
        return Err(HexError::Overflow);
    }

    for (i, pair) in src.chunks_exact(2).enumerate() {
        let hi = digit_value(pair[0]).ok_or(HexError::BadDigit { at: 2 * i })?;
        let lo =
            digit_value(pair[1]).ok_or(HexError::BadDigit { at: 2 * i + 1 })?;
        out[i] = hi << 4 | lo;
    }
    Ok(n)
}

/// Copies `src` into a fixed-capacity string, uppercasing as it goes and
/// rejecting anything that is not a hex digit.
pub fn normalize<const N: usize>(src: &str) -> Result<String<N>, HexError> {
    let mut out = String::new();
    for (at, byte) in src.bytes().enumerate() {
        if !byte.is_ascii_hexdigit() {
            return Err(HexError::BadDigit { at });
        }
        out.push(char::from(byte.to_ascii_uppercase()))
            .map_err(|_| HexError::Overflow)?;
    }
    Ok(out)
}

fn digit_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}
