// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static trace ring buffers for instrumenting drivers.
//!
//! A trace buffer is a fixed-size ring of `Copy + PartialEq` entries, each
//! tagged with the source line that recorded it. Recording the same payload
//! from the same line twice in a row bumps a counter on the existing entry
//! instead of consuming a slot, so a tight retry loop does not flush the
//! history around it.
//!
//! Buffers are declared with [`tracebuf!`] and fed with [`trace_entry!`]:
//!
//! ```
//! use tracebuf::{tracebuf, trace_entry};
//!
//! #[derive(Copy, Clone, PartialEq)]
//! enum Trace {
//!     None,
//!     Reset,
//!     Status(u8),
//! }
//!
//! tracebuf!(TRACE, Trace, 16, Trace::None);
//!
//! trace_entry!(TRACE, Trace::Status(0x42));
//! ```
//!
//! If you omit the name, both macros default to `__TRACEBUF`, which limits
//! you to one buffer per module.
//!
//! The backing storage is a `static` behind a spin lock, so entries can be
//! recorded from any context that can afford a short busy-wait; recording
//! never allocates. Enabling the `disabled` feature turns both macros into
//! no-ops without touching call sites.

#![cfg_attr(not(test), no_std)]

/// Re-exported so the macros can name it without requiring callers to
/// depend on `spin` themselves.
pub use spin::Mutex;

/// Declares a trace buffer in the current module.
///
/// `tracebuf!(NAME, Type, N, expr)` declares a static named `NAME` holding
/// a [`TraceBuf`] of `N` entries of type `Type`, each initialized to
/// `expr`. `NAME` should be uppercase; omitting it yields `__TRACEBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! tracebuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::Mutex<$crate::TraceBuf<$t, $n>> =
            $crate::Mutex::new($crate::TraceBuf {
                cursor: $n,
                entries: [$crate::TraceEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::tracebuf!(__TRACEBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! tracebuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {};
    ($t:ty, $n:expr, $init:expr) => {};
}

/// Records an entry into a buffer declared with [`tracebuf!`].
///
/// `trace_entry!(NAME, expr)` records `expr`; the single-argument form
/// targets `__TRACEBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! trace_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before taking the lock so that a payload
        // expression which itself records cannot deadlock.
        let (p, buf) = ($payload, &$buf);
        $crate::TraceBuf::record(&mut *buf.lock(), line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::trace_entry!(__TRACEBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! trace_entry {
    ($buf:expr, $payload:expr) => {};
    ($payload:expr) => {};
}

/// One slot of a [`TraceBuf`].
#[derive(Debug, Copy, Clone)]
pub struct TraceEntry<T: Copy + PartialEq> {
    /// Source line that recorded this entry.
    pub line: u16,
    /// Bumped each time the slot is rewritten; lets a debugger tell a
    /// fresh entry from a stale one at the same index.
    pub generation: u16,
    /// How many consecutive times this (line, payload) pair was recorded.
    pub count: u32,
    pub payload: T,
}

/// A ring of trace entries. Instantiating this directly is unusual; see
/// [`tracebuf!`]. The fields are public only so the macro can build the
/// initializer in a `static`.
#[derive(Debug)]
pub struct TraceBuf<T: Copy + PartialEq, const N: usize> {
    /// Index of the most recently written slot, or `N` when nothing has
    /// been recorded yet.
    pub cursor: usize,
    pub entries: [TraceEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> TraceBuf<T, N> {
    /// Records `payload` from source line `line`, collapsing an immediate
    /// repeat into the previous entry's count.
    pub fn record(&mut self, line: u16, payload: T) {
        let slot = if self.cursor >= N {
            0
        } else {
            let last = &mut self.entries[self.cursor];
            if last.line == line && last.payload == payload {
                if let Some(bumped) = last.count.checked_add(1) {
                    last.count = bumped;
                    return;
                }
                // Count saturated; fall through and take a fresh slot.
            }
            (self.cursor + 1) % N
        };

        let entry = &mut self.entries[slot];
        entry.line = line;
        entry.payload = payload;
        entry.count = 1;
        entry.generation = entry.generation.wrapping_add(1);
        self.cursor = slot;
    }

    /// The most recently recorded entry, if any.
    pub fn last(&self) -> Option<&TraceEntry<T>> {
        self.entries.get(self.cursor)
    }
}
