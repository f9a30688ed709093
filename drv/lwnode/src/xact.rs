// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The AT transaction engine: one command in, one acknowledgment out.
//!
//! The module cannot absorb a command line in one bus transfer, so the
//! CRLF-framed line goes out in 30-byte chunks: every chunk but the last
//! through [`Register::WriteAtLong`], the last through
//! [`Register::WriteAt`], which is what tells the module the line is
//! complete. The module then needs time to run the command, so the engine
//! settles, polls the pending-acknowledgment length until it is
//! plausible, and reads the acknowledgment back in chunks.
//!
//! While a transaction owns the bus the receive gate is closed, so an
//! outer poll loop does not issue data reads against a module that is
//! mid-command. The gate reopens on every exit path.

use drv_lwnode_api::{LwnodeBus, Register, MAX_TRANSFER};
use heapless::Vec;
use tracebuf::trace_entry;

use crate::{Lwnode, LwnodeError, Trace, MAX_ACK_LEN, MAX_CMD_LEN, TRACE};

/// Settle time between the final command chunk and the first
/// acknowledgment poll.
const POST_WRITE_DELAY_MS: u32 = 800;
/// Delay between long-register chunks.
const CHUNK_DELAY_MS: u32 = 100;
/// Acknowledgment poll cadence and budget.
const ACK_POLL_DELAY_MS: u32 = 1;
const ACK_POLL_ATTEMPTS: u32 = 250;

impl<B: LwnodeBus> Lwnode<'_, B> {
    /// Runs one AT transaction and returns the acknowledgment bytes.
    ///
    /// `cmd` goes out as `cmd || CR || LF`; it must be non-empty and fit
    /// the staging buffer with the terminator applied.
    pub(crate) fn send_at_cmd(
        &mut self,
        cmd: &str,
    ) -> Result<&[u8], LwnodeError> {
        if cmd.is_empty() || cmd.len() + 2 > MAX_CMD_LEN {
            return Err(LwnodeError::BadCommandLength { len: cmd.len() });
        }

        let mut tx: Vec<u8, MAX_CMD_LEN> = Vec::new();
        if tx.extend_from_slice(cmd.as_bytes()).is_err()
            || tx.extend_from_slice(b"\r\n").is_err()
        {
            return Err(LwnodeError::BadCommandLength { len: cmd.len() });
        }

        trace_entry!(TRACE, Trace::Command { len: tx.len() as u16 });

        let len = self.with_rx_gated(|node| {
            node.write_at_bytes(&tx)?;
            node.bus.sleep_ms(POST_WRITE_DELAY_MS);
            node.read_ack_with_yield()
        })?;

        Ok(&self.rx_buf[..len])
    }

    /// Closes the receive gate around `body` and reopens it on every exit
    /// path.
    fn with_rx_gated<R>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<R, LwnodeError>,
    ) -> Result<R, LwnodeError> {
        self.int_enabled = false;
        let result = body(self);
        self.int_enabled = true;
        result
    }

    fn write_at_bytes(&mut self, data: &[u8]) -> Result<(), LwnodeError> {
        let mut rest = data;
        while rest.len() > MAX_TRANSFER {
            let (chunk, tail) = rest.split_at(MAX_TRANSFER);
            self.bus_write(Register::WriteAtLong, chunk)?;
            self.bus.sleep_ms(CHUNK_DELAY_MS);
            rest = tail;
        }
        // 1..=30 bytes left, exact multiples of 30 included: the final
        // chunk always goes through the final-write register.
        self.bus_write(Register::WriteAt, rest)
    }

    /// Polls the pending-acknowledgment length, yielding between
    /// attempts, then pulls the acknowledgment into the receive scratch.
    /// Lengths of zero (nothing yet) and beyond [`MAX_ACK_LEN`] (the
    /// module is still assembling the line) both mean "not ready".
    fn read_ack_with_yield(&mut self) -> Result<usize, LwnodeError> {
        for _ in 0..ACK_POLL_ATTEMPTS {
            let pending = self.bus_read_byte(Register::ReadAtLen)?;
            let len = usize::from(pending);
            if len == 0 || len > MAX_ACK_LEN {
                self.bus.sleep_ms(ACK_POLL_DELAY_MS);
                continue;
            }

            self.read_chunked(Register::ReadAt, len)?;
            trace_entry!(TRACE, Trace::Ack { len: pending });
            return Ok(len);
        }

        trace_entry!(TRACE, Trace::AckTimeout);
        Err(LwnodeError::AckTimeout)
    }

    /// Reads `len` bytes into the receive scratch in bus-sized chunks.
    pub(crate) fn read_chunked(
        &mut self,
        reg: Register,
        len: usize,
    ) -> Result<(), LwnodeError> {
        let Self { bus, rx_buf, .. } = self;
        for chunk in rx_buf[..len].chunks_mut(MAX_TRANSFER) {
            if bus.read(reg, chunk).is_err() {
                trace_entry!(TRACE, Trace::ReadFault(reg));
                return Err(LwnodeError::ReadFault { reg });
            }
        }
        Ok(())
    }

    fn bus_write(
        &mut self,
        reg: Register,
        data: &[u8],
    ) -> Result<(), LwnodeError> {
        self.bus.write(reg, data).map_err(|_| {
            trace_entry!(TRACE, Trace::WriteFault(reg));
            LwnodeError::WriteFault { reg }
        })
    }

    pub(crate) fn bus_read_byte(
        &mut self,
        reg: Register,
    ) -> Result<u8, LwnodeError> {
        let mut byte = [0u8];
        self.bus.read(reg, &mut byte).map_err(|_| {
            trace_entry!(TRACE, Trace::ReadFault(reg));
            LwnodeError::ReadFault { reg }
        })?;
        Ok(byte[0])
    }
}
