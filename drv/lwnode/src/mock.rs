// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A recording bus for driving the driver in tests.
//!
//! The mock keeps a single ordered log of every bus operation so tests
//! can assert on interleavings (chunk, sleep, chunk), not just totals.
//! Scripted acknowledgments are armed one per completed command write;
//! scripted downlinks are served through the data registers on demand.
//! All state lives in the instance.

use std::collections::VecDeque;

use drv_lwnode_api::{BusFault, LwnodeBus, Register};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusOp {
    Write(Register, Vec<u8>),
    /// A read of this many bytes.
    Read(Register, usize),
    Sleep(u32),
}

#[derive(Default)]
pub struct MockBus {
    /// Every operation the driver issued, in order.
    pub log: Vec<BusOp>,
    /// Acknowledgments to hand out, one per command.
    pub acks: VecDeque<Vec<u8>>,
    /// How many times the length register reads zero before each armed
    /// acknowledgment becomes visible.
    pub ack_delay_polls: u32,
    /// Downlink buffers to hand out through the data registers.
    pub downlinks: VecDeque<Vec<u8>>,
    /// Fault injection.
    pub fail_writes: bool,
    pub fail_reads: bool,

    pending_ack: Option<Vec<u8>>,
    ack_offset: usize,
    polls_left: u32,
    pending_data: Option<Vec<u8>>,
    data_offset: usize,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_ack(&mut self, ack: &[u8]) {
        self.acks.push_back(ack.to_vec());
    }

    pub fn script_acks(&mut self, acks: &[&[u8]]) {
        for ack in acks {
            self.script_ack(ack);
        }
    }

    pub fn script_downlink(&mut self, data: &[u8]) {
        self.downlinks.push_back(data.to_vec());
    }

    /// Every write the driver issued, in order.
    pub fn writes(&self) -> Vec<(Register, Vec<u8>)> {
        self.log
            .iter()
            .filter_map(|op| match op {
                BusOp::Write(reg, bytes) => Some((*reg, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    /// Command lines reassembled from the chunk stream: long-register
    /// chunks accumulate until a final-register chunk completes the line.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut current = Vec::new();
        for op in &self.log {
            match op {
                BusOp::Write(Register::WriteAtLong, bytes) => {
                    current.extend_from_slice(bytes);
                }
                BusOp::Write(Register::WriteAt, bytes) => {
                    current.extend_from_slice(bytes);
                    lines.push(std::mem::take(&mut current));
                }
                _ => {}
            }
        }
        lines
    }

    fn arm_next_ack(&mut self) {
        self.pending_ack = self.acks.pop_front();
        self.ack_offset = 0;
        self.polls_left = self.ack_delay_polls;
    }
}

impl LwnodeBus for MockBus {
    fn write(&mut self, reg: Register, data: &[u8]) -> Result<(), BusFault> {
        self.log.push(BusOp::Write(reg, data.to_vec()));
        if self.fail_writes {
            return Err(BusFault);
        }
        if reg == Register::WriteAt {
            self.arm_next_ack();
        }
        Ok(())
    }

    fn read(&mut self, reg: Register, out: &mut [u8]) -> Result<(), BusFault> {
        self.log.push(BusOp::Read(reg, out.len()));
        if self.fail_reads {
            return Err(BusFault);
        }

        match reg {
            Register::ReadAtLen => {
                out[0] = if self.polls_left > 0 {
                    self.polls_left -= 1;
                    0
                } else {
                    self.pending_ack
                        .as_ref()
                        .map_or(0, |ack| ack.len() as u8)
                };
            }
            Register::ReadAt => {
                let end = self.ack_offset + out.len();
                let done = {
                    let ack = self.pending_ack.as_ref().ok_or(BusFault)?;
                    if end > ack.len() {
                        return Err(BusFault);
                    }
                    out.copy_from_slice(&ack[self.ack_offset..end]);
                    end == ack.len()
                };
                self.ack_offset = end;
                if done {
                    self.pending_ack = None;
                }
            }
            Register::ReadDataLen => {
                if self.pending_data.is_none() {
                    self.pending_data = self.downlinks.pop_front();
                    self.data_offset = 0;
                }
                out[0] = self
                    .pending_data
                    .as_ref()
                    .map_or(0, |data| data.len() as u8);
            }
            Register::ReadData => {
                let end = self.data_offset + out.len();
                let done = {
                    let data = self.pending_data.as_ref().ok_or(BusFault)?;
                    if end > data.len() {
                        return Err(BusFault);
                    }
                    out.copy_from_slice(&data[self.data_offset..end]);
                    end == data.len()
                };
                self.data_offset = end;
                if done {
                    self.pending_data = None;
                }
            }
            Register::WriteAtLong | Register::WriteAt => {
                return Err(BusFault);
            }
        }
        Ok(())
    }

    fn sleep_ms(&mut self, ms: u32) {
        self.log.push(BusOp::Sleep(ms));
    }
}
