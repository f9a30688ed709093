// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for an AT-commanded LoRaWAN end-node module.
//!
//! The module sits on a register-addressed synchronous bus and speaks a
//! CRLF-framed AT dialect: the driver writes a command line through the
//! chunked write registers, polls for the acknowledgment line, and
//! compares it byte-for-byte against the literal the module documents for
//! that command. Downlinks arrive out-of-band and are pulled through the
//! data registers, either from [`Lwnode::sleep_ms`]'s poll loop (which
//! dispatches `+RECV=` frames to a registered callback) or synchronously
//! via [`Lwnode::read_data`].
//!
//! The driver is generic over [`LwnodeBus`], the three-operation
//! capability (`write`/`read`/`sleep_ms`) a transport provides. It holds
//! the staged configuration (join mode, region, credentials, radio
//! parameters) and pushes it to the module during [`Lwnode::begin`], so
//! a caller can fully describe the node before the hardware is up.
//!
//! Everything here runs on the caller's task. The only suspension point
//! is the bus's `sleep_ms`, and the `int_enabled` gate tells an outer
//! receive-polling loop to keep its hands off the bus while a command
//! transaction owns it.

#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write as _};

use drv_lwnode_api::{
    DeviceClass, JoinMode, LwnodeBus, Region, Register, UplinkType,
};
use heapless::String;
use static_assertions::const_assert;
use tracebuf::{trace_entry, tracebuf};

pub mod frame;
mod xact;

#[cfg(test)]
mod mock;

use crate::frame::FrameError;

/// Receive scratch capacity; acknowledgments and downlinks both stage
/// here.
pub const MAX_RX_BYTES: usize = 256;
/// Largest uplink payload the module accepts.
pub const MAX_PAYLOAD: usize = 128;
/// Largest plausible acknowledgment line.
pub const MAX_ACK_LEN: usize = 64;
/// Command staging capacity, CRLF included.
pub const MAX_CMD_LEN: usize = 520;

/// Hex widths of the credential fields.
pub const APP_EUI_HEX_CHARS: usize = 16;
pub const KEY_HEX_CHARS: usize = 32;

const_assert!(MAX_PAYLOAD <= MAX_RX_BYTES);
const_assert!(MAX_ACK_LEN <= MAX_RX_BYTES);

const PROBE_ATTEMPTS: u32 = 100;
const PROBE_RETRY_DELAY_MS: u32 = 10;
const REBOOT_SETTLE_MS: u32 = 100;
/// The module wants a beat between announcing a downlink's length and
/// serving its bytes.
const READ_DATA_DELAY_MS: u32 = 100;

// Reader-path downlinks carry a nine-byte metadata header in front of
// the payload, with the link metrics buried at fixed offsets. This is a
// different framing from the three-byte `+RECV=` header the poll path
// parses (see `frame`), but the RSSI/SNR encoding is the same in both.
const RX_METADATA_LEN: usize = 9;
const RX_RSSI_INDEX: usize = 6;
const RX_SNR_INDEX: usize = 7;
/// The module reports SNR biased up by 50 dB.
pub(crate) const SNR_BIAS: i8 = 50;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LwnodeError {
    /// Command line is empty or cannot carry its CRLF terminator within
    /// the staging buffer.
    BadCommandLength { len: usize },
    /// Credential string is not exactly its field's hex width.
    BadCredentialLength { len: usize, expected: usize },
    /// Credential string contains a character outside `0-9a-fA-F`.
    BadCredentialDigit,
    /// Sub-bands are not a thing on this region's band plan.
    SubbandUnsupported { region: Region },
    /// Uplink payloads are 1 to 128 bytes.
    BadPayloadLength { len: usize },
    WriteFault { reg: Register },
    ReadFault { reg: Register },
    /// The module produced no acknowledgment within the poll budget.
    AckTimeout,
    /// The acknowledgment did not match the expected literal.
    AckMismatch,
    /// The module never answered the probe during bring-up.
    ProbeTimeout,
    /// A polled downlink buffer failed `+RECV=` validation.
    BadDownlink(FrameError),
    /// A reader-path downlink was shorter than its metadata header.
    ShortDownlink { len: usize },
}

/// Handler for decoded downlink frames: payload, RSSI (dBm), SNR (dB).
///
/// Invoked from the same task that called [`Lwnode::sleep_ms`]; it must
/// not re-enter the driver.
pub type RxCallback = fn(payload: &[u8], rssi: i8, snr: i8);

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Command { len: u16 },
    Ack { len: u8 },
    AckTimeout,
    WriteFault(Register),
    ReadFault(Register),
    Downlink { len: u8 },
    Frame { rssi: i8, snr: i8, len: u8 },
    BadDownlink(FrameError),
}

tracebuf!(TRACE, Trace, 32, Trace::None);

/// A LoRaWAN node bound to a transport.
///
/// The transport is borrowed for the node's whole life; the node owns
/// everything else, including the scratch buffer both receive paths
/// stage into.
pub struct Lwnode<'a, B> {
    bus: &'a mut B,

    join_mode: JoinMode,
    region: Region,
    dev_addr: u32,

    // Credentials as uppercase hex; empty means unset.
    app_eui: String<APP_EUI_HEX_CHARS>,
    app_key: String<KEY_HEX_CHARS>,
    nwk_skey: String<KEY_HEX_CHARS>,
    app_skey: String<KEY_HEX_CHARS>,

    data_rate: u8,
    tx_power: u8,
    adr: bool,
    sub_band: u8,

    last_rssi: i8,
    last_snr: i8,

    rx_cb: Option<RxCallback>,

    // Open whenever no AT transaction owns the bus.
    int_enabled: bool,

    rx_buf: [u8; MAX_RX_BYTES],
}

impl<'a, B: LwnodeBus> Lwnode<'a, B> {
    pub fn new(bus: &'a mut B) -> Self {
        Self {
            bus,
            join_mode: JoinMode::Otaa,
            region: Region::Us915,
            dev_addr: 0,
            app_eui: String::new(),
            app_key: String::new(),
            nwk_skey: String::new(),
            app_skey: String::new(),
            data_rate: 0,
            tx_power: 0,
            adr: false,
            sub_band: 0,
            last_rssi: 0,
            last_snr: 0,
            rx_cb: None,
            int_enabled: true,
            rx_buf: [0; MAX_RX_BYTES],
        }
    }

    /// RSSI of the most recently decoded downlink, in dBm; zero until
    /// something has been received.
    pub fn last_rssi(&self) -> i8 {
        self.last_rssi
    }

    /// SNR of the most recently decoded downlink, in dB.
    pub fn last_snr(&self) -> i8 {
        self.last_snr
    }

    /// Whether an outer poll loop may touch the data registers right
    /// now. False exactly while an AT transaction owns the bus.
    pub fn interrupts_enabled(&self) -> bool {
        self.int_enabled
    }

    /// Registers the downlink handler. Frames only reach it through
    /// [`Self::sleep_ms`].
    pub fn set_rx_callback(&mut self, callback: RxCallback) {
        self.rx_cb = Some(callback);
    }

    /// Stages over-the-air activation; takes effect at [`Self::begin`].
    pub fn config_otaa(&mut self) {
        self.join_mode = JoinMode::Otaa;
    }

    /// Stages activation by personalization; takes effect at
    /// [`Self::begin`].
    pub fn config_abp(&mut self) {
        self.join_mode = JoinMode::Abp;
    }

    pub fn set_region(&mut self, region: Region) -> Result<(), LwnodeError> {
        let cmd = match region {
            Region::Eu868 => "AT+REGION=EU868",
            Region::Us915 => "AT+REGION=US915",
            Region::Cn470 => "AT+REGION=CN470",
        };
        self.command(cmd, b"+REGION=OK\r\n")?;
        self.region = region;
        Ok(())
    }

    /// Caches the join EUI (uppercased) and pushes it to the module.
    pub fn set_app_eui(&mut self, app_eui: &str) -> Result<(), LwnodeError> {
        self.app_eui = stage_credential(app_eui)?;
        let cmd = render::<48>(format_args!("AT+JOINEUI={}", self.app_eui.as_str()))?;
        self.command(&cmd, b"+JOINEUI=OK\r\n")
    }

    /// Caches the application key (uppercased) and pushes it to the
    /// module.
    pub fn set_app_key(&mut self, app_key: &str) -> Result<(), LwnodeError> {
        self.app_key = stage_credential(app_key)?;
        let cmd = render::<48>(format_args!("AT+APPKEY={}", self.app_key.as_str()))?;
        self.command(&cmd, b"+APPKEY=OK\r\n")
    }

    pub fn set_nwk_skey(&mut self, nwk_skey: &str) -> Result<(), LwnodeError> {
        self.nwk_skey = stage_credential(nwk_skey)?;
        let cmd = render::<48>(format_args!("AT+NWKSKEY={}", self.nwk_skey.as_str()))?;
        self.command(&cmd, b"+NWKSKEY=OK\r\n")
    }

    pub fn set_app_skey(&mut self, app_skey: &str) -> Result<(), LwnodeError> {
        self.app_skey = stage_credential(app_skey)?;
        let cmd = render::<48>(format_args!("AT+APPSKEY={}", self.app_skey.as_str()))?;
        self.command(&cmd, b"+APPSKEY=OK\r\n")
    }

    pub fn set_dev_addr(&mut self, dev_addr: u32) -> Result<(), LwnodeError> {
        let cmd = render::<24>(format_args!("AT+DEVADDR={dev_addr:08X}"))?;
        self.command(&cmd, b"+DEVADDR=OK\r\n")?;
        self.dev_addr = dev_addr;
        Ok(())
    }

    pub fn set_class(&mut self, class: DeviceClass) -> Result<(), LwnodeError> {
        let cmd = match class {
            DeviceClass::A => "AT+CLASS=CLASS_A",
            DeviceClass::C => "AT+CLASS=CLASS_C",
        };
        self.command(cmd, b"+CLASS=OK\r\n")
    }

    pub fn set_datarate(&mut self, data_rate: u8) -> Result<(), LwnodeError> {
        let cmd = render::<24>(format_args!("AT+DATARATE={data_rate}"))?;
        self.command(&cmd, b"+DATARATE=OK\r\n")?;
        self.data_rate = data_rate;
        Ok(())
    }

    pub fn set_eirp(&mut self, eirp: u8) -> Result<(), LwnodeError> {
        let cmd = render::<24>(format_args!("AT+EIRP={eirp}"))?;
        self.command(&cmd, b"+EIRP=OK\r\n")?;
        self.tx_power = eirp;
        Ok(())
    }

    /// Selects the sub-band on band plans that have one; EU868 does not.
    pub fn set_subband(&mut self, sub_band: u8) -> Result<(), LwnodeError> {
        if self.region == Region::Eu868 {
            return Err(LwnodeError::SubbandUnsupported {
                region: self.region,
            });
        }
        let cmd = render::<24>(format_args!("AT+SUBBAND={sub_band}"))?;
        self.command(&cmd, b"+SUBBAND=OK\r\n")?;
        self.sub_band = sub_band;
        Ok(())
    }

    pub fn enable_adr(&mut self, adr: bool) -> Result<(), LwnodeError> {
        let cmd = if adr { "AT+ADR=1" } else { "AT+ADR=0" };
        self.command(cmd, b"+ADR=OK\r\n")?;
        self.adr = adr;
        Ok(())
    }

    pub fn set_uplink_type(
        &mut self,
        uplink: UplinkType,
    ) -> Result<(), LwnodeError> {
        let cmd = match uplink {
            UplinkType::Unconfirmed => "AT+UPLINKTYPE=UNCONFIRMED",
            UplinkType::Confirmed => "AT+UPLINKTYPE=CONFIRMED",
        };
        self.command(cmd, b"+UPLINKTYPE=OK\r\n")
    }

    /// Brings the module up: reboot, probe until it answers, apply the
    /// global settings, then push whatever credentials are staged for
    /// the configured join mode.
    pub fn begin(&mut self) -> Result<(), LwnodeError> {
        // The module falls off the bus while it restarts, so neither
        // the write nor an acknowledgment is required here.
        let _ = self.send_at_cmd("AT+REBOOT");
        self.bus.sleep_ms(REBOOT_SETTLE_MS);

        let mut responsive = false;
        for _ in 0..PROBE_ATTEMPTS {
            if self.probe() {
                responsive = true;
                break;
            }
            self.bus.sleep_ms(PROBE_RETRY_DELAY_MS);
        }
        if !responsive {
            return Err(LwnodeError::ProbeTimeout);
        }

        // Enable the receive queue; ack ignored.
        let _ = self.send_at_cmd("AT+RECV=1");

        self.send_at_cmd("AT+LORAMODE=LORAWAN")?;

        match self.join_mode {
            JoinMode::Abp => {
                self.command("AT+JOINTYPE=ABP", b"+JOINTYPE=OK\r\n")?;
                if !self.nwk_skey.is_empty() {
                    let key = self.nwk_skey.clone();
                    self.set_nwk_skey(&key)?;
                }
                if !self.app_skey.is_empty() {
                    let key = self.app_skey.clone();
                    self.set_app_skey(&key)?;
                }
                if self.dev_addr != 0 {
                    self.set_dev_addr(self.dev_addr)?;
                }
            }
            JoinMode::Otaa => {
                self.command("AT+JOINTYPE=OTAA", b"+JOINTYPE=OK\r\n")?;
                if !self.app_eui.is_empty() {
                    let eui = self.app_eui.clone();
                    self.set_app_eui(&eui)?;
                }
                if !self.app_key.is_empty() {
                    let key = self.app_key.clone();
                    self.set_app_key(&key)?;
                }
            }
        }

        Ok(())
    }

    /// Requests a network join with the staged mode and credentials.
    pub fn join(&mut self) -> Result<(), LwnodeError> {
        self.command("AT+JOIN=1", b"+JOIN=OK\r\n")
    }

    /// Asks the module whether it currently holds a network session.
    pub fn is_joined(&mut self) -> Result<bool, LwnodeError> {
        let ack = self.send_at_cmd("AT+JOIN?")?;
        Ok(ack == b"+JOIN=1\r\n")
    }

    /// Uplinks `data` (1 to 128 bytes), hex-encoded on the wire. The
    /// module acknowledges sends in either its plain or echoed form.
    pub fn send_bytes(&mut self, data: &[u8]) -> Result<(), LwnodeError> {
        if data.is_empty() || data.len() > MAX_PAYLOAD {
            return Err(LwnodeError::BadPayloadLength { len: data.len() });
        }

        let mut cmd: String<MAX_CMD_LEN> = String::new();
        if cmd.push_str("AT+SEND=").is_err()
            || hexfmt::push_hex_upper(&mut cmd, data).is_err()
        {
            return Err(LwnodeError::BadCommandLength {
                len: 8 + data.len() * 2,
            });
        }

        let ack = self.send_at_cmd(&cmd)?;
        if ack == b"+SEND=OK\r\n" || ack == b"AT+SEND=OK\r\n" {
            Ok(())
        } else {
            Err(LwnodeError::AckMismatch)
        }
    }

    /// Sleeps for `ms`, polling for downlinks each millisecond while a
    /// callback is registered. This is the only path that dispatches
    /// frames to the callback; faults during polling are traced and the
    /// loop keeps going.
    pub fn sleep_ms(&mut self, ms: u32) {
        let mut elapsed = 0;
        while elapsed < ms {
            if self.rx_cb.is_none() {
                let step = (ms - elapsed).min(100);
                self.bus.sleep_ms(step);
                elapsed += step;
                continue;
            }

            if let Ok(Some(len)) = self.read_lora_data() {
                let _ = self.process_downlink(len);
            }

            self.bus.sleep_ms(1);
            elapsed += 1;
        }
    }

    /// Pulls one pending downlink synchronously, without involving the
    /// callback. Returns how many payload bytes were copied into `out`,
    /// or `None` when nothing is pending.
    pub fn read_data(
        &mut self,
        out: &mut [u8],
    ) -> Result<Option<usize>, LwnodeError> {
        let len = match self.read_lora_data()? {
            Some(len) => len,
            None => return Ok(None),
        };

        if len <= RX_METADATA_LEN {
            return Err(LwnodeError::ShortDownlink { len });
        }

        self.last_rssi = (self.rx_buf[RX_RSSI_INDEX] as i8).wrapping_neg();
        self.last_snr = (self.rx_buf[RX_SNR_INDEX] as i8).wrapping_sub(SNR_BIAS);

        let payload = &self.rx_buf[RX_METADATA_LEN..len];
        let copied = payload.len().min(out.len());
        out[..copied].copy_from_slice(&payload[..copied]);
        Ok(Some(copied))
    }

    /// Sends `cmd` and requires the exact acknowledgment literal back.
    fn command(
        &mut self,
        cmd: &str,
        expect: &[u8],
    ) -> Result<(), LwnodeError> {
        let ack = self.send_at_cmd(cmd)?;
        if ack != expect {
            return Err(LwnodeError::AckMismatch);
        }
        Ok(())
    }

    fn probe(&mut self) -> bool {
        matches!(self.send_at_cmd("AT"), Ok(ack) if ack == b"OK\r\n")
    }

    /// The shared data-read primitive: check the pending length, and if
    /// it is plausible pull the buffer into the receive scratch. `None`
    /// means nothing usable is pending.
    fn read_lora_data(&mut self) -> Result<Option<usize>, LwnodeError> {
        let pending = self.bus_read_byte(Register::ReadDataLen)?;
        let len = usize::from(pending);
        if len == 0 || len > MAX_PAYLOAD {
            return Ok(None);
        }

        self.bus.sleep_ms(READ_DATA_DELAY_MS);
        self.read_chunked(Register::ReadData, len)?;
        trace_entry!(TRACE, Trace::Downlink { len: pending });
        Ok(Some(len))
    }

    /// Walks the staged downlink buffer, updating the link metrics and
    /// dispatching each well-formed frame.
    fn process_downlink(&mut self, len: usize) -> Result<(), LwnodeError> {
        let Self {
            rx_buf,
            rx_cb,
            last_rssi,
            last_snr,
            ..
        } = self;

        for item in frame::frames(&rx_buf[..len]) {
            let frame = match item {
                Ok(frame) => frame,
                Err(e) => {
                    trace_entry!(TRACE, Trace::BadDownlink(e));
                    return Err(LwnodeError::BadDownlink(e));
                }
            };

            *last_rssi = frame.rssi;
            *last_snr = frame.snr;
            trace_entry!(
                TRACE,
                Trace::Frame {
                    rssi: frame.rssi,
                    snr: frame.snr,
                    len: frame.payload.len() as u8,
                }
            );

            if !frame.payload.is_empty() {
                if let Some(cb) = rx_cb {
                    cb(frame.payload, frame.rssi, frame.snr);
                }
            }
        }

        Ok(())
    }
}

/// Validates a credential's width and hex content and returns it
/// uppercased for caching.
fn stage_credential<const N: usize>(
    value: &str,
) -> Result<String<N>, LwnodeError> {
    if value.len() != N {
        return Err(LwnodeError::BadCredentialLength {
            len: value.len(),
            expected: N,
        });
    }
    hexfmt::normalize(value).map_err(|_| LwnodeError::BadCredentialDigit)
}

/// Renders a command line into a fixed-capacity string; the capacities
/// at the call sites are sized so this cannot overflow.
fn render<const N: usize>(
    args: fmt::Arguments<'_>,
) -> Result<String<N>, LwnodeError> {
    let mut cmd = String::new();
    cmd.write_fmt(args)
        .map_err(|_| LwnodeError::BadCommandLength { len: N })?;
    Ok(cmd)
}
