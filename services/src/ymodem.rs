// Licensed under the Apache-2.0 license

//! YMODEM receiver (CRC16 variant, single file per session).
//!
//! The sender is started by a `C`, sends block 0 with the file name and
//! decimal size, then numbered 128 or 1024 byte blocks, then EOT. Each good
//! block is ACKed; damaged blocks are NAKed after the line has been drained.

use arrayvec::ArrayString;
use crc::{Crc, CRC_16_XMODEM};
use hss_boot_image::CRC32;
use hss_config::HssConfig;
use hss_error::HssError;
use hss_hal::SerialPort;
use log::{debug, info, warn};
use smlang::statemachine;

pub const MAX_FILENAME_LEN: usize = 64;

const SHORT_BLOCK: usize = 128;
const LONG_BLOCK: usize = 1024;
const CAN_COUNT_REQUIRED: u32 = 2;
const CAN_BURST: usize = 8;
const PURGE_LIMIT: usize = 10;

/// Line control characters.
pub mod ctrl {
    pub const SOH: u8 = 0x01;
    pub const STX: u8 = 0x02;
    pub const ETX: u8 = 0x03;
    pub const EOT: u8 = 0x04;
    pub const ACK: u8 = 0x06;
    pub const NAK: u8 = 0x15;
    pub const CAN: u8 = 0x18;
    pub const CRC_REQUEST: u8 = b'C';
}

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

statemachine! {
    derive_states: [Clone, Copy, Debug],
    transitions: {
        // syntax: CurrentState Event [guard] / action = NextState

        // block 0 names the file; refuse it up front if it cannot fit
        *AwaitingHeader + Header [header_fits] / accept_header = Receiving,
        AwaitingHeader + Header [header_too_large] = Aborted,

        Receiving + Data [data_fits] / append_data = Receiving,
        Receiving + Data [data_overflows] = Aborted,

        Receiving + EndOfFile = Complete,

        // CAN CAN / ETX from the sender, or the line went quiet
        _ + Cancel = Aborted,
    }
}

/// Outcome of a successful transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFile {
    pub filename: ArrayString<MAX_FILENAME_LEN>,
    pub len: usize,
    pub crc32: u32,
}

enum Frame {
    /// A valid block with the expected number; contents are in `Session::packet`.
    Packet,
    /// The previous block again, after our ACK was lost.
    Duplicate,
    EndOfFile,
    Cancelled,
    /// No start byte within the sync attempt budget.
    Lost,
    Corrupt,
}

/// Session data carried by the state machine.
pub(crate) struct Session<'a> {
    dest: &'a mut [u8],
    packet: [u8; LONG_BLOCK],
    packet_len: usize,
    expected_blk: u8,
    received_packets: u32,
    total: usize,
    expected_size: usize,
    filename: ArrayString<MAX_FILENAME_LEN>,
}

impl<'a> Session<'a> {
    fn new(dest: &'a mut [u8]) -> Self {
        Self {
            dest,
            packet: [0; LONG_BLOCK],
            packet_len: 0,
            expected_blk: 0,
            received_packets: 0,
            total: 0,
            expected_size: 0,
            filename: ArrayString::new(),
        }
    }

    fn payload(&self) -> &[u8] {
        &self.packet[..self.packet_len]
    }

    /// Bytes of the current block that belong to the file. The last block is
    /// padded, so the announced size trims it when known.
    fn useful_len(&self) -> usize {
        if self.expected_size == 0 {
            self.packet_len
        } else {
            self.packet_len
                .min(self.expected_size.saturating_sub(self.total))
        }
    }

    fn received_len(&self) -> usize {
        if self.expected_size == 0 {
            self.total
        } else {
            self.expected_size.min(self.total)
        }
    }

    fn read_frame(&mut self, port: &mut dyn SerialPort, config: &HssConfig) -> Frame {
        let mut attempts = 0;
        let mut cancels = 0;
        let len = loop {
            if attempts >= config.ymodem_max_sync_attempts {
                return Frame::Lost;
            }
            match port.read_byte(config.ymodem_pre_sync_timeout_secs) {
                Some(ctrl::SOH) => break SHORT_BLOCK,
                Some(ctrl::STX) => break LONG_BLOCK,
                Some(ctrl::EOT) => return Frame::EndOfFile,
                Some(ctrl::ETX) => return Frame::Cancelled,
                Some(ctrl::CAN) => {
                    cancels += 1;
                    if cancels == CAN_COUNT_REQUIRED {
                        return Frame::Cancelled;
                    }
                    attempts += 1;
                }
                _ => {
                    cancels = 0;
                    attempts += 1;
                }
            }
        };

        self.received_packets += 1;
        let timeout = config.ymodem_post_sync_timeout_secs;
        let Some(blk) = port.read_byte(timeout) else {
            return Frame::Corrupt;
        };
        let Some(blk_inv) = port.read_byte(timeout) else {
            return Frame::Corrupt;
        };
        for slot in &mut self.packet[..len] {
            match port.read_byte(timeout) {
                Some(b) => *slot = b,
                None => return Frame::Corrupt,
            }
        }
        let (Some(crc_hi), Some(crc_lo)) = (port.read_byte(timeout), port.read_byte(timeout)) else {
            return Frame::Corrupt;
        };

        if CRC16.checksum(&self.packet[..len]) != u16::from_be_bytes([crc_hi, crc_lo]) {
            debug!("ymodem: CRC mismatch on block {}", blk);
            return Frame::Corrupt;
        }
        if blk != !blk_inv {
            return Frame::Corrupt;
        }
        if blk == self.expected_blk {
            self.packet_len = len;
            self.expected_blk = self.expected_blk.wrapping_add(1);
            Frame::Packet
        } else if blk == self.expected_blk.wrapping_sub(1) && self.received_packets > 1 {
            Frame::Duplicate
        } else {
            debug!("ymodem: expected block {}, got {}", self.expected_blk, blk);
            Frame::Corrupt
        }
    }
}

impl StateMachineContext for Session<'_> {
    fn header_fits(&self) -> Result<bool, ()> {
        Ok(parse_file_size(self.payload()) <= self.dest.len())
    }

    fn header_too_large(&self) -> Result<bool, ()> {
        Ok(parse_file_size(self.payload()) > self.dest.len())
    }

    fn accept_header(&mut self) -> Result<(), ()> {
        self.expected_size = parse_file_size(self.payload());
        self.filename.clear();
        for &b in self.packet.iter().take_while(|&&b| b != 0) {
            if self.filename.try_push(b as char).is_err() {
                break;
            }
        }
        debug!(
            "ymodem: receiving {} ({} bytes)",
            self.filename.as_str(),
            self.expected_size
        );
        Ok(())
    }

    fn data_fits(&self) -> Result<bool, ()> {
        Ok(self.total + self.useful_len() <= self.dest.len())
    }

    fn data_overflows(&self) -> Result<bool, ()> {
        Ok(self.total + self.useful_len() > self.dest.len())
    }

    fn append_data(&mut self) -> Result<(), ()> {
        let len = self.useful_len();
        self.dest[self.total..self.total + len].copy_from_slice(&self.packet[..len]);
        self.total += len;
        Ok(())
    }
}

/// Decimal size that follows the NUL-terminated file name in block 0.
/// Returns 0 when no size is given.
pub fn parse_file_size(header: &[u8]) -> usize {
    header
        .iter()
        .skip_while(|&&b| b != 0)
        .skip(1)
        .take_while(|b| b.is_ascii_digit())
        .fold(0usize, |size, &b| {
            size.saturating_mul(10).saturating_add((b - b'0') as usize)
        })
}

fn send_cancel(port: &mut dyn SerialPort) {
    port.write_all(&[ctrl::CAN; CAN_BURST]);
}

fn purge_and_nak(port: &mut dyn SerialPort, config: &HssConfig) {
    for _ in 0..PURGE_LIMIT {
        if port.read_byte(config.ymodem_post_sync_timeout_secs).is_none() {
            break;
        }
    }
    port.write_byte(ctrl::NAK);
}

/// Receives one file into `dest`.
pub fn receive(
    port: &mut dyn SerialPort,
    dest: &mut [u8],
    config: &HssConfig,
) -> Result<ReceivedFile, HssError> {
    let mut state_machine = StateMachine::new(Session::new(dest));
    let mut prev_state = States::AwaitingHeader;
    let mut failure = HssError::TransferAborted;
    let mut retries = 0;

    port.write_byte(ctrl::CRC_REQUEST);
    while !matches!(*state_machine.state(), States::Complete | States::Aborted) {
        if retries >= config.ymodem_bad_packet_retries {
            warn!("ymodem: giving up after {} bad packets", retries);
            failure = HssError::RetriesExceeded;
            send_cancel(port);
            let _ = state_machine.process_event(Events::Cancel);
            break;
        }

        match state_machine.context_mut().read_frame(port, config) {
            Frame::Packet => {
                port.write_byte(ctrl::ACK);
                let event = match *state_machine.state() {
                    States::AwaitingHeader => Events::Header,
                    _ => Events::Data,
                };
                let _ = state_machine.process_event(event);
                match *state_machine.state() {
                    States::Aborted => {
                        failure = HssError::TransferTooLarge;
                        send_cancel(port);
                    }
                    // data blocks follow a fresh CRC request
                    States::Receiving if prev_state == States::AwaitingHeader => {
                        port.write_byte(ctrl::CRC_REQUEST);
                    }
                    _ => {}
                }
            }
            Frame::Duplicate => port.write_byte(ctrl::ACK),
            Frame::EndOfFile => {
                port.write_byte(ctrl::ACK);
                if state_machine.process_event(Events::EndOfFile).is_err() {
                    retries += 1;
                }
            }
            Frame::Cancelled => {
                send_cancel(port);
                let _ = state_machine.process_event(Events::Cancel);
            }
            Frame::Lost => {
                failure = HssError::RetriesExceeded;
                let _ = state_machine.process_event(Events::Cancel);
            }
            Frame::Corrupt => {
                retries += 1;
                purge_and_nak(port, config);
            }
        }

        if prev_state != *state_machine.state() {
            debug!(
                "ymodem: transitioning from {:?} to {:?}",
                prev_state,
                state_machine.state()
            );
            prev_state = *state_machine.state();
        }
    }

    if *state_machine.state() != States::Complete {
        return Err(failure);
    }

    // close the batch: the sender follows with an empty block 0
    let session = state_machine.context_mut();
    session.expected_blk = 0;
    port.write_byte(ctrl::CRC_REQUEST);
    if matches!(session.read_frame(port, config), Frame::Packet) {
        port.write_byte(ctrl::ACK);
    }

    let session = state_machine.context();
    let len = session.received_len();
    let crc32 = CRC32.checksum(&session.dest[..len]);
    info!(
        "Received {} bytes from {} (CRC32 is 0x{:08X})",
        len,
        session.filename.as_str(),
        crc32
    );
    Ok(ReceivedFile {
        filename: session.filename,
        len,
        crc32,
    })
}
