// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::marker::PhantomData;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use crate::crc::compute_crc16;
use crate::protocol::*;
use crate::serial::SerialPort;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum SenderError {
    Io(std::io::Error),
    /// The receiver sent a CA pair
    Cancelled,
    /// The reply-error budget ran out
    TooManyErrors,
    TransferComplete,
}

impl std::fmt::Display for SenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SenderError::Io(e) => write!(f, "I/O error: {}", e),
            SenderError::Cancelled => write!(f, "Cancelled by receiver"),
            SenderError::TooManyErrors => write!(f, "Too many consecutive errors"),
            SenderError::TransferComplete => write!(f, "Transfer complete"),
        }
    }
}

impl std::error::Error for SenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SenderError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SenderError {
    fn from(err: std::io::Error) -> Self {
        SenderError::Io(err)
    }
}

// ============================================================================
// States
// ============================================================================

pub struct WaitStart;
pub struct SendHeader;
pub struct AwaitHeaderReply;
pub struct AwaitDataRequest;
pub struct SendData;
pub struct AwaitDataAck;
pub struct SendEot;
pub struct AwaitEotAck;
pub struct SendFinalHeader;
pub struct AwaitFinalAck;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    files: Vec<PathBuf>,
    current_file: Option<File>,
    header_frame: Vec<u8>,
    chunk: Vec<u8>,
    sequence: u8,
    retransmit: bool,
    consecutive_errors: u32,
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError>;
}

// ============================================================================
// Helpers shared by all states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            files: self.files,
            current_file: self.current_file,
            header_frame: self.header_frame,
            chunk: self.chunk,
            sequence: self.sequence,
            retransmit: self.retransmit,
            consecutive_errors: self.consecutive_errors,
            debug: self.debug,
        })
    }

    fn io_error(&self, e: std::io::Error) -> SenderError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        SenderError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    /// The receiver's reply was missing or unusable; give up once the error
    /// budget is spent, cancelling the session in both directions.
    fn reply_failure(&mut self) -> Result<(), SenderError> {
        self.consecutive_errors += 1;
        if self.consecutive_errors > MAX_ERRORS {
            if self.debug { println!("Error budget exhausted, cancelling"); }
            self.serial.write_all(&[CA, CA])?;
            Err(SenderError::TooManyErrors)
        } else {
            Ok(())
        }
    }

    /// A CA arrived where a reply was expected; a second one means the
    /// receiver is cancelling the session.
    fn check_cancel(&mut self) -> Result<(), SenderError> {
        match self.serial.read_byte(REPLY_TIMEOUT) {
            Ok(CA) => {
                if self.debug { println!("Received: CA CA (cancelled by receiver)"); }
                Err(SenderError::Cancelled)
            }
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<WaitStart> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        match fsm.serial.read_byte(REPLY_TIMEOUT) {
            Ok(CRC_REQUEST) => {
                if fsm.debug { println!("Received: 'C'"); }
                fsm.consecutive_errors = 0;
                if fsm.files.is_empty() {
                    let next = fsm.transition::<SendFinalHeader>();
                    Ok(next as Box<dyn SenderState>)
                } else {
                    let next = fsm.transition::<SendHeader>();
                    Ok(next as Box<dyn SenderState>)
                }
            }
            Ok(CA) => {
                fsm.check_cancel()?;
                fsm.reply_failure()?;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Ok(_) => {
                if fsm.debug { println!("Receiver not ready, waiting for 'C'..."); }
                fsm.reply_failure()?;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.reply_failure()?;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl SenderState for SenderFsm<SendHeader> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        if fsm.current_file.is_none() {
            let path = fsm.files[0].clone();
            let file = File::open(&path)?;
            let size = file.metadata()?.len();
            if fsm.debug { println!("Opened: {:?} ({} bytes)", path, size); }

            fsm.header_frame = build_packet(0, &build_header_payload(&path, size), PACKET_SIZE, 0x00);
            fsm.current_file = Some(file);
            fsm.sequence = 0;
        }

        fsm.serial.write_all(&fsm.header_frame)?;
        if fsm.debug { println!("Sent: header packet"); }

        let next = fsm.transition::<AwaitHeaderReply>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitHeaderReply> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        match fsm.serial.read_byte(REPLY_TIMEOUT) {
            Ok(ACK) => {
                if fsm.debug { println!("Received: ACK"); }
                fsm.consecutive_errors = 0;
                fsm.sequence = 1;
                let next = fsm.transition::<AwaitDataRequest>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(CA) => {
                fsm.check_cancel()?;
                fsm.reply_failure()?;
                let next = fsm.transition::<SendHeader>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(byte) => {
                // NAK or a fresh 'C' both mean the header did not land
                if fsm.debug { println!("Received: 0x{:02X}, resending header", byte); }
                fsm.reply_failure()?;
                let next = fsm.transition::<SendHeader>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.reply_failure()?;
                let next = fsm.transition::<SendHeader>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl SenderState for SenderFsm<AwaitDataRequest> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        match fsm.serial.read_byte(REPLY_TIMEOUT) {
            Ok(CRC_REQUEST) => {
                if fsm.debug { println!("Received: 'C', starting data"); }
                fsm.consecutive_errors = 0;
                let next = fsm.transition::<SendData>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(CA) => {
                fsm.check_cancel()?;
                fsm.reply_failure()?;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Ok(_) => {
                fsm.reply_failure()?;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.reply_failure()?;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl SenderState for SenderFsm<SendData> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        if fsm.retransmit {
            fsm.retransmit = false;
            if fsm.debug { println!("Retransmitting packet {}", fsm.sequence); }
        } else {
            fsm.chunk = match fsm.current_file {
                Some(ref mut file) => read_chunk(file)?,
                None => Vec::new(),
            };
        }

        if fsm.chunk.is_empty() {
            let next = fsm.transition::<SendEot>();
            return Ok(next as Box<dyn SenderState>);
        }

        let payload_size = if fsm.chunk.len() <= PACKET_SIZE {
            PACKET_SIZE
        } else {
            PACKET_1K_SIZE
        };
        let frame = build_packet(fsm.sequence, &fsm.chunk, payload_size, DATA_PAD);
        fsm.serial.write_all(&frame)?;
        if fsm.debug {
            println!("Sent: packet {} ({} data bytes)", fsm.sequence, fsm.chunk.len());
        }

        let next = fsm.transition::<AwaitDataAck>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitDataAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        match fsm.serial.read_byte(REPLY_TIMEOUT) {
            Ok(ACK) => {
                if fsm.debug { println!("Received: ACK"); }
                fsm.consecutive_errors = 0;
                fsm.retransmit = false;
                fsm.sequence = fsm.sequence.wrapping_add(1);
                let next = fsm.transition::<SendData>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(CA) => {
                fsm.check_cancel()?;
                fsm.reply_failure()?;
                fsm.retransmit = true;
                let next = fsm.transition::<SendData>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(byte) => {
                if fsm.debug { println!("Received: 0x{:02X}, retransmitting", byte); }
                fsm.reply_failure()?;
                fsm.retransmit = true;
                let next = fsm.transition::<SendData>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.reply_failure()?;
                fsm.retransmit = true;
                let next = fsm.transition::<SendData>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl SenderState for SenderFsm<SendEot> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        fsm.serial.write_all(&[EOT])?;
        if fsm.debug { println!("Sent: EOT"); }

        let next = fsm.transition::<AwaitEotAck>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitEotAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        match fsm.serial.read_byte(REPLY_TIMEOUT) {
            Ok(ACK) => {
                fsm.current_file = None;
                fsm.header_frame.clear();
                fsm.sequence = 0;
                fsm.consecutive_errors = 0;
                fsm.files.remove(0);
                if fsm.debug { println!("File complete, {} remaining", fsm.files.len()); }
                let next = fsm.transition::<WaitStart>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(CA) => {
                fsm.check_cancel()?;
                fsm.reply_failure()?;
                let next = fsm.transition::<SendEot>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(_) => {
                fsm.reply_failure()?;
                let next = fsm.transition::<SendEot>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.reply_failure()?;
                let next = fsm.transition::<SendEot>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl SenderState for SenderFsm<SendFinalHeader> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        // All-zero header packet: no more files
        let frame = build_packet(0, &[], PACKET_SIZE, 0x00);
        fsm.serial.write_all(&frame)?;
        if fsm.debug { println!("Sent: empty header packet"); }

        let next = fsm.transition::<AwaitFinalAck>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitFinalAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        match fsm.serial.read_byte(REPLY_TIMEOUT) {
            Ok(ACK) => {
                if fsm.debug { println!("Received: ACK (batch complete)"); }
                Err(SenderError::TransferComplete)
            }
            Ok(CA) => {
                fsm.check_cancel()?;
                fsm.reply_failure()?;
                let next = fsm.transition::<SendFinalHeader>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(_) => {
                fsm.reply_failure()?;
                let next = fsm.transition::<SendFinalHeader>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.reply_failure()?;
                let next = fsm.transition::<SendFinalHeader>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl SenderFsm<WaitStart> {
    pub fn new(serial: Box<dyn SerialPort>, files: Vec<PathBuf>, debug: bool) -> Box<dyn SenderState> {
        Box::new(SenderFsm {
            state: PhantomData::<WaitStart>,
            serial,
            files,
            current_file: None,
            header_frame: Vec::new(),
            chunk: Vec::new(),
            sequence: 0,
            retransmit: false,
            consecutive_errors: 0,
            debug,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Frame a payload: control byte, sequence, complement, padded payload,
/// big-endian CRC16 over the padded payload.
fn build_packet(sequence: u8, payload: &[u8], payload_size: usize, pad: u8) -> Vec<u8> {
    let mut padded = payload.to_vec();
    padded.resize(payload_size, pad);
    let crc = compute_crc16(&padded);

    let mut frame = Vec::with_capacity(
        1 + PACKET_HEADER_SIZE + payload_size + PACKET_TRAILER_SIZE,
    );
    frame.push(if payload_size == PACKET_1K_SIZE { STX } else { SOH });
    frame.push(sequence);
    frame.push(sequence ^ 0xFF);
    frame.extend_from_slice(&padded);
    frame.push((crc >> 8) as u8);
    frame.push((crc & 0xFF) as u8);
    frame
}

/// Header payload: filename, NUL, decimal size, space. The filename is the
/// path's final component, truncated to the wire bound.
fn build_header_payload(path: &Path, size: u64) -> Vec<u8> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed");
    let name_bytes = name.as_bytes();

    let mut payload = Vec::new();
    payload.extend_from_slice(&name_bytes[..name_bytes.len().min(FILE_NAME_LENGTH)]);
    payload.push(0);
    payload.extend_from_slice(size.to_string().as_bytes());
    payload.push(b' ');
    payload
}

/// Fill a chunk from the file, looping over short reads so padding can never
/// land in the middle of the stream.
fn read_chunk(file: &mut File) -> std::io::Result<Vec<u8>> {
    let mut buf = [0u8; PACKET_1K_SIZE];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    Ok(buf[..filled].to_vec())
}

// ============================================================================
// Tests
// ============================================================================
