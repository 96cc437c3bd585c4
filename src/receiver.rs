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
use crate::packet::{receive_packet, PacketOutcome};
use crate::protocol::*;
use crate::serial::SerialPort;
use crate::storage::Storage;

// ============================================================================
// Outcomes & Error Types
// ============================================================================

/// Terminal result of one receive session
#[derive(Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// A file arrived in full and was committed to storage
    FileReceived { filename: String, size: u64 },
    /// The sender answered with an empty header packet: batch complete
    NoMoreFiles,
    /// The sender cancelled (CA pair) or its console requested an abort
    Aborted,
    /// The consecutive-error budget ran out mid-transfer
    TooManyErrors,
    /// Mount, open, write or sync failed; the sender was told to cancel
    StorageFault,
}

impl std::fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferOutcome::FileReceived { filename, size } => {
                write!(f, "received '{}' ({} bytes)", filename, size)
            }
            TransferOutcome::NoMoreFiles => write!(f, "no more files"),
            TransferOutcome::Aborted => write!(f, "transfer aborted by sender"),
            TransferOutcome::TooManyErrors => write!(f, "too many consecutive errors"),
            TransferOutcome::StorageFault => write!(f, "storage failure"),
        }
    }
}

#[derive(Debug)]
pub enum ReceiverError {
    Io(std::io::Error),
    SessionEnd(TransferOutcome),
}

impl std::fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverError::Io(e) => write!(f, "I/O error: {}", e),
            ReceiverError::SessionEnd(outcome) => write!(f, "Session ended: {}", outcome),
        }
    }
}

impl std::error::Error for ReceiverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReceiverError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReceiverError {
    fn from(err: std::io::Error) -> Self {
        ReceiverError::Io(err)
    }
}

// ============================================================================
// States
// ============================================================================

pub struct WaitHeader;
pub struct Transferring;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<'a, State> {
    state: PhantomData<State>,
    serial: &'a mut dyn SerialPort,
    storage: &'a mut dyn Storage,
    filename: String,
    declared_size: u64,
    bytes_written: u64,
    expected_sequence: u8,
    consecutive_errors: u32,
    transfer_started: bool,
    file_open: bool,
    packets_since_sync: u32,
    sync_every: Option<u32>,
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState<'a>: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState<'a> + 'a>, ReceiverError>;
}

// ============================================================================
// Helpers shared by all states
// ============================================================================

impl<'a, S> ReceiverFsm<'a, S> {
    fn transition<T>(self) -> Box<ReceiverFsm<'a, T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            storage: self.storage,
            filename: self.filename,
            declared_size: self.declared_size,
            bytes_written: self.bytes_written,
            expected_sequence: self.expected_sequence,
            consecutive_errors: self.consecutive_errors,
            transfer_started: self.transfer_started,
            file_open: self.file_open,
            packets_since_sync: self.packets_since_sync,
            sync_every: self.sync_every,
            debug: self.debug,
        })
    }

    fn close_storage(&mut self) {
        if self.file_open {
            self.storage.close();
            self.file_open = false;
        }
    }

    /// Storage let us down: release the file and tell the sender to stop.
    fn storage_fault(&mut self) -> ReceiverError {
        self.close_storage();
        if let Err(e) = self.serial.write_all(&[CA, CA]) {
            return ReceiverError::Io(e);
        }
        ReceiverError::SessionEnd(TransferOutcome::StorageFault)
    }

    /// CA pair from the sender: acknowledge and finish as aborted.
    fn cancelled_by_sender(&mut self) -> ReceiverError {
        if self.debug { println!("Received: CA CA (cancelled by sender)"); }
        self.close_storage();
        if let Err(e) = self.serial.write_all(&[ACK]) {
            return ReceiverError::Io(e);
        }
        ReceiverError::SessionEnd(TransferOutcome::Aborted)
    }

    /// Abort typed at the sender's console: cancel both directions.
    fn sender_abort(&mut self) -> ReceiverError {
        if self.debug { println!("Received: abort request"); }
        self.close_storage();
        if let Err(e) = self.serial.write_all(&[CA, CA]) {
            return ReceiverError::Io(e);
        }
        ReceiverError::SessionEnd(TransferOutcome::Aborted)
    }

    /// Timeout or malformed frame: solicit a retransmission, or give up once
    /// the error budget is spent. Line noise before the first accepted packet
    /// is not counted, so an idle receiver keeps polling with CRC_REQUEST.
    fn transient_failure(&mut self) -> Result<(), ReceiverError> {
        if self.transfer_started {
            self.consecutive_errors += 1;
            if self.consecutive_errors > MAX_ERRORS {
                if self.debug { println!("Error budget exhausted, cancelling"); }
                self.close_storage();
                self.serial.write_all(&[CA, CA])?;
                return Err(ReceiverError::SessionEnd(TransferOutcome::TooManyErrors));
            }
        }
        self.serial.write_all(&[CRC_REQUEST])?;
        Ok(())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, WaitHeader> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState<'a> + 'a>, ReceiverError> {
        let mut fsm = *self;

        match receive_packet(fsm.serial, PACKET_TIMEOUT)? {
            PacketOutcome::Data { sequence, payload } => {
                fsm.consecutive_errors = 0;

                if sequence != fsm.expected_sequence {
                    if fsm.debug {
                        println!("Sequence {} while waiting for header, sending NAK", sequence);
                    }
                    fsm.serial.write_all(&[NAK])?;
                    return Ok(Box::new(fsm) as Box<dyn ReceiverState<'a> + 'a>);
                }

                if payload[0] == 0 {
                    // Empty header: the sender has no more files to offer
                    if fsm.debug { println!("Empty header packet, session complete"); }
                    fsm.serial.write_all(&[ACK])?;
                    return Err(ReceiverError::SessionEnd(TransferOutcome::NoMoreFiles));
                }

                let (filename, declared_size) = parse_header(&payload);
                if fsm.debug {
                    println!("Header packet: '{}' ({} bytes)", filename, declared_size);
                }

                if let Err(e) = fsm.storage.mount() {
                    if fsm.debug { println!("Storage mount failed: {}", e); }
                    return Err(fsm.storage_fault());
                }
                if let Err(e) = fsm.storage.open(&filename) {
                    if fsm.debug { println!("Failed to create '{}': {}", filename, e); }
                    return Err(fsm.storage_fault());
                }

                fsm.file_open = true;
                fsm.filename = filename;
                fsm.declared_size = declared_size;
                fsm.packets_since_sync = 0;
                fsm.transfer_started = true;
                fsm.expected_sequence = fsm.expected_sequence.wrapping_add(1);

                fsm.serial.write_all(&[ACK])?;
                fsm.serial.write_all(&[CRC_REQUEST])?;

                let next = fsm.transition::<Transferring>();
                Ok(next as Box<dyn ReceiverState<'a> + 'a>)
            }
            PacketOutcome::EndOfTransmission => {
                // A stray EOT cannot finish a transfer that never started;
                // re-solicit the header instead.
                if fsm.debug { println!("Stray EOT before header"); }
                fsm.transient_failure()?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState<'a> + 'a>)
            }
            PacketOutcome::CancelPair => Err(fsm.cancelled_by_sender()),
            PacketOutcome::SenderAbort => Err(fsm.sender_abort()),
            PacketOutcome::Timeout | PacketOutcome::FramingError => {
                fsm.transient_failure()?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState<'a> + 'a>)
            }
        }
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, Transferring> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState<'a> + 'a>, ReceiverError> {
        let mut fsm = *self;

        match receive_packet(fsm.serial, PACKET_TIMEOUT)? {
            PacketOutcome::Data { sequence, payload } => {
                fsm.consecutive_errors = 0;

                if sequence != fsm.expected_sequence {
                    if fsm.debug {
                        println!(
                            "Sequence mismatch: got {}, expected {}, sending NAK",
                            sequence, fsm.expected_sequence
                        );
                    }
                    fsm.serial.write_all(&[NAK])?;
                    return Ok(Box::new(fsm) as Box<dyn ReceiverState<'a> + 'a>);
                }

                // Only the bytes the header declared belong to the file; the
                // tail of the final packet is padding.
                let remaining = fsm.declared_size - fsm.bytes_written;
                let take = remaining.min(payload.len() as u64) as usize;
                if take > 0 {
                    match fsm.storage.write(&payload[..take]) {
                        Ok(n) if n == take => {}
                        Ok(n) => {
                            if fsm.debug { println!("Short write ({} of {} bytes)", n, take); }
                            return Err(fsm.storage_fault());
                        }
                        Err(e) => {
                            if fsm.debug { println!("Storage write failed: {}", e); }
                            return Err(fsm.storage_fault());
                        }
                    }
                    fsm.bytes_written += take as u64;
                }

                if let Some(interval) = fsm.sync_every {
                    fsm.packets_since_sync += 1;
                    if fsm.packets_since_sync >= interval {
                        if let Err(e) = fsm.storage.sync() {
                            if fsm.debug { println!("Storage sync failed: {}", e); }
                            return Err(fsm.storage_fault());
                        }
                        fsm.packets_since_sync = 0;
                    }
                }

                fsm.expected_sequence = fsm.expected_sequence.wrapping_add(1);
                if fsm.debug {
                    println!(
                        "Packet {} OK ({} of {} bytes)",
                        sequence, fsm.bytes_written, fsm.declared_size
                    );
                }
                fsm.serial.write_all(&[ACK])?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState<'a> + 'a>)
            }
            PacketOutcome::EndOfTransmission => {
                if let Err(e) = fsm.storage.sync() {
                    if fsm.debug { println!("Final sync failed: {}", e); }
                    return Err(fsm.storage_fault());
                }
                fsm.close_storage();
                fsm.serial.write_all(&[ACK])?;
                if fsm.debug {
                    println!("EOT: '{}' complete ({} bytes)", fsm.filename, fsm.bytes_written);
                }
                Err(ReceiverError::SessionEnd(TransferOutcome::FileReceived {
                    filename: fsm.filename,
                    size: fsm.bytes_written,
                }))
            }
            PacketOutcome::CancelPair => Err(fsm.cancelled_by_sender()),
            PacketOutcome::SenderAbort => Err(fsm.sender_abort()),
            PacketOutcome::Timeout | PacketOutcome::FramingError => {
                fsm.transient_failure()?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState<'a> + 'a>)
            }
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> ReceiverFsm<'a, WaitHeader> {
    pub fn new(
        serial: &'a mut dyn SerialPort,
        storage: &'a mut dyn Storage,
        sync_every: Option<u32>,
        debug: bool,
    ) -> Box<dyn ReceiverState<'a> + 'a> {
        Box::new(ReceiverFsm {
            state: PhantomData::<WaitHeader>,
            serial,
            storage,
            filename: String::new(),
            declared_size: 0,
            bytes_written: 0,
            expected_sequence: 0,
            consecutive_errors: 0,
            transfer_started: false,
            file_open: false,
            packets_since_sync: 0,
            sync_every,
            debug,
        })
    }
}

fn drive(
    serial: &mut dyn SerialPort,
    storage: &mut dyn Storage,
    sync_every: Option<u32>,
    debug: bool,
) -> Result<TransferOutcome, std::io::Error> {
    let mut fsm = ReceiverFsm::new(serial, storage, sync_every, debug);
    loop {
        match fsm.step() {
            Ok(next) => fsm = next,
            Err(ReceiverError::SessionEnd(outcome)) => return Ok(outcome),
            Err(ReceiverError::Io(e)) => return Err(e),
        }
    }
}

/// Receive one YMODEM session: a single file, or the empty header that ends a
/// batch. Callers expecting several files run one session per file.
///
/// The storage handle is released on every exit path, including a transport
/// failure mid-transfer.
pub fn receive_file(
    serial: &mut dyn SerialPort,
    storage: &mut dyn Storage,
    sync_every: Option<u32>,
    debug: bool,
) -> Result<TransferOutcome, std::io::Error> {
    match drive(&mut *serial, &mut *storage, sync_every, debug) {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // The transport died mid-session and took the FSM with it;
            // release whatever the session had open.
            storage.close();
            Err(e)
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Split a header payload into filename and declared size.
///
/// Wire layout: NUL-terminated filename, then the decimal file size
/// terminated by a space. Both fields truncate at their bounds rather than
/// reject; digits stop at the first non-digit; a missing size parses as zero.
fn parse_header(payload: &[u8]) -> (String, u64) {
    let name_end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let filename = String::from_utf8_lossy(&payload[..name_end.min(FILE_NAME_LENGTH)]).into_owned();

    let mut size: u64 = 0;
    if name_end < payload.len() {
        for &b in payload[name_end + 1..].iter().take(FILE_SIZE_LENGTH) {
            match b {
                b'0'..=b'9' => size = size * 10 + u64::from(b - b'0'),
                _ => break,
            }
        }
    }

    (filename, size)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::compute_crc16;
    use crate::serial::MockSerialPort;
    use crate::storage::MockStorage;

    fn push_packet(responses: &mut Vec<Option<u8>>, control: u8, sequence: u8, payload: &[u8]) {
        let size = if control == STX { PACKET_1K_SIZE } else { PACKET_SIZE };
        let mut padded = payload.to_vec();
        padded.resize(size, DATA_PAD);
        let crc = compute_crc16(&padded);

        responses.push(Some(control));
        responses.push(Some(sequence));
        responses.push(Some(sequence ^ 0xFF));
        responses.extend(padded.iter().map(|&b| Some(b)));
        responses.push(Some((crc >> 8) as u8));
        responses.push(Some((crc & 0xFF) as u8));
    }

    fn push_header(responses: &mut Vec<Option<u8>>, name: &str, size: u64) {
        let mut payload = Vec::new();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(size.to_string().as_bytes());
        payload.push(b' ');
        payload.resize(PACKET_SIZE, 0);
        push_packet(responses, SOH, 0, &payload);
    }

    fn run(
        responses: Vec<Option<u8>>,
        expected_writes: Vec<u8>,
        storage: &mut MockStorage,
        sync_every: Option<u32>,
    ) -> TransferOutcome {
        let mut serial = MockSerialPort::new(responses, expected_writes);
        receive_file(&mut serial, storage, sync_every, true)
            .expect("mock transport never hard-fails")
    }

    #[test]
    fn test_receive_single_file() {
        let mut responses = Vec::new();
        push_header(&mut responses, "hello.txt", 9);
        push_packet(&mut responses, SOH, 1, b"Test data");
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, ACK];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "hello.txt".to_string(),
                size: 9
            }
        );
        assert_eq!(storage.opened_name(), Some("hello.txt"));
        assert_eq!(storage.written(), b"Test data");
        assert_eq!(storage.sync_calls(), 1);
        assert_eq!(storage.close_calls(), 1);
    }

    #[test]
    fn test_idle_wait_solicits_without_counting_errors() {
        // More leading timeouts than the whole error budget; the transfer
        // must still go through because nothing has started yet.
        let mut responses = vec![None; (MAX_ERRORS + 2) as usize];
        push_header(&mut responses, "late.bin", 4);
        push_packet(&mut responses, SOH, 1, b"abcd");
        responses.push(Some(EOT));

        let mut expected_writes = vec![CRC_REQUEST; (MAX_ERRORS + 2) as usize];
        expected_writes.extend_from_slice(&[ACK, CRC_REQUEST, ACK, ACK]);

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "late.bin".to_string(),
                size: 4
            }
        );
        assert_eq!(storage.written(), b"abcd");
    }

    #[test]
    fn test_receive_1k_packets_exact_size() {
        let mut content = Vec::new();
        for i in 0..1500usize {
            content.push((i % 256) as u8);
        }

        let mut responses = Vec::new();
        push_header(&mut responses, "big.bin", 1500);
        push_packet(&mut responses, STX, 1, &content[..1024]);
        push_packet(&mut responses, STX, 2, &content[1024..]);
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, ACK, ACK];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "big.bin".to_string(),
                size: 1500
            }
        );
        assert_eq!(storage.written().len(), 1500);
        assert_eq!(storage.written(), &content[..]);
    }

    #[test]
    fn test_replayed_packet_gets_nak_without_duplicate_write() {
        let first = [0x11u8; PACKET_SIZE];
        let second = [0x22u8; 72];

        let mut responses = Vec::new();
        push_header(&mut responses, "dup.bin", 200);
        push_packet(&mut responses, SOH, 1, &first);
        // Sender missed the ACK and replays packet 1
        push_packet(&mut responses, SOH, 1, &first);
        push_packet(&mut responses, SOH, 2, &second);
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, NAK, ACK, ACK];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "dup.bin".to_string(),
                size: 200
            }
        );
        let mut expected_content = first.to_vec();
        expected_content.extend_from_slice(&second);
        assert_eq!(storage.written(), &expected_content[..]);
    }

    #[test]
    fn test_replayed_header_gets_nak() {
        let mut responses = Vec::new();
        push_header(&mut responses, "again.txt", 5);
        // Sender missed the ACK and replays the header
        push_header(&mut responses, "again.txt", 5);
        push_packet(&mut responses, SOH, 1, b"hello");
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, NAK, ACK, ACK];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "again.txt".to_string(),
                size: 5
            }
        );
        assert_eq!(storage.open_calls(), 1);
        assert_eq!(storage.written(), b"hello");
    }

    #[test]
    fn test_corrupt_packet_is_retried() {
        let mut responses = Vec::new();
        push_header(&mut responses, "noisy.bin", 7);

        // A data packet with one payload bit flipped after the CRC was taken
        let start = responses.len();
        push_packet(&mut responses, SOH, 1, b"payload");
        let corrupt_at = start + 3 + 2;
        responses[corrupt_at] = responses[corrupt_at].map(|b| b ^ 0x40);

        // The retransmission, intact this time
        push_packet(&mut responses, SOH, 1, b"payload");
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, CRC_REQUEST, ACK, ACK];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "noisy.bin".to_string(),
                size: 7
            }
        );
        assert_eq!(storage.written(), b"payload");
    }

    #[test]
    fn test_empty_header_ends_batch() {
        let mut responses = Vec::new();
        push_packet(&mut responses, SOH, 0, &[0u8; PACKET_SIZE]);

        let expected_writes = vec![ACK];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(outcome, TransferOutcome::NoMoreFiles);
        assert_eq!(storage.open_calls(), 0);
        assert_eq!(storage.close_calls(), 0);
    }

    #[test]
    fn test_cancel_pair_aborts_and_closes() {
        let mut responses = Vec::new();
        push_header(&mut responses, "partial.bin", 256);
        push_packet(&mut responses, SOH, 1, &[0xAB; PACKET_SIZE]);
        responses.push(Some(CA));
        responses.push(Some(CA));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, ACK];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(outcome, TransferOutcome::Aborted);
        assert_eq!(storage.close_calls(), 1);
    }

    #[test]
    fn test_console_abort_sends_cancel_pair() {
        let mut responses = Vec::new();
        push_header(&mut responses, "partial.bin", 256);
        responses.push(Some(ABORT1));

        let expected_writes = vec![ACK, CRC_REQUEST, CA, CA];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(outcome, TransferOutcome::Aborted);
        assert_eq!(storage.close_calls(), 1);
    }

    #[test]
    fn test_error_budget_exhaustion_fails_transfer() {
        let mut responses = Vec::new();
        push_header(&mut responses, "stuck.bin", 1024);
        push_packet(&mut responses, SOH, 1, &[0x01; PACKET_SIZE]);
        // One more consecutive timeout than the budget tolerates
        responses.extend(std::iter::repeat(None).take((MAX_ERRORS + 1) as usize));

        let mut expected_writes = vec![ACK, CRC_REQUEST, ACK];
        expected_writes.extend(std::iter::repeat(CRC_REQUEST).take(MAX_ERRORS as usize));
        expected_writes.extend_from_slice(&[CA, CA]);

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(outcome, TransferOutcome::TooManyErrors);
        assert_eq!(storage.close_calls(), 1);
    }

    #[test]
    fn test_error_budget_recovers_within_threshold() {
        let mut responses = Vec::new();
        push_header(&mut responses, "slow.bin", 256);
        push_packet(&mut responses, SOH, 1, &[0x01; PACKET_SIZE]);
        // Exactly the budget: the transfer must still recover
        responses.extend(std::iter::repeat(None).take(MAX_ERRORS as usize));
        push_packet(&mut responses, SOH, 2, &[0x02; PACKET_SIZE]);
        responses.push(Some(EOT));

        let mut expected_writes = vec![ACK, CRC_REQUEST, ACK];
        expected_writes.extend(std::iter::repeat(CRC_REQUEST).take(MAX_ERRORS as usize));
        expected_writes.extend_from_slice(&[ACK, ACK]);

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "slow.bin".to_string(),
                size: 256
            }
        );
        assert_eq!(storage.written().len(), 256);
    }

    #[test]
    fn test_storage_mount_failure() {
        let mut responses = Vec::new();
        push_header(&mut responses, "nowhere.bin", 10);

        let expected_writes = vec![CA, CA];

        let mut storage = MockStorage::new();
        storage.fail_mount = true;
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(outcome, TransferOutcome::StorageFault);
        assert_eq!(storage.open_calls(), 0);
        assert_eq!(storage.close_calls(), 0);
    }

    #[test]
    fn test_storage_open_failure() {
        let mut responses = Vec::new();
        push_header(&mut responses, "nowhere.bin", 10);

        let expected_writes = vec![CA, CA];

        let mut storage = MockStorage::new();
        storage.fail_open = true;
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(outcome, TransferOutcome::StorageFault);
        assert_eq!(storage.close_calls(), 0);
    }

    #[test]
    fn test_storage_write_failure_stops_transfer() {
        let mut responses = Vec::new();
        push_header(&mut responses, "doomed.bin", 256);
        push_packet(&mut responses, SOH, 1, &[0xCD; PACKET_SIZE]);

        let expected_writes = vec![ACK, CRC_REQUEST, CA, CA];

        let mut storage = MockStorage::new();
        storage.fail_write_at = Some(1);
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(outcome, TransferOutcome::StorageFault);
        assert_eq!(storage.close_calls(), 1);
        assert!(storage.written().is_empty());
    }

    #[test]
    fn test_storage_short_write_is_a_fault() {
        let mut responses = Vec::new();
        push_header(&mut responses, "short.bin", 256);
        push_packet(&mut responses, SOH, 1, &[0xCD; PACKET_SIZE]);

        let expected_writes = vec![ACK, CRC_REQUEST, CA, CA];

        let mut storage = MockStorage::new();
        storage.short_write_at = Some(1);
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(outcome, TransferOutcome::StorageFault);
        assert_eq!(storage.close_calls(), 1);
    }

    #[test]
    fn test_storage_sync_failure_at_eot() {
        let mut responses = Vec::new();
        push_header(&mut responses, "unsynced.bin", 128);
        push_packet(&mut responses, SOH, 1, &[0xEF; PACKET_SIZE]);
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, CA, CA];

        let mut storage = MockStorage::new();
        storage.fail_sync = true;
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(outcome, TransferOutcome::StorageFault);
        assert_eq!(storage.close_calls(), 1);
    }

    #[test]
    fn test_final_packet_padding_is_discarded() {
        let tail = [0x5Au8; 2];

        let mut responses = Vec::new();
        push_header(&mut responses, "odd.bin", 130);
        push_packet(&mut responses, SOH, 1, &[0x33; PACKET_SIZE]);
        push_packet(&mut responses, SOH, 2, &tail);
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, ACK, ACK];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "odd.bin".to_string(),
                size: 130
            }
        );
        assert_eq!(storage.written().len(), 130);
        assert_eq!(&storage.written()[128..], &tail);
    }

    #[test]
    fn test_zero_length_file() {
        let mut responses = Vec::new();
        push_header(&mut responses, "empty.txt", 0);
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK];

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "empty.txt".to_string(),
                size: 0
            }
        );
        assert!(storage.written().is_empty());
        assert_eq!(storage.close_calls(), 1);
    }

    #[test]
    fn test_sequence_wraps_mod_256() {
        let packets = 300usize;
        let declared = (packets * PACKET_SIZE) as u64;

        let mut responses = Vec::new();
        push_header(&mut responses, "wrap.bin", declared);
        for i in 0..packets {
            let sequence = ((i + 1) % 256) as u8;
            push_packet(&mut responses, SOH, sequence, &[i as u8; PACKET_SIZE]);
        }
        responses.push(Some(EOT));

        let mut expected_writes = vec![ACK, CRC_REQUEST];
        expected_writes.extend(std::iter::repeat(ACK).take(packets));
        expected_writes.push(ACK);

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, None);

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "wrap.bin".to_string(),
                size: declared
            }
        );
        assert_eq!(storage.written().len(), packets * PACKET_SIZE);
        // Spot-check a byte past the wrap point
        assert_eq!(storage.written()[256 * PACKET_SIZE], 0x00);
    }

    #[test]
    fn test_periodic_sync_interval() {
        let mut responses = Vec::new();
        push_header(&mut responses, "synced.bin", 512);
        for seq in 1..=4u8 {
            push_packet(&mut responses, SOH, seq, &[seq; PACKET_SIZE]);
        }
        responses.push(Some(EOT));

        let mut expected_writes = vec![ACK, CRC_REQUEST];
        expected_writes.extend(std::iter::repeat(ACK).take(4));
        expected_writes.push(ACK);

        let mut storage = MockStorage::new();
        let outcome = run(responses, expected_writes, &mut storage, Some(2));

        assert_eq!(
            outcome,
            TransferOutcome::FileReceived {
                filename: "synced.bin".to_string(),
                size: 512
            }
        );
        // After packets 2 and 4, plus the unconditional one at EOT
        assert_eq!(storage.sync_calls(), 3);
    }

    #[test]
    fn test_parse_header_name_and_size() {
        let mut payload = b"firmware.bin\x00261424 ".to_vec();
        payload.resize(PACKET_SIZE, 0);
        assert_eq!(parse_header(&payload), ("firmware.bin".to_string(), 261424));
    }

    #[test]
    fn test_parse_header_size_stops_at_non_digit() {
        let mut payload = b"f.bin\x0042x99 ".to_vec();
        payload.resize(PACKET_SIZE, 0);
        assert_eq!(parse_header(&payload), ("f.bin".to_string(), 42));
    }

    #[test]
    fn test_parse_header_missing_size_is_zero() {
        let mut payload = b"nameonly\x00".to_vec();
        payload.resize(PACKET_SIZE, 0);
        assert_eq!(parse_header(&payload), ("nameonly".to_string(), 0));
    }

    #[test]
    fn test_parse_header_truncates_long_name() {
        let long_name = "n".repeat(FILE_NAME_LENGTH + 20);
        let mut payload = long_name.clone().into_bytes();
        payload.push(0);
        payload.extend_from_slice(b"7 ");
        payload.resize(PACKET_SIZE + PACKET_SIZE, 0);

        let (name, size) = parse_header(&payload);
        assert_eq!(name.len(), FILE_NAME_LENGTH);
        assert_eq!(name, long_name[..FILE_NAME_LENGTH]);
        assert_eq!(size, 7);
    }

    #[test]
    fn test_parse_header_bounds_size_field() {
        // 17 digits; only the first 16 may contribute
        let mut payload = b"big\x0012345678901234567 ".to_vec();
        payload.resize(PACKET_SIZE, 0);
        assert_eq!(parse_header(&payload), ("big".to_string(), 1234567890123456));
    }

    #[test]
    fn test_parse_header_without_terminator() {
        let payload = [b'x'; PACKET_SIZE];
        let (name, size) = parse_header(&payload);
        assert_eq!(name.len(), FILE_NAME_LENGTH);
        assert_eq!(size, 0);
    }
}
