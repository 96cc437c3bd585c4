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

use std::time::Duration;
use crate::crc::compute_crc16;
use crate::protocol::*;
use crate::serial::SerialPort;

// ============================================================================
// Packet Outcomes
// ============================================================================

/// Result of one attempt to read a framed packet off the wire.
///
/// Retry policy lives entirely in the session controller; this layer only
/// classifies what arrived.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Structurally valid packet: sequence checked against its complement,
    /// payload checked against its CRC16 trailer
    Data { sequence: u8, payload: Vec<u8> },
    /// EOT - the current file is complete
    EndOfTransmission,
    /// Two CA bytes in succession - sender cancelled the session
    CancelPair,
    /// ABORT1/ABORT2 - abort typed at the sender's console
    SenderAbort,
    /// Nothing arrived within the timeout
    Timeout,
    /// Unknown control byte, lone CA, short body, bad complement or bad CRC
    FramingError,
}

// ============================================================================
// Packet Reception
// ============================================================================

/// Read one packet from the serial port.
///
/// Returns `Err` only for hard transport failures; timeouts and malformed
/// frames are reported through [`PacketOutcome`].
pub fn receive_packet(
    serial: &mut dyn SerialPort,
    timeout: Duration,
) -> std::io::Result<PacketOutcome> {
    let control = match serial.read_byte(timeout) {
        Ok(byte) => byte,
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            return Ok(PacketOutcome::Timeout);
        }
        Err(e) => return Err(e),
    };

    let payload_size = match control {
        SOH => PACKET_SIZE,
        STX => PACKET_1K_SIZE,
        EOT => return Ok(PacketOutcome::EndOfTransmission),
        CA => {
            // Cancellation requires a second CA within the same timeout
            return match serial.read_byte(timeout) {
                Ok(CA) => Ok(PacketOutcome::CancelPair),
                Ok(_) => Ok(PacketOutcome::FramingError),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    Ok(PacketOutcome::FramingError)
                }
                Err(e) => Err(e),
            };
        }
        ABORT1 | ABORT2 => return Ok(PacketOutcome::SenderAbort),
        _ => return Ok(PacketOutcome::FramingError),
    };

    let mut body = vec![0u8; PACKET_HEADER_SIZE + payload_size + PACKET_TRAILER_SIZE];
    match serial.read_exact_timeout(&mut body, timeout) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            return Ok(PacketOutcome::FramingError);
        }
        Err(e) => return Err(e),
    }

    let sequence = body[0];
    if body[1] != (sequence ^ 0xFF) {
        return Ok(PacketOutcome::FramingError);
    }

    let payload = &body[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + payload_size];
    let trailer = (u16::from(body[PACKET_HEADER_SIZE + payload_size]) << 8)
        | u16::from(body[PACKET_HEADER_SIZE + payload_size + 1]);
    if compute_crc16(payload) != trailer {
        return Ok(PacketOutcome::FramingError);
    }

    Ok(PacketOutcome::Data {
        sequence,
        payload: payload.to_vec(),
    })
}

// ============================================================================
// Tests
// ============================================================================
