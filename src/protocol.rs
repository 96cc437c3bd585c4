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

//! YMODEM protocol constants

use std::time::Duration;

/// Start of header - begins a 128-byte data packet
pub const SOH: u8 = 0x01;

/// Start of text - begins a 1024-byte data packet
pub const STX: u8 = 0x02;

/// End of transmission - sender has no more data for the current file
pub const EOT: u8 = 0x04;

/// Acknowledge - packet accepted
pub const ACK: u8 = 0x06;

/// Negative acknowledge - sequence mismatch, retransmit the packet
pub const NAK: u8 = 0x15;

/// Cancel - two in succession abort the session
pub const CA: u8 = 0x18;

/// 'C' - receiver requests a CRC-mode packet (initial solicit and every retry)
pub const CRC_REQUEST: u8 = b'C';

/// 'A' - abort requested at the sender's console
pub const ABORT1: u8 = b'A';

/// 'a' - abort requested at the sender's console
pub const ABORT2: u8 = b'a';

/// Padding byte filling the tail of a short data packet
pub const DATA_PAD: u8 = 0x1A;

/// Payload size of a SOH packet
pub const PACKET_SIZE: usize = 128;

/// Payload size of a STX packet
pub const PACKET_1K_SIZE: usize = 1024;

/// Sequence byte plus complement byte preceding the payload
pub const PACKET_HEADER_SIZE: usize = 2;

/// Big-endian CRC16 following the payload
pub const PACKET_TRAILER_SIZE: usize = 2;

/// Maximum filename length accepted from a header packet
pub const FILE_NAME_LENGTH: usize = 64;

/// Maximum decimal digits accepted in the header size field
pub const FILE_SIZE_LENGTH: usize = 16;

/// Consecutive transient failures tolerated once a transfer has begun
pub const MAX_ERRORS: u32 = 10;

/// How long the receiver waits for the next packet before re-requesting
pub const PACKET_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the sender waits for a reply byte from the receiver
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
