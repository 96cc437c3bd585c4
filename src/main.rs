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

// YMODEM protocol implementation
mod crc;
mod packet;
mod protocol;
mod receiver;
mod sender;
mod serial;
mod storage;

use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::path::PathBuf;
use receiver::{receive_file, TransferOutcome};
use serial::RealSerialPort;
use storage::DirStorage;

#[derive(Parser)]
#[command(name = "ymodem")]
#[command(about = "YMODEM protocol implementation for RS-232 file transfer", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files using the YMODEM protocol
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Receive files using the YMODEM protocol
    Receive {
        /// Directory to save received files
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Sync storage every N accepted packets (default: only at end of file)
        #[arg(long, value_name = "N")]
        sync_every: Option<u32>,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn main() {
    let cli = Cli::parse();

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Opening serial port: {}", cli.port);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Send { files } => {
            println!("\nSending {} file(s)", files.len());
            if let Err(e) = send_files(serial_port, files, cli.debug) {
                eprintln!("Send failed: {}", e);
                std::process::exit(1);
            }
            println!("\nAll files sent successfully!");
        }
        Commands::Receive { output_dir, sync_every } => {
            println!("\nReceiving files to: {}", output_dir.display());
            if let Err(e) = receive_files(serial_port, output_dir, sync_every, cli.debug) {
                eprintln!("Receive failed: {}", e);
                std::process::exit(1);
            }
            println!("\nFiles received successfully!");
        }
    }
}

fn send_files(serial_port: RealSerialPort, files: Vec<PathBuf>, debug: bool) -> Result<(), sender::SenderError> {
    use sender::{SenderFsm, SenderError};

    for file in &files {
        if !file.exists() {
            return Err(SenderError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("File not found: {}", file.display()),
            )));
        }
    }

    let mut state = SenderFsm::new(Box::new(serial_port), files, debug);

    loop {
        match state.step() {
            Ok(next_state) => {
                state = next_state;
            }
            Err(SenderError::TransferComplete) => {
                return Ok(());
            }
            Err(e) => {
                return Err(e);
            }
        }
    }
}

fn receive_files(
    mut serial_port: RealSerialPort,
    output_dir: PathBuf,
    sync_every: Option<u32>,
    debug: bool,
) -> Result<(), std::io::Error> {
    if !output_dir.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Output directory not found: {}", output_dir.display()),
        ));
    }

    let mut storage = DirStorage::new(output_dir);

    // One session per file; the batch ends with an empty header packet
    loop {
        match receive_file(&mut serial_port, &mut storage, sync_every, debug)? {
            TransferOutcome::FileReceived { filename, size } => {
                println!("Received: {} ({} bytes)", filename, size);
            }
            TransferOutcome::NoMoreFiles => {
                return Ok(());
            }
            outcome => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    outcome.to_string(),
                ));
            }
        }
    }
}
