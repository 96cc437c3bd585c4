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

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

// ============================================================================
// Storage Trait
// ============================================================================

/// Trait for the destination sink a received file is committed to.
///
/// The receive session owns the sink exclusively for the duration of one
/// transfer and closes it on every terminal path.
pub trait Storage: Send {
    /// Prepare the backing medium. Called once per session before `open`.
    fn mount(&mut self) -> std::io::Result<()>;

    /// Create the named destination file, truncating any existing one.
    fn open(&mut self, name: &str) -> std::io::Result<()>;

    /// Append bytes to the open file, returning how many were committed.
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize>;

    /// Flush buffered data to the medium.
    fn sync(&mut self) -> std::io::Result<()>;

    /// Release the destination file. Safe to call when nothing is open.
    fn close(&mut self);
}

// ============================================================================
// Directory-Backed Storage
// ============================================================================

/// Storage sink writing received files into a target directory
pub struct DirStorage {
    output_dir: PathBuf,
    file: Option<File>,
}

impl DirStorage {
    pub fn new(output_dir: PathBuf) -> Self {
        DirStorage {
            output_dir,
            file: None,
        }
    }
}

impl Storage for DirStorage {
    fn mount(&mut self) -> std::io::Result<()> {
        if self.output_dir.is_dir() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Output directory not found: {}", self.output_dir.display()),
            ))
        }
    }

    fn open(&mut self, name: &str) -> std::io::Result<()> {
        // The name arrives over the wire; keep only its final component so a
        // hostile sender cannot write outside the output directory.
        let base = Path::new(name)
            .file_name()
            .ok_or_else(|| std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unusable filename: {:?}", name),
            ))?;

        self.file = Some(File::create(self.output_dir.join(base))?);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match self.file {
            Some(ref mut file) => {
                file.write_all(data)?;
                Ok(data.len())
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "No file open",
            )),
        }
    }

    fn sync(&mut self) -> std::io::Result<()> {
        match self.file {
            Some(ref file) => file.sync_all(),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.file = None;
    }
}

// ============================================================================
// Mock Storage for Testing
// ============================================================================

#[cfg(test)]
pub struct MockStorage {
    // Accumulated file content
    data: Vec<u8>,
    opened_name: Option<String>,
    is_open: bool,
    // Call counters
    open_calls: u32,
    sync_calls: u32,
    close_calls: u32,
    write_calls: u32,
    // Fault injection
    pub fail_mount: bool,
    pub fail_open: bool,
    pub fail_sync: bool,
    pub fail_write_at: Option<u32>,
    pub short_write_at: Option<u32>,
}

#[cfg(test)]
impl MockStorage {
    pub fn new() -> Self {
        MockStorage {
            data: Vec::new(),
            opened_name: None,
            is_open: false,
            open_calls: 0,
            sync_calls: 0,
            close_calls: 0,
            write_calls: 0,
            fail_mount: false,
            fail_open: false,
            fail_sync: false,
            fail_write_at: None,
            short_write_at: None,
        }
    }

    pub fn written(&self) -> &[u8] {
        &self.data
    }

    pub fn opened_name(&self) -> Option<&str> {
        self.opened_name.as_deref()
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls
    }

    pub fn sync_calls(&self) -> u32 {
        self.sync_calls
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls
    }
}

#[cfg(test)]
impl Storage for MockStorage {
    fn mount(&mut self) -> std::io::Result<()> {
        if self.fail_mount {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "Mock mount failure"))
        } else {
            Ok(())
        }
    }

    fn open(&mut self, name: &str) -> std::io::Result<()> {
        self.open_calls += 1;
        if self.fail_open {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "Mock open failure"))
        } else {
            self.opened_name = Some(name.to_string());
            self.is_open = true;
            Ok(())
        }
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        assert!(self.is_open, "write with no file open");
        self.write_calls += 1;
        if self.fail_write_at == Some(self.write_calls) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "Mock write failure"));
        }
        if self.short_write_at == Some(self.write_calls) {
            let short = data.len().saturating_sub(1);
            self.data.extend_from_slice(&data[..short]);
            return Ok(short);
        }
        self.data.extend_from_slice(data);
        Ok(data.len())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        assert!(self.is_open, "sync with no file open");
        self.sync_calls += 1;
        if self.fail_sync {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "Mock sync failure"))
        } else {
            Ok(())
        }
    }

    fn close(&mut self) {
        self.close_calls += 1;
        self.is_open = false;
    }
}

#[cfg(test)]
impl Drop for MockStorage {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                !self.is_open,
                "MockStorage dropped with '{}' still open",
                self.opened_name.as_deref().unwrap_or("?")
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_storage_round_trip() {
        let dir = std::env::temp_dir();
        let mut storage = DirStorage::new(dir.clone());

        storage.mount().expect("temp dir should mount");
        storage.open("dir_storage_rt.bin").expect("should open");
        assert_eq!(storage.write(b"hello ").unwrap(), 6);
        assert_eq!(storage.write(b"world").unwrap(), 5);
        storage.sync().expect("should sync");
        storage.close();

        let path = dir.join("dir_storage_rt.bin");
        let content = std::fs::read(&path).expect("should read back");
        assert_eq!(content, b"hello world");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_dir_storage_missing_dir_fails_mount() {
        let mut storage = DirStorage::new(PathBuf::from("/nonexistent/ymodem-out"));
        assert!(storage.mount().is_err());
    }

    #[test]
    fn test_dir_storage_strips_path_components() {
        let dir = std::env::temp_dir();
        let mut storage = DirStorage::new(dir.clone());

        storage.open("../sub/dir/escape_test.bin").expect("should open");
        storage.write(b"x").unwrap();
        storage.close();

        let path = dir.join("escape_test.bin");
        assert!(path.exists(), "file should land in the output directory");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_dir_storage_write_without_open() {
        let mut storage = DirStorage::new(std::env::temp_dir());
        assert!(storage.write(b"x").is_err());
    }
}
