//! Byte-oriented heap file handle and the cursor buffer used to build and
//! parse on-disk structures.
//!
//! [`FileStore`] wraps one file and exposes positioned reads and writes;
//! every failure is wrapped once with the file name and the operation that
//! failed. [`DataPage`] is a fixed-size byte buffer with a cursor for typed
//! big-endian reads and writes, used for page images and record
//! serialization.


use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use common::{StoreError, StoreResult};

/// Thin handle over the heap file: positioned read/write, length, sync.
///
/// The handle closes on drop; a store opened read-only refuses writes.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    name: String,
    read_only: bool,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> StoreResult<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::Io {
                file: name.clone(),
                op: "open",
                source: e,
            })?;
        Ok(Self {
            file,
            name,
            read_only,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn io_err(&self, op: &'static str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            file: self.name.clone(),
            op,
            source,
        }
    }

    pub fn length(&self) -> StoreResult<u64> {
        let meta = self
            .file
            .metadata()
            .map_err(|e| self.io_err("metadata", e))?;
        Ok(meta.len())
    }

    pub fn set_length(&mut self, len: u64) -> StoreResult<()> {
        self.ensure_writable()?;
        self.file
            .set_len(len)
            .map_err(|e| self.io_err("set-length", e))
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub fn read_fully(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err("seek", e))?;
        self.file
            .read_exact(buf)
            .map_err(|e| self.io_err("read", e))
    }

    pub fn write(&mut self, offset: u64, buf: &[u8]) -> StoreResult<()> {
        self.ensure_writable()?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err("seek", e))?;
        self.file
            .write_all(buf)
            .map_err(|e| self.io_err("write", e))
    }

    pub fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_all().map_err(|e| self.io_err("sync", e))
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }
}

/// Mutable byte buffer with a cursor for big-endian primitive access.
///
/// Reads past the end signal `Corrupted` (the buffer holds disk bytes that
/// claimed to be longer than they are); writes past the end signal
/// `Internal` (the writer sized the buffer).
#[derive(Clone, Debug)]
pub struct DataPage {
    data: Vec<u8>,
    pos: usize,
}

impl DataPage {
    /// A zero-filled buffer of `len` bytes with the cursor at 0.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
            pos: 0,
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn check_read(&self, n: usize) -> StoreResult<()> {
        if self.remaining() < n {
            return Err(StoreError::Corrupted(format!(
                "read of {n} bytes at offset {} past end of {}-byte buffer",
                self.pos,
                self.data.len()
            )));
        }
        Ok(())
    }

    fn check_write(&self, n: usize) -> StoreResult<()> {
        if self.remaining() < n {
            return Err(StoreError::Internal(format!(
                "write of {n} bytes at offset {} past end of {}-byte buffer",
                self.pos,
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> StoreResult<u8> {
        self.check_read(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn write_u8(&mut self, v: u8) -> StoreResult<()> {
        self.check_write(1)?;
        self.data[self.pos] = v;
        self.pos += 1;
        Ok(())
    }

    pub fn read_u32(&mut self) -> StoreResult<u32> {
        self.check_read(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn write_u32(&mut self, v: u32) -> StoreResult<()> {
        self.check_write(4)?;
        self.data[self.pos..self.pos + 4].copy_from_slice(&v.to_be_bytes());
        self.pos += 4;
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> StoreResult<&[u8]> {
        self.check_read(len)?;
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> StoreResult<()> {
        self.check_write(bytes.len())?;
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// XOR of all bytes in `range`, the record trailer checksum.
    pub fn xor_checksum(&self, range: std::ops::Range<usize>) -> u8 {
        self.data[range].iter().fold(0u8, |acc, b| acc ^ b)
    }
}
