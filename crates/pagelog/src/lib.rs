//! Undo log for crash recovery.
//!
//! Before a page of the heap file is overwritten for the first time after a
//! checkpoint, its pre-image is appended here. Reopening the store after a
//! crash replays every complete undo frame, returning the file to its state
//! at the last checkpoint; a checkpoint rotates the log once all dirty state
//! has reached the heap file.
//!
//! Frames are length-prefixed (4-byte LE) bincode, so replay can iterate
//! forward safely and a torn tail frame from a crash mid-append is ignored
//! rather than treated as corruption.
//!
//! # Example
//!
//! ```no_run
//! use pagelog::{PageLog, UndoRecord};
//!
//! let mut log = PageLog::open("data/heap.undo").unwrap();
//! log.add_undo(7, &vec![0u8; 4096]).unwrap();
//! log.sync().unwrap();
//!
//! // On recovery, write each pre-image back at page_id * page_size.
//! for rec in PageLog::replay("data/heap.undo").unwrap() {
//!     let _ = (rec.page_id, rec.image);
//! }
//! ```

#[cfg(test)]
mod tests;

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

/// Pre-image of one page, captured before its first overwrite in a log
/// session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub page_id: u32,
    pub image: Vec<u8>,
}

/// Append-only undo log manager.
#[derive(Debug)]
pub struct PageLog {
    path: PathBuf,
    file: File,
}

impl PageLog {
    /// Open or create the undo log at the given path, preserving existing
    /// frames.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, "open", e))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        let meta = self
            .file
            .metadata()
            .map_err(|e| io_err(&self.path, "metadata", e))?;
        Ok(meta.len() == 0)
    }

    /// Append one pre-image frame. The write is flushed but not fsynced;
    /// call [`PageLog::sync`] before overwriting the page on disk.
    pub fn add_undo(&mut self, page_id: u32, image: &[u8]) -> StoreResult<()> {
        let rec = UndoRecord {
            page_id,
            image: image.to_vec(),
        };
        let bytes = encode_to_vec(&rec, bincode_config())
            .map_err(|e| StoreError::Internal(format!("serialize undo frame: {e}")))?;

        let len = bytes.len() as u32;
        self.file
            .write_all(&len.to_le_bytes())
            .map_err(|e| io_err(&self.path, "write", e))?;
        self.file
            .write_all(&bytes)
            .map_err(|e| io_err(&self.path, "write", e))?;
        self.file
            .flush()
            .map_err(|e| io_err(&self.path, "flush", e))
    }

    /// Fsync the log so every appended frame is durable.
    pub fn sync(&mut self) -> StoreResult<()> {
        self.file
            .sync_all()
            .map_err(|e| io_err(&self.path, "sync", e))
    }

    /// Read all complete undo frames, oldest first.
    ///
    /// Stops cleanly at EOF or at a torn tail frame; a frame that is fully
    /// present but undecodable is corruption.
    pub fn replay(path: impl AsRef<Path>) -> StoreResult<Vec<UndoRecord>> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| io_err(path, "open", e))?;

        let mut records = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match read_exact_or_eof(&mut file, &mut len_buf) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return Err(io_err(path, "read", e)),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut buf = vec![0u8; len];
            match read_exact_or_eof(&mut file, &mut buf) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return Err(io_err(path, "read", e)),
            }

            let (rec, _) = decode_from_slice(&buf, bincode_config())
                .map_err(|e| StoreError::Corrupted(format!("undo frame: {e}")))?;
            records.push(rec);
        }
        Ok(records)
    }

    /// Rotate the log at a checkpoint: discard all frames and fsync, so the
    /// next session starts empty.
    pub fn reopen(&mut self) -> StoreResult<()> {
        drop(std::mem::replace(
            &mut self.file,
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)
                .map_err(|e| io_err(&self.path, "truncate", e))?,
        ));
        self.file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, "open", e))?;
        self.sync()
    }
}

/// Returns Ok(false) on EOF before or during the read (torn frame).
fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

fn io_err(path: &Path, op: &'static str, source: std::io::Error) -> StoreError {
    StoreError::Io {
        file: path.display().to_string(),
        op,
        source,
    }
}

fn bincode_config() -> impl Config {
    config::legacy()
}
