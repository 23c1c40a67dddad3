//! Write-ahead log with CRC32 integrity checks.
//!
//! On-disk format, all integers big-endian:
//!
//! ```text
//! [4B entry_size][record][4B CRC32]
//! record := 1B op | 8B ts | 4B klen | key | 4B vlen | value | 4B olen | origin
//! ```
//!
//! `entry_size` covers the record only. The CRC is computed over the
//! record bytes. The origin field is a later addition; records that end
//! right after the value replay with an empty origin.
//!
//! Recovery yields the longest valid prefix: a torn tail or a corrupt
//! record stops replay at that point and everything after it is lost.

use crc32fast::Hasher;
use keyspace_common::Timestamp;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Mutation kind recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Put,
    Delete,
}

impl WalOp {
    fn as_byte(self) -> u8 {
        match self {
            WalOp::Put => 1,
            WalOp::Delete => 3,
        }
    }

    /// Internal replication ops land in the log with their wire opcodes;
    /// they replay identically to their client counterparts.
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 | 10 => Some(WalOp::Put),
            3 | 12 => Some(WalOp::Delete),
            _ => None,
        }
    }
}

/// One successfully replayed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub op: WalOp,
    pub timestamp: Timestamp,
    pub key: String,
    pub value: Vec<u8>,
    pub origin: String,
}

/// An append-only log. One writer at a time; replay blocks appends.
#[derive(Debug)]
pub struct Wal {
    file: Mutex<File>,
    path: PathBuf,
}

impl Wal {
    /// Open or create the log at `path`.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush file data to disk before returning.
    pub fn append(
        &self,
        op: WalOp,
        key: &str,
        value: &[u8],
        timestamp: Timestamp,
        origin: &str,
    ) -> Result<(), WalError> {
        let record = encode_record(op, key, value, timestamp, origin);

        let mut hasher = Hasher::new();
        hasher.update(&record);
        let crc = hasher.finalize();

        // [size][record][crc] assembled up front so one write_all suffices.
        let mut blob = Vec::with_capacity(4 + record.len() + 4);
        blob.extend_from_slice(&(record.len() as u32).to_be_bytes());
        blob.extend_from_slice(&record);
        blob.extend_from_slice(&crc.to_be_bytes());

        let mut file = self.file.lock().expect("wal lock");
        file.write_all(&blob)?;
        // Data-only flush; metadata sync is not required for recovery.
        file.sync_data()?;
        Ok(())
    }

    /// Read back every valid record in order.
    ///
    /// Stops at clean EOF, a torn tail, a CRC mismatch, or an unparseable
    /// record; everything before the stop point is returned.
    pub fn replay(&self) -> Result<Vec<WalEntry>, WalError> {
        let mut file = self.file.lock().expect("wal lock");
        file.seek(SeekFrom::Start(0))?;

        let mut reader = BufReader::new(&*file);
        let mut entries = Vec::new();

        loop {
            let mut size_buf = [0u8; 4];
            match reader.read_exact(&mut size_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(WalError::Io(e)),
            }
            let entry_size = u32::from_be_bytes(size_buf) as usize;

            let mut record = vec![0u8; entry_size];
            if !read_fully(&mut reader, &mut record)? {
                tracing::warn!(entry = entries.len(), "WAL truncated mid-record, stopping replay");
                break;
            }

            let mut crc_buf = [0u8; 4];
            if !read_fully(&mut reader, &mut crc_buf)? {
                tracing::warn!(entry = entries.len(), "WAL truncated at CRC, stopping replay");
                break;
            }
            let stored_crc = u32::from_be_bytes(crc_buf);

            let mut hasher = Hasher::new();
            hasher.update(&record);
            if hasher.finalize() != stored_crc {
                tracing::warn!(entry = entries.len(), "WAL CRC mismatch, stopping replay");
                break;
            }

            match decode_record(&record) {
                Some(entry) => entries.push(entry),
                None => {
                    tracing::warn!(entry = entries.len(), "WAL record unparseable, stopping replay");
                    break;
                }
            }
        }

        drop(reader);
        file.seek(SeekFrom::End(0))?;
        Ok(entries)
    }

    /// Zero the file. Used only for full snapshot compaction.
    pub fn truncate(&self) -> Result<(), WalError> {
        let mut file = self.file.lock().expect("wal lock");
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

fn encode_record(op: WalOp, key: &str, value: &[u8], ts: Timestamp, origin: &str) -> Vec<u8> {
    let mut record = Vec::with_capacity(1 + 8 + 4 + key.len() + 4 + value.len() + 4 + origin.len());
    record.push(op.as_byte());
    record.extend_from_slice(&ts.to_be_bytes());
    record.extend_from_slice(&(key.len() as u32).to_be_bytes());
    record.extend_from_slice(key.as_bytes());
    record.extend_from_slice(&(value.len() as u32).to_be_bytes());
    record.extend_from_slice(value);
    record.extend_from_slice(&(origin.len() as u32).to_be_bytes());
    record.extend_from_slice(origin.as_bytes());
    record
}

fn decode_record(record: &[u8]) -> Option<WalEntry> {
    let mut pos = 0usize;

    let op = WalOp::from_byte(*record.first()?)?;
    pos += 1;

    let ts_bytes: [u8; 8] = record.get(pos..pos + 8)?.try_into().ok()?;
    let timestamp = Timestamp::from_be_bytes(ts_bytes);
    pos += 8;

    let (key_bytes, next) = take_prefixed(record, pos)?;
    let key = String::from_utf8(key_bytes.to_vec()).ok()?;
    pos = next;

    let (value, next) = take_prefixed(record, pos)?;
    let value = value.to_vec();
    pos = next;

    // Records written before the origin extension end here.
    let origin = if pos == record.len() {
        String::new()
    } else {
        let (origin_bytes, _) = take_prefixed(record, pos)?;
        String::from_utf8(origin_bytes.to_vec()).ok()?
    };

    Some(WalEntry {
        op,
        timestamp,
        key,
        value,
        origin,
    })
}

fn take_prefixed(record: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let len_bytes: [u8; 4] = record.get(pos..pos + 4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let start = pos + 4;
    let bytes = record.get(start..start + len)?;
    Some((bytes, start + len))
}

/// `read_exact` that reports a short read as `Ok(false)` instead of an error.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, WalError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(WalError::Io(e)),
    }
}
