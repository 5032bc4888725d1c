//! GRIDCORE - Disk Overflow Store
//! The disk tier that receives faulted-out values and hands them back
//! on fault-in. Only the eviction path talks to it.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::types::{Key, Value};

/// Size of the `[payload_len][crc]` frame header.
const FRAME_HEADER: usize = 8;

/// Location of a faulted-out value in the overflow tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskToken {
    offset: u64,
    len: u32,
}

impl DiskToken {
    pub fn new(offset: u64, len: u32) -> Self {
        Self { offset, len }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Framed record length on disk.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Storage consumed by the eviction controller.
pub trait DiskStore: Send + Sync {
    /// Persist a value and return a token for reading it back.
    fn write(&self, key: &Key, value: &[u8]) -> Result<DiskToken>;

    /// Persist several values. Stores that benefit from batching override this.
    fn write_batch(&self, records: &[(Key, Value)]) -> Result<Vec<DiskToken>> {
        records
            .iter()
            .map(|(key, value)| self.write(key, value))
            .collect()
    }

    /// Read a value back.
    fn read(&self, token: DiskToken) -> Result<Value>;

    /// The value behind `token` is no longer referenced.
    fn release(&self, token: DiskToken);
}

#[derive(Serialize)]
struct RecordRef<'a> {
    key: &'a Key,
    value: &'a [u8],
}

#[derive(Deserialize)]
struct OwnedRecord {
    #[allow(dead_code)]
    key: Key,
    value: Vec<u8>,
}

struct Writer {
    file: File,
    /// Logical end of the file. Everything past it is unused.
    end: u64,
    /// Released extents below `end`, offset to length, never adjacent.
    free: BTreeMap<u64, u64>,
    free_total: u64,
}

impl Writer {
    /// First fit among the free extents, else grow the file.
    fn allocate(&mut self, len: u64) -> u64 {
        let fit = self
            .free
            .iter()
            .find(|&(_, &extent)| extent >= len)
            .map(|(&offset, &extent)| (offset, extent));
        match fit {
            Some((offset, extent)) => {
                self.free.remove(&offset);
                if extent > len {
                    self.free.insert(offset + len, extent - len);
                }
                self.free_total -= len;
                offset
            }
            None => {
                let offset = self.end;
                self.end += len;
                offset
            }
        }
    }

    /// Return an extent, merging it with its neighbours. A free tail shrinks the file.
    /// `false` if the extent was not allocated.
    fn release(&mut self, offset: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let overlaps_prev = self
            .free
            .range(..=offset)
            .next_back()
            .map_or(false, |(&start, &extent)| start + extent > offset);
        let overlaps_next = self
            .free
            .range(offset..)
            .next()
            .map_or(false, |(&start, _)| start < offset + len);
        if offset + len > self.end || overlaps_prev || overlaps_next {
            log::warn!("Ignoring release of unallocated extent {}+{}", offset, len);
            return false;
        }

        let mut start = offset;
        let mut extent = len;
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                self.free_total -= prev_len;
                start = prev;
                extent += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            self.free_total -= next_len;
            extent += next_len;
        }

        if start + extent == self.end {
            self.end = start;
            if let Err(err) = self.file.set_len(start) {
                log::warn!("Failed to truncate overflow file to {}: {}", start, err);
            }
        } else {
            self.free.insert(start, extent);
            self.free_total += extent;
        }
        true
    }

    /// Positioned write. Never relies on the cursor left by an earlier call.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }
}

/// Overflow file with free-extent reuse.
///
/// ## Binary Format (per record)
/// ```text
/// [payload_len: 4 bytes (LE)][crc32: 4 bytes (LE)][payload: bincode(key, value)]
/// ```
/// Every record is written at an offset chosen up front, so a failed write
/// only ever touches its own extent. Released records go back to a free list
/// that later writes reuse first fit; a released tail is truncated away.
/// The file is truncated when the region opens.
pub struct OverflowFile {
    path: PathBuf,
    writer: Mutex<Writer>,
    reader: Mutex<File>,
    sync_writes: bool,
    live_bytes: AtomicU64,
    dead_bytes: AtomicU64,
}

impl OverflowFile {
    /// Create (or truncate) the overflow file at `path`.
    pub fn open(path: PathBuf, sync_writes: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let reader = OpenOptions::new().read(true).open(&path)?;

        log::debug!("Overflow file opened at {:?}", path);

        Ok(Self {
            path,
            writer: Mutex::new(Writer {
                file,
                end: 0,
                free: BTreeMap::new(),
                free_total: 0,
            }),
            reader: Mutex::new(reader),
            sync_writes,
            live_bytes: AtomicU64::new(0),
            dead_bytes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of records still referenced by entries.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Bytes of released records still occupying the file, waiting for reuse.
    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes.load(Ordering::Relaxed)
    }

    /// Logical length of the file.
    pub fn file_len(&self) -> u64 {
        self.writer.lock().end
    }

    /// Encode one framed record.
    fn encode_record(key: &Key, value: &[u8], buf: &mut Vec<u8>) -> Result<u32> {
        let payload = bincode::serialize(&RecordRef { key, value })?;
        let crc = crc32fast::hash(&payload);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok((FRAME_HEADER + payload.len()) as u32)
    }

    /// Check framing and checksum, then decode the value.
    fn decode_record(token: DiskToken, buf: &[u8]) -> Result<Value> {
        if buf.len() < FRAME_HEADER {
            return Err(GridError::Corruption(format!(
                "record at {} shorter than its header",
                token.offset
            )));
        }
        let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let payload = &buf[FRAME_HEADER..];
        if payload.len() != payload_len {
            return Err(GridError::Corruption(format!(
                "record at {} has length {} but token expects {}",
                token.offset,
                payload_len,
                payload.len()
            )));
        }
        if crc32fast::hash(payload) != crc {
            return Err(GridError::Corruption(format!(
                "CRC mismatch for record at {}",
                token.offset
            )));
        }
        let record: OwnedRecord = bincode::deserialize(payload)?;
        Ok(Value::from(record.value))
    }

    /// Place framed records, `lens` splitting `buf`, and write them.
    /// Contiguous placements go out as one write. On failure every extent is
    /// handed back and nothing is live.
    fn place(&self, buf: &[u8], lens: &[u32]) -> Result<Vec<DiskToken>> {
        let mut writer = self.writer.lock();
        let tokens: Vec<DiskToken> = lens
            .iter()
            .map(|&len| DiskToken::new(writer.allocate(len as u64), len))
            .collect();

        if let Err(err) = Self::write_runs(&mut *writer, buf, &tokens, self.sync_writes) {
            for token in tokens.iter().rev() {
                writer.release(token.offset, token.len as u64);
            }
            self.dead_bytes.store(writer.free_total, Ordering::Relaxed);
            return Err(err);
        }

        self.dead_bytes.store(writer.free_total, Ordering::Relaxed);
        self.live_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(tokens)
    }

    fn write_runs(writer: &mut Writer, buf: &[u8], tokens: &[DiskToken], sync: bool) -> Result<()> {
        let mut start = 0;
        let mut from = 0;
        while start < tokens.len() {
            let mut end = start + 1;
            let mut to = from + tokens[start].len();
            while end < tokens.len()
                && tokens[end].offset == tokens[end - 1].offset + tokens[end - 1].len as u64
            {
                to += tokens[end].len();
                end += 1;
            }
            writer.write_at(tokens[start].offset, &buf[from..to])?;
            start = end;
            from = to;
        }
        if sync {
            writer.file.sync_data()?;
        }
        Ok(())
    }
}

impl DiskStore for OverflowFile {
    fn write(&self, key: &Key, value: &[u8]) -> Result<DiskToken> {
        let mut buf = Vec::with_capacity(FRAME_HEADER + value.len() + 32);
        let len = Self::encode_record(key, value, &mut buf)?;
        let tokens = self.place(&buf, &[len])?;
        Ok(tokens[0])
    }

    /// All records placed under one lock, contiguous runs in one write.
    fn write_batch(&self, records: &[(Key, Value)]) -> Result<Vec<DiskToken>> {
        let mut buf = Vec::new();
        let mut lens = Vec::with_capacity(records.len());
        for (key, value) in records {
            lens.push(Self::encode_record(key, value, &mut buf)?);
        }
        self.place(&buf, &lens)
    }

    fn read(&self, token: DiskToken) -> Result<Value> {
        let mut buf = vec![0u8; token.len()];
        {
            let mut reader = self.reader.lock();
            reader.seek(SeekFrom::Start(token.offset))?;
            reader.read_exact(&mut buf)?;
        }
        Self::decode_record(token, &buf)
    }

    fn release(&self, token: DiskToken) {
        let mut writer = self.writer.lock();
        if writer.release(token.offset, token.len as u64) {
            self.live_bytes.fetch_sub(token.len() as u64, Ordering::Relaxed);
        }
        self.dead_bytes.store(writer.free_total, Ordering::Relaxed);
    }
}

/// Run a disk operation up to `attempts` times, backing off between I/O failures.
/// Corruption and serialization errors are returned immediately.
pub fn with_retry<T>(attempts: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = Duration::from_millis(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(GridError::Io(err)) if attempt < attempts => {
                log::debug!("Disk I/O attempt {} failed: {}; retrying", attempt, err);
                std::thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_millis(50));
                attempt += 1;
            }
            result => return result,
        }
    }
}
