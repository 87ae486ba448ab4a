//! Pollable cursors over partitioned append-only logs.
//!
//! A cursor never reorders records within its partition and never skips an
//! offset: a failed read leaves the position untouched so the next poll sees the
//! same records. Offsets are "next offset to read", so committing `n` means every
//! record below `n` has been fully processed.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;
use crate::error::{LogError, PipelineError};

pub const PLAYS_STREAM: &str = "plays";
pub const FRAMES_STREAM: &str = "frames";

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub partition: usize,
    pub offset: u64,
    pub payload: String,
    /// Set when the stored bytes were not UTF-8; `payload` is then a lossy copy.
    pub encoding_error: Option<String>,
}

impl LogRecord {
    pub fn new(partition: usize, offset: u64, payload: impl Into<String>) -> Self {
        Self {
            partition,
            offset,
            payload: payload.into(),
            encoding_error: None,
        }
    }

    fn from_line(partition: usize, offset: u64, line: &[u8]) -> Self {
        match std::str::from_utf8(line) {
            Ok(text) => Self::new(partition, offset, text.trim_end()),
            Err(err) => Self {
                partition,
                offset,
                payload: String::from_utf8_lossy(line).trim_end().to_string(),
                encoding_error: Some(err.to_string()),
            },
        }
    }
}

pub trait LogCursor: Send {
    fn stream(&self) -> &str;

    fn partition(&self) -> usize;

    /// Returns up to `max_batch` records in offset order, waiting at most
    /// `timeout` when none are available yet.
    fn poll(&mut self, max_batch: usize, timeout: Duration) -> Result<Vec<LogRecord>, LogError>;

    fn commit(&mut self, offset: u64) -> Result<(), LogError>;

    fn seek(&mut self, offset: u64) -> Result<(), LogError>;

    fn committed(&self) -> Option<u64>;

    /// Offset of the next record `poll` will return.
    fn position(&self) -> u64;
}

/// Stable FNV-1a partitioner on `game_id`, shared by both logs so a play's
/// events and frames land on the same worker.
pub fn partition_for(game_id: &str, partitions: usize) -> usize {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in game_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % partitions.max(1) as u64) as usize
}

/// Polls with bounded exponential backoff. Exhaustion becomes `StreamUnavailable`.
pub fn poll_with_retry(
    cursor: &mut dyn LogCursor,
    max_batch: usize,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<Vec<LogRecord>, PipelineError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match cursor.poll(max_batch, timeout) {
            Ok(records) => return Ok(records),
            Err(err) if attempt >= policy.max_attempts => {
                return Err(PipelineError::StreamUnavailable {
                    stream: cursor.stream().to_string(),
                    partition: cursor.partition(),
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Stream '{}' partition {}: read failed (attempt {}/{}), retrying in {:?}: {}",
                    cursor.stream(),
                    cursor.partition(),
                    attempt,
                    policy.max_attempts,
                    delay,
                    err
                );
                thread::sleep(delay);
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    partitions: Vec<Vec<String>>,
    committed: Vec<Option<u64>>,
    fail_reads: Vec<u32>,
}

/// In-process partitioned log. Clones share the same storage, so a "restarted"
/// cursor sees committed offsets from earlier ones.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    name: String,
    shared: Arc<(Mutex<MemoryLogInner>, Condvar)>,
}

impl MemoryLog {
    pub fn new(name: impl Into<String>, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let inner = MemoryLogInner {
            partitions: vec![Vec::new(); partitions],
            committed: vec![None; partitions],
            fail_reads: vec![0; partitions],
        };
        Self {
            name: name.into(),
            shared: Arc::new((Mutex::new(inner), Condvar::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> usize {
        self.lock().partitions.len()
    }

    pub fn append(&self, partition: usize, payload: impl Into<String>) -> u64 {
        let (_, cvar) = &*self.shared;
        let mut inner = self.lock();
        let idx = partition % inner.partitions.len();
        let part = &mut inner.partitions[idx];
        part.push(payload.into());
        let offset = (part.len() - 1) as u64;
        drop(inner);
        cvar.notify_all();
        offset
    }

    /// Appends to the partition owning `game_id`.
    pub fn append_keyed(&self, game_id: &str, payload: impl Into<String>) -> (usize, u64) {
        let partition = partition_for(game_id, self.partition_count());
        let offset = self.append(partition, payload);
        (partition, offset)
    }

    pub fn len(&self, partition: usize) -> u64 {
        self.lock()
            .partitions
            .get(partition)
            .map(|p| p.len() as u64)
            .unwrap_or(0)
    }

    pub fn committed(&self, partition: usize) -> Option<u64> {
        self.lock().committed.get(partition).copied().flatten()
    }

    /// The next `count` polls on `partition` fail with a transient read error.
    pub fn inject_read_failures(&self, partition: usize, count: u32) {
        let mut inner = self.lock();
        if let Some(slot) = inner.fail_reads.get_mut(partition) {
            *slot = count;
        }
    }

    /// Opens a cursor positioned at the last committed offset (or 0).
    pub fn cursor(&self, partition: usize) -> MemoryCursor {
        let position = self.committed(partition).unwrap_or(0);
        MemoryCursor {
            log: self.clone(),
            partition,
            position,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLogInner> {
        self.shared.0.lock().expect("memory log lock poisoned")
    }
}

#[derive(Debug)]
pub struct MemoryCursor {
    log: MemoryLog,
    partition: usize,
    position: u64,
}

impl LogCursor for MemoryCursor {
    fn stream(&self) -> &str {
        self.log.name()
    }

    fn partition(&self) -> usize {
        self.partition
    }

    fn poll(&mut self, max_batch: usize, timeout: Duration) -> Result<Vec<LogRecord>, LogError> {
        let (lock, cvar) = &*self.log.shared;
        let deadline = Instant::now() + timeout;
        let mut inner = lock.lock().expect("memory log lock poisoned");

        if let Some(remaining) = inner.fail_reads.get_mut(self.partition)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(LogError::Read(format!(
                "injected failure on {} partition {}",
                self.log.name, self.partition
            )));
        }

        loop {
            let available = inner
                .partitions
                .get(self.partition)
                .map(|p| p.len() as u64)
                .unwrap_or(0);
            if available > self.position {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (guard, _) = cvar
                .wait_timeout(inner, deadline - now)
                .expect("memory log lock poisoned");
            inner = guard;
        }

        let part = &inner.partitions[self.partition];
        let start = self.position as usize;
        let end = (start + max_batch.max(1)).min(part.len());
        let records = part[start..end]
            .iter()
            .enumerate()
            .map(|(idx, payload)| LogRecord::new(self.partition, (start + idx) as u64, payload.clone()))
            .collect::<Vec<_>>();
        self.position = end as u64;
        Ok(records)
    }

    fn commit(&mut self, offset: u64) -> Result<(), LogError> {
        let mut inner = self.log.lock();
        let end = inner
            .partitions
            .get(self.partition)
            .map(|p| p.len() as u64)
            .unwrap_or(0);
        if offset > end {
            return Err(LogError::OffsetOutOfRange { offset, end });
        }
        let slot = &mut inner.committed[self.partition];
        if slot.is_none_or(|current| offset > current) {
            *slot = Some(offset);
        }
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), LogError> {
        let end = self.log.len(self.partition);
        if offset > end {
            return Err(LogError::OffsetOutOfRange { offset, end });
        }
        self.position = offset;
        Ok(())
    }

    fn committed(&self) -> Option<u64> {
        self.log.committed(self.partition)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OffsetFile {
    committed: u64,
}

/// JSON-lines file per partition: `<dir>/<stream>-<partition>.jsonl`, with the
/// committed offset kept next to it in `<stream>-<partition>.offset`.
#[derive(Debug, Clone)]
pub struct FileLog {
    dir: PathBuf,
    stream: String,
}

impl FileLog {
    pub fn new(dir: impl Into<PathBuf>, stream: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stream: stream.into(),
        }
    }

    pub fn data_path(&self, partition: usize) -> PathBuf {
        self.dir.join(format!("{}-{}.jsonl", self.stream, partition))
    }

    pub fn offset_path(&self, partition: usize) -> PathBuf {
        self.dir.join(format!("{}-{}.offset", self.stream, partition))
    }

    pub fn cursor(&self, partition: usize) -> Result<FileCursor, LogError> {
        let committed = load_offset(&self.offset_path(partition));
        let mut cursor = FileCursor {
            stream: self.stream.clone(),
            partition,
            data_path: self.data_path(partition),
            offset_path: self.offset_path(partition),
            reader: None,
            position: 0,
            committed,
        };
        cursor.seek(committed.unwrap_or(0))?;
        Ok(cursor)
    }
}

#[derive(Debug)]
pub struct FileCursor {
    stream: String,
    partition: usize,
    data_path: PathBuf,
    offset_path: PathBuf,
    reader: Option<BufReader<File>>,
    position: u64,
    committed: Option<u64>,
}

impl FileCursor {
    fn open_reader(&mut self) -> Result<bool, LogError> {
        if self.reader.is_some() {
            return Ok(true);
        }
        match File::open(&self.data_path) {
            Ok(file) => {
                self.reader = Some(BufReader::new(file));
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(LogError::Read(format!(
                "open {}: {err}",
                self.data_path.display()
            ))),
        }
    }

    /// Reads complete lines only; a trailing partial line is left for later.
    ///
    /// A failed read rewinds to the first byte of the batch, so the next call
    /// returns the same records under the same offsets.
    fn read_available(&mut self, max_batch: usize) -> Result<Vec<LogRecord>, LogError> {
        if !self.open_reader()? {
            return Ok(Vec::new());
        }
        let first_offset = self.position;
        let partition = self.partition;
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };
        let batch_start = reader
            .stream_position()
            .map_err(|err| LogError::Read(err.to_string()))?;
        match read_lines(reader, partition, first_offset, max_batch) {
            Ok(records) => {
                self.position += records.len() as u64;
                Ok(records)
            }
            Err(err) => {
                let err = LogError::Read(err.to_string());
                if reader.seek(SeekFrom::Start(batch_start)).is_err() {
                    // Rebuild the reader from scratch; earlier records may be
                    // delivered again but never under a different offset.
                    warn!(
                        "Stream '{}' partition {}: rewind failed, reopening at offset {}",
                        self.stream, self.partition, first_offset
                    );
                    self.seek(first_offset)?;
                }
                Err(err)
            }
        }
    }
}

fn read_lines(
    reader: &mut BufReader<File>,
    partition: usize,
    first_offset: u64,
    max_batch: usize,
) -> std::io::Result<Vec<LogRecord>> {
    let mut records = Vec::new();
    let mut line = Vec::new();
    while records.len() < max_batch {
        let start = reader.stream_position()?;
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            reader.seek(SeekFrom::Start(start))?;
            break;
        }
        let offset = first_offset + records.len() as u64;
        records.push(LogRecord::from_line(partition, offset, &line));
    }
    Ok(records)
}

impl LogCursor for FileCursor {
    fn stream(&self) -> &str {
        &self.stream
    }

    fn partition(&self) -> usize {
        self.partition
    }

    fn poll(&mut self, max_batch: usize, timeout: Duration) -> Result<Vec<LogRecord>, LogError> {
        const IDLE_STEP: Duration = Duration::from_millis(25);
        let deadline = Instant::now() + timeout;
        loop {
            let records = self.read_available(max_batch.max(1))?;
            if !records.is_empty() {
                return Ok(records);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(records);
            }
            thread::sleep(IDLE_STEP.min(deadline - now));
        }
    }

    fn commit(&mut self, offset: u64) -> Result<(), LogError> {
        if self.committed.is_some_and(|current| offset <= current) {
            return Ok(());
        }
        save_offset(&self.offset_path, offset)?;
        debug!(
            "Stream '{}' partition {}: committed offset {}",
            self.stream, self.partition, offset
        );
        self.committed = Some(offset);
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), LogError> {
        self.reader = None;
        self.position = 0;
        if !self.open_reader()? {
            if offset == 0 {
                return Ok(());
            }
            return Err(LogError::OffsetOutOfRange { offset, end: 0 });
        }
        while self.position < offset {
            let got = self.read_available((offset - self.position) as usize)?;
            if got.is_empty() {
                return Err(LogError::OffsetOutOfRange {
                    offset,
                    end: self.position,
                });
            }
        }
        Ok(())
    }

    fn committed(&self) -> Option<u64> {
        self.committed
    }

    fn position(&self) -> u64 {
        self.position
    }
}

fn load_offset(path: &Path) -> Option<u64> {
    let raw = fs::read_to_string(path).ok()?;
    let parsed = serde_json::from_str::<OffsetFile>(&raw).ok()?;
    Some(parsed.committed)
}

fn save_offset(path: &Path, committed: u64) -> Result<(), LogError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).ok();
    }
    let tmp = path.with_extension("offset.tmp");
    let json = serde_json::to_string(&OffsetFile { committed })
        .map_err(|err| LogError::Commit(err.to_string()))?;
    fs::write(&tmp, json).map_err(|err| LogError::Commit(err.to_string()))?;
    fs::rename(&tmp, path).map_err(|err| LogError::Commit(err.to_string()))?;
    Ok(())
}
