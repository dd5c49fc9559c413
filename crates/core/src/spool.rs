//! Durable append-only journal of telemetry records.
//!
//! The journal is a JSON-lines file. Every line is one [`JournalEntry`]:
//!
//! ```text
//! {"op":"meta","version":1,"next_id":42}
//! {"op":"append","record":{"id":42,...}}
//! {"op":"ack","ids":[40,41,42]}
//! ```
//!
//! Appends are flushed and `sync_data`'d before `append` returns. On open the
//! journal is replayed; a torn or corrupt final line (from a crash mid-write)
//! is truncated, while a corrupt line followed by valid ones is skipped.
//! Compaction rewrites the journal to a sibling file and renames it into
//! place.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{Result, SpoolWriteError},
    record::{EventRecord, NewEvent, Session},
};

pub const JOURNAL_FILE: &str = "spool.jsonl";
const COMPACT_SUFFIX: &str = "compact";
const JOURNAL_VERSION: u32 = 1;

/// Memory-only spools compact once this many acknowledged records pile up.
const MEMORY_COMPACT_ACKED: usize = 4096;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Meta { version: u32, next_id: u64 },
    Append { record: EventRecord },
    Ack { ids: Vec<u64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub removed: usize,
    pub retained: usize,
    pub watermark: u64,
}

struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
}

impl Journal {
    fn write(&mut self, entry: &JournalEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.bytes += line.len() as u64;
        Ok(())
    }
}

struct SpoolInner {
    records: BTreeMap<u64, EventRecord>,
    acked: usize,
    next_id: u64,
    journal: Option<Journal>,
}

impl SpoolInner {
    /// Write to the journal, dropping to memory-only mode on failure.
    fn journal_write(&mut self, entry: &JournalEntry) -> io::Result<()> {
        let result = match self.journal.as_mut() {
            Some(journal) => journal.write(entry),
            None => return Ok(()),
        };
        if let Err(e) = &result {
            let path = self.journal.as_ref().map(|j| j.path.clone());
            warn!(error = %e, path = ?path, "Spool write failed, continuing memory-only");
            self.journal = None;
        }
        result
    }
}

/// Single-writer store owning the durable copy of every record.
pub struct Spool {
    inner: Mutex<SpoolInner>,
    session: Session,
    compaction_threshold: u64,
}

struct Replay {
    records: BTreeMap<u64, EventRecord>,
    next_id: u64,
    valid_len: u64,
    saw_meta: bool,
}

fn replay(file: &File) -> io::Result<Replay> {
    let mut reader = BufReader::new(file);
    let mut records = BTreeMap::new();
    let mut acks = BTreeSet::new();
    let mut next_id = 1;
    let mut valid_len = 0u64;
    let mut saw_meta = false;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }
        let entry = match serde_json::from_slice::<JournalEntry>(&line) {
            Ok(entry) => entry,
            Err(_) if reader.fill_buf()?.is_empty() => break,
            Err(e) => {
                warn!(offset = valid_len, error = %e, "Skipping corrupt spool entry");
                valid_len += n as u64;
                continue;
            }
        };
        match entry {
            JournalEntry::Meta { next_id: n, .. } => {
                saw_meta = true;
                next_id = next_id.max(n);
            }
            JournalEntry::Append { record } => {
                next_id = next_id.max(record.id + 1);
                records.insert(record.id, record);
            }
            JournalEntry::Ack { ids } => acks.extend(ids),
        }
        valid_len += n as u64;
    }

    for id in acks {
        if let Some(record) = records.get_mut(&id) {
            record.acknowledged = true;
        }
    }

    Ok(Replay {
        records,
        next_id,
        valid_len,
        saw_meta,
    })
}

impl Spool {
    /// Open (or create) the journal under `dir` and replay it.
    pub fn open(dir: &Path, compaction_threshold: u64, session: Session) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let replay = replay(&file)?;
        let file_len = file.metadata()?.len();
        if replay.valid_len < file_len {
            warn!(
                path = %path.display(),
                valid = replay.valid_len,
                total = file_len,
                "Truncating torn spool tail"
            );
            file.set_len(replay.valid_len)?;
            file.sync_data()?;
        }

        let acked = replay.records.values().filter(|r| r.acknowledged).count();
        let mut inner = SpoolInner {
            records: replay.records,
            acked,
            next_id: replay.next_id,
            journal: Some(Journal {
                path: path.clone(),
                writer: BufWriter::new(file),
                bytes: replay.valid_len,
            }),
        };

        if !replay.saw_meta && replay.valid_len == 0 {
            inner.journal_write(&JournalEntry::Meta {
                version: JOURNAL_VERSION,
                next_id: inner.next_id,
            })?;
        }

        debug!(
            path = %path.display(),
            records = inner.records.len(),
            pending = inner.records.len() - acked,
            next_id = inner.next_id,
            "Spool opened"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            session,
            compaction_threshold,
        })
    }

    /// A spool with no durable medium.
    pub fn in_memory(session: Session) -> Self {
        Self {
            inner: Mutex::new(SpoolInner {
                records: BTreeMap::new(),
                acked: 0,
                next_id: 1,
                journal: None,
            }),
            session,
            compaction_threshold: u64::MAX,
        }
    }

    #[cfg(test)]
    fn with_journal_file(path: PathBuf, file: File, session: Session) -> Self {
        Self {
            inner: Mutex::new(SpoolInner {
                records: BTreeMap::new(),
                acked: 0,
                next_id: 1,
                journal: Some(Journal {
                    path,
                    writer: BufWriter::new(file),
                    bytes: 0,
                }),
            }),
            session,
            compaction_threshold: u64::MAX,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Assign the next id and durably persist the record.
    ///
    /// On a write failure the record is still kept in memory and returned
    /// inside the error; the spool stays memory-only afterwards.
    pub fn append(&self, event: NewEvent) -> std::result::Result<EventRecord, SpoolWriteError> {
        let mut inner = self.inner.lock().expect("Spool poisoned");
        let id = inner.next_id;
        inner.next_id += 1;

        let record = EventRecord::new(id, &self.session, event);
        inner.records.insert(id, record.clone());

        let entry = JournalEntry::Append {
            record: record.clone(),
        };
        match inner.journal_write(&entry) {
            Ok(()) => Ok(record),
            Err(source) => Err(SpoolWriteError {
                record: Box::new(record),
                source,
            }),
        }
    }

    /// Mark records acknowledged. Unknown and already acknowledged ids are
    /// ignored; returns how many records changed state.
    pub fn mark_acknowledged(&self, ids: &[u64]) -> Result<usize> {
        let mut inner = self.inner.lock().expect("Spool poisoned");
        let wanted: BTreeSet<u64> = ids.iter().copied().collect();
        let mut newly = Vec::with_capacity(wanted.len());

        for id in wanted {
            if let Some(record) = inner.records.get_mut(&id)
                && !record.acknowledged
            {
                record.acknowledged = true;
                newly.push(id);
            }
        }

        if newly.is_empty() {
            return Ok(0);
        }
        inner.acked += newly.len();
        let count = newly.len();
        inner.journal_write(&JournalEntry::Ack { ids: newly })?;
        Ok(count)
    }

    /// Snapshot of every unacknowledged record in ascending id order.
    pub fn pending(&self) -> Vec<EventRecord> {
        let inner = self.inner.lock().expect("Spool poisoned");
        inner
            .records
            .values()
            .filter(|r| !r.acknowledged)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().expect("Spool poisoned");
        inner.records.len() - inner.acked
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Spool poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_id(&self) -> u64 {
        self.inner.lock().expect("Spool poisoned").next_id
    }

    pub fn is_durable(&self) -> bool {
        self.inner.lock().expect("Spool poisoned").journal.is_some()
    }

    pub fn journal_bytes(&self) -> u64 {
        let inner = self.inner.lock().expect("Spool poisoned");
        inner.journal.as_ref().map(|j| j.bytes).unwrap_or(0)
    }

    /// True once the journal is over its size threshold and compaction
    /// would actually drop something, i.e. the oldest record is acknowledged.
    pub fn needs_compaction(&self) -> bool {
        let inner = self.inner.lock().expect("Spool poisoned");
        let removable = inner
            .records
            .values()
            .next()
            .is_some_and(|r| r.acknowledged);
        let over = match &inner.journal {
            Some(journal) => journal.bytes >= self.compaction_threshold,
            None => inner.acked >= MEMORY_COMPACT_ACKED,
        };
        removable && over
    }

    /// Drop acknowledged records below the watermark (the lowest
    /// unacknowledged id) and rewrite the journal without them.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut inner = self.inner.lock().expect("Spool poisoned");
        let SpoolInner {
            records,
            acked,
            next_id,
            journal,
        } = &mut *inner;

        let watermark = records
            .values()
            .find(|r| !r.acknowledged)
            .map(|r| r.id)
            .unwrap_or(*next_id);

        let retained = records.split_off(&watermark);
        let removed = std::mem::replace(records, retained).len();
        *acked -= removed;

        let stats = CompactionStats {
            removed,
            retained: records.len(),
            watermark,
        };

        if let Err(e) = rewrite_journal(journal, records, *next_id) {
            warn!(error = %e, "Spool compaction rewrite failed");
            return Err(e.into());
        }

        debug!(
            removed = stats.removed,
            retained = stats.retained,
            watermark = stats.watermark,
            "Spool compacted"
        );
        Ok(stats)
    }
}

fn rewrite_journal(
    slot: &mut Option<Journal>,
    records: &BTreeMap<u64, EventRecord>,
    next_id: u64,
) -> io::Result<()> {
    let Some(journal) = slot.as_mut() else {
        return Ok(());
    };
    let tmp_path = journal.path.with_extension(format!("jsonl.{}", COMPACT_SUFFIX));
    let bytes = match write_compacted(&tmp_path, records, next_id) {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
    };
    if let Err(e) = fs::rename(&tmp_path, &journal.path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    if let Err(e) = sync_parent(&journal.path) {
        warn!(error = %e, path = %journal.path.display(), "Failed to sync spool directory");
    }

    reopen_journal(slot, bytes)
}

/// Point the writer at the file now at the journal path. The old writer
/// refers to the replaced file, so on failure the spool goes memory-only.
fn reopen_journal(slot: &mut Option<Journal>, bytes: u64) -> io::Result<()> {
    let Some(journal) = slot.as_mut() else {
        return Ok(());
    };
    match OpenOptions::new().append(true).open(&journal.path) {
        Ok(file) => {
            journal.writer = BufWriter::new(file);
            journal.bytes = bytes;
            Ok(())
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %journal.path.display(),
                "Cannot reopen compacted spool, continuing memory-only"
            );
            *slot = None;
            Err(e)
        }
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn write_compacted(
    path: &Path,
    records: &BTreeMap<u64, EventRecord>,
    next_id: u64,
) -> io::Result<u64> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut bytes = 0u64;

    let meta = JournalEntry::Meta {
        version: JOURNAL_VERSION,
        next_id,
    };
    let mut write_entry = |writer: &mut BufWriter<File>, entry: &JournalEntry| -> io::Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');
        writer.write_all(&line)?;
        bytes += line.len() as u64;
        Ok(())
    };

    write_entry(&mut writer, &meta)?;
    for record in records.values() {
        write_entry(
            &mut writer,
            &JournalEntry::Append {
                record: record.clone(),
            },
        )?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(bytes)
}
