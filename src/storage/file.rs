use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::codec;
use crate::error::StorageError;
use crate::messages::Entry;
use crate::storage::HardState;
use crate::storage::LogStore;
use crate::storage::Snapshot;
use crate::LogId;
use crate::LogIndex;

const LOG_FILE: &str = "log.bin";
const HARD_STATE_FILE: &str = "hard_state.json";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// A `LogStore` backed by a directory.
///
/// - `log.bin`: size-prefixed codec records, one per entry, appended and fsync-ed. An incomplete
///   record at the tail (a crash during append) is discarded on open.
/// - `hard_state.json`: term and vote, replaced atomically (write temp, fsync, rename).
/// - `snapshot.bin`: the latest snapshot, replaced atomically. Compaction then rewrites `log.bin`
///   the same way.
///
/// The log is also kept in memory, indexed by log index, with the file offset of every record.
///
/// Every write blocks the calling thread until it is on disk.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    log_file: File,
    /// Length of the valid part of `log.bin`.
    log_len: u64,
    hard_state: HardState,
    log: BTreeMap<LogIndex, Entry>,
    offsets: BTreeMap<LogIndex, u64>,
    snapshot: Option<Snapshot>,
}

impl FileStore {
    /// Open the store in `dir`, creating it if it does not exist.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(format!("create dir {}", dir.display()), e))?;

        let hard_state = read_hard_state(&dir.join(HARD_STATE_FILE))?;
        let snapshot = read_snapshot(&dir.join(SNAPSHOT_FILE))?;

        let log_path = dir.join(LOG_FILE);
        let mut log_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&log_path)
            .map_err(|e| StorageError::io(format!("open {}", log_path.display()), e))?;

        let mut buf = Vec::new();
        log_file.read_to_end(&mut buf).map_err(|e| StorageError::io("read log", e))?;
        let (records, valid_len) = parse_records(&buf)?;

        let mut store = FileStore {
            dir,
            log_file,
            log_len: buf.len() as u64,
            hard_state,
            log: BTreeMap::new(),
            offsets: BTreeMap::new(),
            snapshot,
        };

        if valid_len < store.log_len {
            tracing::warn!(valid_len, file_len = store.log_len, "discard torn tail of log");
            store.set_log_len(valid_len)?;
        }

        let snapshot_last = store.snapshot_last_log_id();
        let stale = records.iter().any(|(_, e)| e.log_id.index == snapshot_last.index && e.log_id != snapshot_last);
        if stale {
            // A crash between writing a received snapshot and discarding the old log.
            tracing::warn!(%snapshot_last, "discard log not matching the snapshot");
            store.set_log_len(0)?;
        } else {
            for (offset, entry) in records {
                if entry.log_id.index <= snapshot_last.index {
                    continue;
                }
                let expect = store.last_log_id().index + 1;
                if entry.log_id.index != expect {
                    return Err(StorageError::Corrupted(format!(
                        "log is not contiguous: expect index {}, got {}",
                        expect, entry.log_id
                    )));
                }
                store.offsets.insert(entry.log_id.index, offset);
                store.log.insert(entry.log_id.index, entry);
            }
        }

        tracing::info!(
            hard_state = ?store.hard_state,
            last_log_id = %store.last_log_id(),
            snapshot_last = %snapshot_last,
            "log store opened"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn set_log_len(&mut self, len: u64) -> Result<(), StorageError> {
        self.log_file.set_len(len).map_err(|e| StorageError::io("truncate log", e))?;
        self.log_file.sync_all().map_err(|e| StorageError::io("sync log", e))?;
        self.log_len = len;
        Ok(())
    }

    /// Replace `log.bin` with a file holding only the entries after `after`.
    fn rewrite_log(&mut self, after: LogIndex) -> Result<(), StorageError> {
        let kept = self.log.split_off(&(after + 1));
        self.log.clear();
        self.offsets.clear();

        let mut buf = Vec::new();
        let mut offsets = BTreeMap::new();
        for (index, entry) in kept.iter() {
            offsets.insert(*index, buf.len() as u64);
            buf.extend_from_slice(&codec::encode_entry(entry));
        }
        write_atomic(&self.dir, LOG_FILE, &buf)?;

        let log_path = self.dir.join(LOG_FILE);
        self.log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&log_path)
            .map_err(|e| StorageError::io(format!("open {}", log_path.display()), e))?;
        self.log_len = buf.len() as u64;
        self.log = kept;
        self.offsets = offsets;
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        write_atomic(&self.dir, SNAPSHOT_FILE, &codec::encode_snapshot(&snapshot))?;
        self.snapshot = Some(snapshot);
        Ok(())
    }
}

impl LogStore for FileStore {
    fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    fn save_hard_state(&mut self, hs: &HardState) -> Result<(), StorageError> {
        let data = serde_json::to_vec(hs).map_err(|e| StorageError::Corrupted(e.to_string()))?;
        write_atomic(&self.dir, HARD_STATE_FILE, &data)?;
        self.hard_state = hs.clone();
        Ok(())
    }

    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut expect = self.last_log_id().index + 1;
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.log_id.index != expect {
                return Err(StorageError::Corrupted(format!(
                    "non-contiguous append: expect index {}, got {}",
                    expect, entry.log_id
                )));
            }
            expect += 1;
            offsets.push((entry.log_id.index, self.log_len + buf.len() as u64));
            buf.extend_from_slice(&codec::encode_entry(entry));
        }

        self.log_file.seek(SeekFrom::Start(self.log_len)).map_err(|e| StorageError::io("seek log", e))?;
        self.log_file.write_all(&buf).map_err(|e| StorageError::io("append log", e))?;
        self.log_file.sync_data().map_err(|e| StorageError::io("sync log", e))?;

        self.log_len += buf.len() as u64;
        self.offsets.extend(offsets);
        for entry in entries {
            self.log.insert(entry.log_id.index, entry.clone());
        }
        Ok(())
    }

    fn get_entry(&self, index: LogIndex) -> Option<Entry> {
        self.log.get(&index).cloned()
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        let offset = match self.offsets.range(index..).next() {
            None => return Ok(()),
            Some((_, offset)) => *offset,
        };
        self.set_log_len(offset)?;
        self.log.split_off(&index);
        self.offsets.split_off(&index);
        Ok(())
    }

    fn last_log_id(&self) -> LogId {
        match self.log.values().next_back() {
            Some(entry) => entry.log_id,
            None => self.snapshot_last_log_id(),
        }
    }

    fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    fn compact(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        let last = snapshot.meta.last_included.index;
        self.save_snapshot(snapshot)?;
        self.rewrite_log(last)
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        let last = snapshot.meta.last_included;
        let keeps_suffix = self.log.get(&last.index).map(|e| e.log_id == last).unwrap_or(false);
        self.save_snapshot(snapshot)?;
        if keeps_suffix {
            self.rewrite_log(last.index)
        } else {
            self.log.clear();
            self.offsets.clear();
            self.set_log_len(0)
        }
    }
}

/// Split a log file into `(offset, entry)` records.
///
/// Returns the records and the length of the well-formed prefix. Only the last record may be
/// malformed; that is a write torn by a crash.
fn parse_records(buf: &[u8]) -> Result<(Vec<(u64, Entry)>, u64), StorageError> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        if buf.len() - pos < codec::SIZE_PREFIX_LEN {
            break;
        }
        let size = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
        let end = match (pos + codec::SIZE_PREFIX_LEN).checked_add(size) {
            Some(end) if end <= buf.len() => end,
            _ => break,
        };
        match codec::decode_entry(&buf[pos..end]) {
            Ok(entry) => records.push((pos as u64, entry)),
            Err(err) if end == buf.len() => {
                tracing::warn!(%err, offset = pos, "malformed last log record");
                break;
            }
            Err(err) => {
                return Err(StorageError::Corrupted(format!("log record at offset {}: {}", pos, err)));
            }
        }
        pos = end;
    }

    Ok((records, pos as u64))
}

fn read_hard_state(path: &Path) -> Result<HardState, StorageError> {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data)
            .map_err(|e| StorageError::Corrupted(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HardState::default()),
        Err(e) => Err(StorageError::io(format!("read {}", path.display()), e)),
    }
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, StorageError> {
    match fs::read(path) {
        Ok(data) => codec::decode_snapshot(&data)
            .map(Some)
            .map_err(|e| StorageError::Corrupted(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(format!("read {}", path.display()), e)),
    }
}

/// Replace `dir/name` with `data`: a crash leaves either the old or the new content.
fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<(), StorageError> {
    let path = dir.join(name);
    let tmp = dir.join(format!("{}.tmp", name));

    let mut f = File::create(&tmp).map_err(|e| StorageError::io(format!("create {}", tmp.display()), e))?;
    f.write_all(data).map_err(|e| StorageError::io(format!("write {}", tmp.display()), e))?;
    f.sync_all().map_err(|e| StorageError::io(format!("sync {}", tmp.display()), e))?;
    drop(f);

    fs::rename(&tmp, &path).map_err(|e| StorageError::io(format!("rename to {}", path.display()), e))?;
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::io(format!("sync dir {}", dir.display()), e))
}
