use std::collections::BTreeMap;

use crate::error::StorageError;
use crate::messages::Entry;
use crate::storage::HardState;
use crate::storage::LogStore;
use crate::storage::Snapshot;
use crate::LogId;
use crate::LogIndex;

/// A `LogStore` keeping everything in memory.
///
/// Writes are "durable" for as long as the value lives: the simulation tests keep a crashed
/// node's `MemStore` and restart the node on top of it.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    hard_state: HardState,
    log: BTreeMap<LogIndex, Entry>,
    snapshot: Option<Snapshot>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries currently in the log.
    pub fn log(&self) -> impl Iterator<Item = &Entry> {
        self.log.values()
    }
}

impl LogStore for MemStore {
    fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    fn save_hard_state(&mut self, hs: &HardState) -> Result<(), StorageError> {
        self.hard_state = hs.clone();
        Ok(())
    }

    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        let mut next = self.last_log_id().index + 1;
        for entry in entries {
            if entry.log_id.index != next {
                return Err(StorageError::Corrupted(format!(
                    "non-contiguous append: expect index {}, got {}",
                    next, entry.log_id
                )));
            }
            next += 1;
        }
        for entry in entries {
            self.log.insert(entry.log_id.index, entry.clone());
        }
        Ok(())
    }

    fn get_entry(&self, index: LogIndex) -> Option<Entry> {
        self.log.get(&index).cloned()
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.log.split_off(&index);
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
        self.log = self.log.split_off(&(last + 1));
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        let last = snapshot.meta.last_included;
        let keeps_suffix = self.log.get(&last.index).map(|e| e.log_id == last).unwrap_or(false);
        if keeps_suffix {
            self.log = self.log.split_off(&(last.index + 1));
        } else {
            self.log.clear();
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }
}
