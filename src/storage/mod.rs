//! The Raft storage interface and data types.
//!
//! A [`LogStore`] is the only durable state of a node: its hard state (term and vote), its log
//! and its latest snapshot. The engine calls it synchronously from the node's consensus task; a
//! method that returns `Ok` must have made its write durable.

mod file;
mod mem;

use serde::Deserialize;
use serde::Serialize;

pub use self::file::FileStore;
pub use self::mem::MemStore;
use crate::error::StorageError;
use crate::membership::Membership;
use crate::messages::Entry;
use crate::LogId;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: Term,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// What a snapshot covers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// The last log entry folded into the snapshot.
    pub last_included: LogId,
    /// The latest membership configuration covered by the snapshot.
    pub membership: Membership,
}

/// A state machine image plus the log position it reflects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// Durable storage of a single Raft node.
pub trait LogStore: Send + 'static {
    /// The hard state as of the last successful `save_hard_state`, default for a pristine node.
    fn hard_state(&self) -> HardState;

    /// Durably record the current term and vote.
    fn save_hard_state(&mut self, hs: &HardState) -> Result<(), StorageError>;

    /// Durably append entries.
    ///
    /// `entries` are contiguous and the first of them directly follows the last log id; callers
    /// truncate conflicting entries first.
    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError>;

    /// The entry at `index`, `None` if it does not exist or has been compacted.
    fn get_entry(&self, index: LogIndex) -> Option<Entry>;

    /// Delete the entry at `index` and every entry after it.
    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError>;

    /// The id of the last entry, falling back to the snapshot's last included entry, then to
    /// `(0, 0)`.
    fn last_log_id(&self) -> LogId;

    /// The latest snapshot, if any.
    fn snapshot(&self) -> Option<&Snapshot>;

    /// Store a snapshot built by this node and drop the log up to `snapshot.meta.last_included`.
    fn compact(&mut self, snapshot: Snapshot) -> Result<(), StorageError>;

    /// Store a snapshot received from the leader.
    ///
    /// If the log holds the snapshot's last included entry, the entries after it are kept.
    /// Otherwise the whole log is discarded.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError>;

    /// Entries in `[start, stop)`, stopping early at the first missing one.
    fn entries(&self, start: LogIndex, stop: LogIndex) -> Vec<Entry> {
        (start..stop).map_while(|i| self.get_entry(i)).collect()
    }

    /// The last log entry folded into the snapshot, `(0, 0)` without one.
    fn snapshot_last_log_id(&self) -> LogId {
        self.snapshot().map(|s| s.meta.last_included).unwrap_or_default()
    }

    /// The term of the entry at `index`.
    ///
    /// Index 0 has term 0. The snapshot's last included entry is known; anything before it
    /// is not.
    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        let snapshot_last = self.snapshot_last_log_id();
        if index == snapshot_last.index {
            return Some(snapshot_last.term);
        }
        if index < snapshot_last.index {
            return None;
        }
        self.get_entry(index).map(|e| e.log_id.term)
    }
}
