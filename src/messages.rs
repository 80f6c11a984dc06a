//! Log entries and the RPC messages exchanged between cluster members.

use crate::membership::Membership;
use crate::storage::SnapshotMeta;
use crate::LogId;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;
use crate::Term;

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPayload {
    /// An opaque application command, handed to the state machine once committed.
    Normal(Vec<u8>),
    /// A new cluster membership. It takes effect as soon as it is appended to a log.
    ConfigChange(Membership),
    /// Appended by a new leader to commit the entries of former terms. Never applied.
    Blank,
}

/// A Raft log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub log_id: LogId,
    pub payload: EntryPayload,
}

impl Entry {
    pub fn new_normal(term: Term, index: LogIndex, command: impl Into<Vec<u8>>) -> Self {
        Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::Normal(command.into()),
        }
    }

    pub fn new_config(term: Term, index: LogIndex, membership: Membership) -> Self {
        Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::ConfigChange(membership),
        }
    }

    pub fn new_blank(term: Term, index: LogIndex) -> Self {
        Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::Blank,
        }
    }

    pub fn index(&self) -> LogIndex {
        self.log_id.index
    }

    pub fn term(&self) -> Term {
        self.log_id.term
    }
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        match &self.payload {
            EntryPayload::Normal(cmd) => format!("{}:normal({}b)", self.log_id, cmd.len()),
            EntryPayload::ConfigChange(m) => format!("{}:config({:?})", self.log_id, m.node_ids().collect::<Vec<_>>()),
            EntryPayload::Blank => format!("{}:blank", self.log_id),
        }
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => format!("[{}..={}]", first.log_id, last.log_id),
            _ => "[]".to_string(),
        }
    }
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: Term,
    pub candidate_id: NodeId,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: LogIndex,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: Term,
}

impl VoteRequest {
    pub fn last_log_id(&self) -> LogId {
        LogId::new(self.last_log_term, self.last_log_index)
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: Term,
    pub vote_granted: bool,
}

/// An RPC sent by the cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: Term,
    pub leader_id: NodeId,
    /// The index of the log entry immediately preceding the new entries.
    pub prev_log_index: LogIndex,
    /// The term of the `prev_log_index` entry.
    pub prev_log_term: Term,
    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// The index of the last entry this request makes the receiver's log agree upon.
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "leader={}-{}, prev_log_id={}-{}, leader_commit={}, entries={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.as_slice().summary()
        )
    }
}

/// Where a follower's log stops agreeing with the leader's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictOpt {
    /// The term of the follower's entry at `prev_log_index`, or 0 if it has no such entry.
    pub term: Term,
    /// The first index the follower holds for `term`, or its last index + 1 if `term` is 0.
    pub index: LogIndex,
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: Term,
    /// Will be true if follower contained entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,
    /// On success, the last index the follower now shares with the leader.
    pub match_index: LogIndex,
    /// A hint for the leader to skip back over a whole conflicting term.
    pub conflict: Option<ConflictOpt>,
}

/// Sent by the leader to a follower whose next entry has been compacted away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// Every RPC request and response that travels between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl Message {
    /// The sender's term. Every message carries one.
    pub fn term(&self) -> Term {
        match self {
            Message::VoteRequest(m) => m.term,
            Message::VoteResponse(m) => m.term,
            Message::AppendEntriesRequest(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
            Message::InstallSnapshotRequest(m) => m.term,
            Message::InstallSnapshotResponse(m) => m.term,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::VoteRequest(_) | Message::AppendEntriesRequest(_) | Message::InstallSnapshotRequest(_)
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::VoteRequest(_) => "VoteRequest",
            Message::VoteResponse(_) => "VoteResponse",
            Message::AppendEntriesRequest(_) => "AppendEntriesRequest",
            Message::AppendEntriesResponse(_) => "AppendEntriesResponse",
            Message::InstallSnapshotRequest(_) => "InstallSnapshotRequest",
            Message::InstallSnapshotResponse(_) => "InstallSnapshotResponse",
        }
    }
}

impl MessageSummary for Message {
    fn summary(&self) -> String {
        match self {
            Message::AppendEntriesRequest(req) => format!("AppendEntriesRequest({})", req.summary()),
            Message::InstallSnapshotRequest(req) => format!(
                "InstallSnapshotRequest(term={}, leader={}, last_included={}, {}b)",
                req.term,
                req.leader_id,
                req.meta.last_included,
                req.data.len()
            ),
            other => format!("{:?}", other),
        }
    }
}

/// A message together with the id of the node that sent it. This is the unit the codec encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: impl Into<NodeId>, message: Message) -> Self {
        Envelope {
            from: from.into(),
            message,
        }
    }
}
