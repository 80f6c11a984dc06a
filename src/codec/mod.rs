//! The binary wire format of Raft messages.
//!
//! Every message is an [`Envelope`] table (sender id, message kind, body table) inside a single
//! size-prefixed buffer. Fields are addressed by small slot numbers; a reader treats a slot it
//! does not know as nonexistent and an absent slot as zero/empty, so fields can be added without
//! breaking older readers. The size prefix doubles as the frame length on stream transports.

mod builder;
mod table;

pub use builder::Builder;
pub use builder::WIPOffset;
pub use table::root;
pub use table::Table;

use crate::error::DecodeError;
use crate::membership::Membership;
use crate::messages::AppendEntriesRequest;
use crate::messages::AppendEntriesResponse;
use crate::messages::ConflictOpt;
use crate::messages::Entry;
use crate::messages::EntryPayload;
use crate::messages::Envelope;
use crate::messages::InstallSnapshotRequest;
use crate::messages::InstallSnapshotResponse;
use crate::messages::Message;
use crate::messages::VoteRequest;
use crate::messages::VoteResponse;
use crate::storage::Snapshot;
use crate::storage::SnapshotMeta;
use crate::LogId;

/// Length of the size prefix in front of every encoded buffer.
pub const SIZE_PREFIX_LEN: usize = 4;

pub(crate) mod kind {
    pub const VOTE_REQUEST: u8 = 1;
    pub const VOTE_RESPONSE: u8 = 2;
    pub const APPEND_ENTRIES_REQUEST: u8 = 3;
    pub const APPEND_ENTRIES_RESPONSE: u8 = 4;
    pub const INSTALL_SNAPSHOT_REQUEST: u8 = 5;
    pub const INSTALL_SNAPSHOT_RESPONSE: u8 = 6;
}

const PAYLOAD_NORMAL: u8 = 0;
const PAYLOAD_CONFIG: u8 = 1;
const PAYLOAD_BLANK: u8 = 2;

mod slot {
    // Envelope
    pub const SENDER: u16 = 0;
    pub const BODY: u16 = 1;
    pub const KIND: u16 = 2;

    // All message bodies
    pub const TERM: u16 = 0;

    // VoteRequest
    pub const CANDIDATE_ID: u16 = 1;
    pub const LAST_LOG_INDEX: u16 = 2;
    pub const LAST_LOG_TERM: u16 = 3;

    // VoteResponse
    pub const VOTE_GRANTED: u16 = 1;

    // AppendEntriesRequest
    pub const LEADER_ID: u16 = 1;
    pub const PREV_LOG_INDEX: u16 = 2;
    pub const PREV_LOG_TERM: u16 = 3;
    pub const ENTRIES: u16 = 4;
    pub const LEADER_COMMIT: u16 = 5;

    // AppendEntriesResponse
    pub const SUCCESS: u16 = 1;
    pub const MATCH_INDEX: u16 = 2;
    pub const CONFLICT_TERM: u16 = 3;
    pub const CONFLICT_INDEX: u16 = 4;
    pub const HAS_CONFLICT: u16 = 5;

    // InstallSnapshotRequest, LEADER_ID shared with AppendEntriesRequest
    pub const SNAPSHOT: u16 = 2;

    // Entry
    pub const ENTRY_TERM: u16 = 0;
    pub const ENTRY_INDEX: u16 = 1;
    pub const PAYLOAD_KIND: u16 = 2;
    pub const COMMAND: u16 = 3;
    pub const MEMBERSHIP: u16 = 4;

    // Membership
    pub const MEMBERS: u16 = 0;

    // Member
    pub const MEMBER_ID: u16 = 0;
    pub const MEMBER_ADDR: u16 = 1;
    pub const MEMBER_VOTER: u16 = 2;

    // Snapshot
    pub const LAST_INCLUDED_TERM: u16 = 0;
    pub const LAST_INCLUDED_INDEX: u16 = 1;
    pub const SNAPSHOT_MEMBERSHIP: u16 = 2;
    pub const SNAPSHOT_DATA: u16 = 3;
}

/// Encode a message and its sender into a single size-prefixed buffer.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut b = Builder::with_capacity(estimated_size(&envelope.message));

    let (message_kind, body) = write_message(&mut b, &envelope.message);
    let sender = b.create_string(&envelope.from);

    b.start_table();
    b.add_offset(slot::SENDER, sender);
    b.add_offset(slot::BODY, body);
    b.add_u8(slot::KIND, message_kind, 0);
    let root = b.end_table();

    b.finish(root)
}

/// Decode a buffer produced by [`encode`].
pub fn decode(buf: &[u8]) -> Result<Envelope, DecodeError> {
    let root = table::root(buf)?;

    let from = root.str(slot::SENDER)?.unwrap_or_default().to_string();
    let message_kind = root.u8(slot::KIND, 0)?;
    let body = root.table(slot::BODY)?;
    let message = read_message(message_kind, body)?;

    Ok(Envelope { from, message })
}

/// Encode a single log entry, as stored by file based log stores.
pub fn encode_entry(entry: &Entry) -> Vec<u8> {
    let mut b = Builder::default();
    let root = write_entry(&mut b, entry);
    b.finish(root)
}

pub fn decode_entry(buf: &[u8]) -> Result<Entry, DecodeError> {
    read_entry(Some(table::root(buf)?))
}

/// Encode a snapshot with its metadata.
pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    let mut b = Builder::with_capacity(snapshot.data.len() + 256);
    let root = write_snapshot(&mut b, &snapshot.meta, &snapshot.data);
    b.finish(root)
}

pub fn decode_snapshot(buf: &[u8]) -> Result<Snapshot, DecodeError> {
    let (meta, data) = read_snapshot(Some(table::root(buf)?))?;
    Ok(Snapshot { meta, data })
}

fn estimated_size(message: &Message) -> usize {
    match message {
        Message::AppendEntriesRequest(req) => {
            128 + req
                .entries
                .iter()
                .map(|e| match &e.payload {
                    EntryPayload::Normal(cmd) => 48 + cmd.len(),
                    EntryPayload::ConfigChange(m) => 48 + 64 * m.len(),
                    EntryPayload::Blank => 48,
                })
                .sum::<usize>()
        }
        Message::InstallSnapshotRequest(req) => 256 + req.data.len(),
        _ => 128,
    }
}

fn write_message(b: &mut Builder, message: &Message) -> (u8, WIPOffset) {
    match message {
        Message::VoteRequest(req) => {
            let candidate_id = b.create_string(&req.candidate_id);
            b.start_table();
            b.add_u64(slot::TERM, req.term, 0);
            b.add_offset(slot::CANDIDATE_ID, candidate_id);
            b.add_u64(slot::LAST_LOG_INDEX, req.last_log_index, 0);
            b.add_u64(slot::LAST_LOG_TERM, req.last_log_term, 0);
            (kind::VOTE_REQUEST, b.end_table())
        }
        Message::VoteResponse(resp) => {
            b.start_table();
            b.add_u64(slot::TERM, resp.term, 0);
            b.add_bool(slot::VOTE_GRANTED, resp.vote_granted, false);
            (kind::VOTE_RESPONSE, b.end_table())
        }
        Message::AppendEntriesRequest(req) => {
            let entries = req.entries.iter().map(|e| write_entry(b, e)).collect::<Vec<_>>();
            let entries = b.create_vector(&entries);
            let leader_id = b.create_string(&req.leader_id);
            b.start_table();
            b.add_u64(slot::TERM, req.term, 0);
            b.add_offset(slot::LEADER_ID, leader_id);
            b.add_u64(slot::PREV_LOG_INDEX, req.prev_log_index, 0);
            b.add_u64(slot::PREV_LOG_TERM, req.prev_log_term, 0);
            b.add_offset(slot::ENTRIES, entries);
            b.add_u64(slot::LEADER_COMMIT, req.leader_commit, 0);
            (kind::APPEND_ENTRIES_REQUEST, b.end_table())
        }
        Message::AppendEntriesResponse(resp) => {
            b.start_table();
            b.add_u64(slot::TERM, resp.term, 0);
            b.add_bool(slot::SUCCESS, resp.success, false);
            b.add_u64(slot::MATCH_INDEX, resp.match_index, 0);
            if let Some(conflict) = resp.conflict {
                b.add_u64(slot::CONFLICT_TERM, conflict.term, 0);
                b.add_u64(slot::CONFLICT_INDEX, conflict.index, 0);
                b.add_bool(slot::HAS_CONFLICT, true, false);
            }
            (kind::APPEND_ENTRIES_RESPONSE, b.end_table())
        }
        Message::InstallSnapshotRequest(req) => {
            let snapshot = write_snapshot(b, &req.meta, &req.data);
            let leader_id = b.create_string(&req.leader_id);
            b.start_table();
            b.add_u64(slot::TERM, req.term, 0);
            b.add_offset(slot::LEADER_ID, leader_id);
            b.add_offset(slot::SNAPSHOT, snapshot);
            (kind::INSTALL_SNAPSHOT_REQUEST, b.end_table())
        }
        Message::InstallSnapshotResponse(resp) => {
            b.start_table();
            b.add_u64(slot::TERM, resp.term, 0);
            (kind::INSTALL_SNAPSHOT_RESPONSE, b.end_table())
        }
    }
}

fn read_message(message_kind: u8, body: Option<Table<'_>>) -> Result<Message, DecodeError> {
    let term = u64_field(body, slot::TERM)?;

    let message = match message_kind {
        kind::VOTE_REQUEST => Message::VoteRequest(VoteRequest {
            term,
            candidate_id: str_field(body, slot::CANDIDATE_ID)?,
            last_log_index: u64_field(body, slot::LAST_LOG_INDEX)?,
            last_log_term: u64_field(body, slot::LAST_LOG_TERM)?,
        }),
        kind::VOTE_RESPONSE => Message::VoteResponse(VoteResponse {
            term,
            vote_granted: bool_field(body, slot::VOTE_GRANTED)?,
        }),
        kind::APPEND_ENTRIES_REQUEST => {
            let entries = match body {
                None => vec![],
                Some(t) => t.tables(slot::ENTRIES)?.into_iter().map(|e| read_entry(Some(e))).collect::<Result<Vec<_>, _>>()?,
            };
            Message::AppendEntriesRequest(AppendEntriesRequest {
                term,
                leader_id: str_field(body, slot::LEADER_ID)?,
                prev_log_index: u64_field(body, slot::PREV_LOG_INDEX)?,
                prev_log_term: u64_field(body, slot::PREV_LOG_TERM)?,
                entries,
                leader_commit: u64_field(body, slot::LEADER_COMMIT)?,
            })
        }
        kind::APPEND_ENTRIES_RESPONSE => {
            let conflict = if bool_field(body, slot::HAS_CONFLICT)? {
                Some(ConflictOpt {
                    term: u64_field(body, slot::CONFLICT_TERM)?,
                    index: u64_field(body, slot::CONFLICT_INDEX)?,
                })
            } else {
                None
            };
            Message::AppendEntriesResponse(AppendEntriesResponse {
                term,
                success: bool_field(body, slot::SUCCESS)?,
                match_index: u64_field(body, slot::MATCH_INDEX)?,
                conflict,
            })
        }
        kind::INSTALL_SNAPSHOT_REQUEST => {
            let snapshot = match body {
                None => None,
                Some(t) => t.table(slot::SNAPSHOT)?,
            };
            let (meta, data) = read_snapshot(snapshot)?;
            Message::InstallSnapshotRequest(InstallSnapshotRequest {
                term,
                leader_id: str_field(body, slot::LEADER_ID)?,
                meta,
                data,
            })
        }
        kind::INSTALL_SNAPSHOT_RESPONSE => Message::InstallSnapshotResponse(InstallSnapshotResponse { term }),
        unknown => return Err(DecodeError::UnknownMessageKind(unknown)),
    };
    Ok(message)
}

fn write_entry(b: &mut Builder, entry: &Entry) -> WIPOffset {
    match &entry.payload {
        EntryPayload::Normal(command) => {
            let command = b.create_bytes(command);
            b.start_table();
            b.add_u64(slot::ENTRY_TERM, entry.log_id.term, 0);
            b.add_u64(slot::ENTRY_INDEX, entry.log_id.index, 0);
            b.add_u8(slot::PAYLOAD_KIND, PAYLOAD_NORMAL, PAYLOAD_NORMAL);
            b.add_offset(slot::COMMAND, command);
            b.end_table()
        }
        EntryPayload::ConfigChange(membership) => {
            let membership = write_membership(b, membership);
            b.start_table();
            b.add_u64(slot::ENTRY_TERM, entry.log_id.term, 0);
            b.add_u64(slot::ENTRY_INDEX, entry.log_id.index, 0);
            b.add_u8(slot::PAYLOAD_KIND, PAYLOAD_CONFIG, PAYLOAD_NORMAL);
            b.add_offset(slot::MEMBERSHIP, membership);
            b.end_table()
        }
        EntryPayload::Blank => {
            b.start_table();
            b.add_u64(slot::ENTRY_TERM, entry.log_id.term, 0);
            b.add_u64(slot::ENTRY_INDEX, entry.log_id.index, 0);
            b.add_u8(slot::PAYLOAD_KIND, PAYLOAD_BLANK, PAYLOAD_NORMAL);
            b.end_table()
        }
    }
}

fn read_entry(t: Option<Table<'_>>) -> Result<Entry, DecodeError> {
    let log_id = LogId::new(u64_field(t, slot::ENTRY_TERM)?, u64_field(t, slot::ENTRY_INDEX)?);
    let payload_kind = match t {
        None => PAYLOAD_NORMAL,
        Some(t) => t.u8(slot::PAYLOAD_KIND, PAYLOAD_NORMAL)?,
    };
    let payload = match payload_kind {
        PAYLOAD_NORMAL => EntryPayload::Normal(bytes_field(t, slot::COMMAND)?),
        PAYLOAD_CONFIG => {
            let m = match t {
                None => None,
                Some(t) => t.table(slot::MEMBERSHIP)?,
            };
            EntryPayload::ConfigChange(read_membership(m)?)
        }
        PAYLOAD_BLANK => EntryPayload::Blank,
        unknown => return Err(DecodeError::UnknownPayloadKind(unknown)),
    };
    Ok(Entry { log_id, payload })
}

fn write_membership(b: &mut Builder, membership: &Membership) -> WIPOffset {
    let mut members = Vec::with_capacity(membership.len());
    for (id, member) in membership.members() {
        let id = b.create_string(id);
        let addr = b.create_string(&member.addr);
        b.start_table();
        b.add_offset(slot::MEMBER_ID, id);
        b.add_offset(slot::MEMBER_ADDR, addr);
        b.add_bool(slot::MEMBER_VOTER, member.voter, false);
        members.push(b.end_table());
    }
    let members = b.create_vector(&members);

    b.start_table();
    b.add_offset(slot::MEMBERS, members);
    b.end_table()
}

fn read_membership(t: Option<Table<'_>>) -> Result<Membership, DecodeError> {
    let mut membership = Membership::new();
    let members = match t {
        None => return Ok(membership),
        Some(t) => t.tables(slot::MEMBERS)?,
    };
    for m in members {
        let m = Some(m);
        membership.insert(
            str_field(m, slot::MEMBER_ID)?,
            str_field(m, slot::MEMBER_ADDR)?,
            bool_field(m, slot::MEMBER_VOTER)?,
        );
    }
    Ok(membership)
}

fn write_snapshot(b: &mut Builder, meta: &SnapshotMeta, data: &[u8]) -> WIPOffset {
    let data = b.create_bytes(data);
    let membership = write_membership(b, &meta.membership);
    b.start_table();
    b.add_u64(slot::LAST_INCLUDED_TERM, meta.last_included.term, 0);
    b.add_u64(slot::LAST_INCLUDED_INDEX, meta.last_included.index, 0);
    b.add_offset(slot::SNAPSHOT_MEMBERSHIP, membership);
    b.add_offset(slot::SNAPSHOT_DATA, data);
    b.end_table()
}

fn read_snapshot(t: Option<Table<'_>>) -> Result<(SnapshotMeta, Vec<u8>), DecodeError> {
    let last_included = LogId::new(u64_field(t, slot::LAST_INCLUDED_TERM)?, u64_field(t, slot::LAST_INCLUDED_INDEX)?);
    let membership = match t {
        None => None,
        Some(t) => t.table(slot::SNAPSHOT_MEMBERSHIP)?,
    };
    let meta = SnapshotMeta {
        last_included,
        membership: read_membership(membership)?,
    };
    Ok((meta, bytes_field(t, slot::SNAPSHOT_DATA)?))
}

// An absent table reads as a table with every field absent.

fn u64_field(t: Option<Table<'_>>, slot: u16) -> Result<u64, DecodeError> {
    t.map_or(Ok(0), |t| t.u64(slot, 0))
}

fn bool_field(t: Option<Table<'_>>, slot: u16) -> Result<bool, DecodeError> {
    t.map_or(Ok(false), |t| t.bool(slot, false))
}

fn str_field(t: Option<Table<'_>>, slot: u16) -> Result<String, DecodeError> {
    match t {
        None => Ok(String::new()),
        Some(t) => Ok(t.str(slot)?.unwrap_or_default().to_string()),
    }
}

fn bytes_field(t: Option<Table<'_>>, slot: u16) -> Result<Vec<u8>, DecodeError> {
    match t {
        None => Ok(vec![]),
        Some(t) => Ok(t.bytes(slot)?.unwrap_or_default().to_vec()),
    }
}
