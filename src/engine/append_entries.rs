use std::cmp::min;

use crate::engine::Engine;
use crate::engine::Role;
use crate::error::RaftResult;
use crate::messages::AppendEntriesRequest;
use crate::messages::AppendEntriesResponse;
use crate::messages::ConflictOpt;
use crate::messages::EntryPayload;
use crate::state_machine::StateMachine;
use crate::storage::LogStore;
use crate::LogIndex;
use crate::MessageSummary;
use crate::Term;

impl<S: LogStore, M: StateMachine> Engine<S, M> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    ///
    /// Entries are durable before a successful response is returned.
    #[tracing::instrument(level = "trace", skip(self, req), fields(id = %self.id, req = %req.summary()))]
    pub(crate) fn handle_append_entries_request(&mut self, req: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.current_term {
            tracing::debug!(req_term = req.term, leader = %req.leader_id, "reject append entries of a stale term");
            return Ok(self.append_rejected(None));
        }

        match self.role {
            Role::Candidate(_) => self.become_follower(),
            Role::Leader(_) => {
                tracing::error!(leader = %req.leader_id, term = req.term, "another leader of the same term, reject");
                return Ok(self.append_rejected(None));
            }
            _ => {}
        }

        self.current_leader = Some(req.leader_id.clone());
        if let Role::Follower = self.role {
            self.install_election_timer();
        }

        // Everything up to the snapshot is committed and therefore matches the leader.
        let snapshot_last = self.store.snapshot_last_log_id();
        if req.prev_log_index >= snapshot_last.index {
            match self.store.term_at(req.prev_log_index) {
                None => {
                    let conflict = ConflictOpt {
                        term: 0,
                        index: self.store.last_log_id().index + 1,
                    };
                    tracing::debug!(prev_log_index = req.prev_log_index, ?conflict, "prev log entry not found");
                    return Ok(self.append_rejected(Some(conflict)));
                }
                Some(term) if term != req.prev_log_term => {
                    let conflict = ConflictOpt {
                        term,
                        index: self.first_index_of_term(term, req.prev_log_index),
                    };
                    tracing::debug!(prev_log_term = req.prev_log_term, ?conflict, "prev log entry conflicts");
                    return Ok(self.append_rejected(Some(conflict)));
                }
                Some(_) => {}
            }
        }

        let mut first_new = req.entries.len();
        let mut truncated = false;
        for (i, entry) in req.entries.iter().enumerate() {
            if entry.index() <= snapshot_last.index {
                continue;
            }
            match self.store.term_at(entry.index()) {
                Some(term) if term == entry.term() => continue,
                Some(term) => {
                    if entry.index() <= self.commit_index {
                        tracing::error!(
                            entry = %entry.log_id,
                            local_term = term,
                            commit_index = self.commit_index,
                            "leader conflicts with a committed entry, reject"
                        );
                        return Ok(self.append_rejected(None));
                    }
                    tracing::info!(id = %self.id, from = entry.index(), local_term = term, "truncate conflicting log");
                    self.store.truncate_from(entry.index())?;
                    truncated = true;
                }
                None => {}
            }
            first_new = i;
            break;
        }

        let new_entries = &req.entries[first_new..];
        self.store.append(new_entries)?;

        let has_config = new_entries.iter().any(|e| matches!(e.payload, EntryPayload::ConfigChange(_)));
        if truncated || has_config {
            let before = self.membership_log_id;
            self.reload_membership();
            if self.membership_log_id != before {
                self.on_membership_changed();
            }
        }

        let new_commit_index = min(req.leader_commit, req.last_index());
        if new_commit_index > self.commit_index {
            tracing::debug!(from = self.commit_index, to = new_commit_index, "follower commit");
            self.commit_index = new_commit_index;
            self.apply_committed()?;
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: req.last_index(),
            conflict: None,
        })
    }

    fn append_rejected(&self, conflict: Option<ConflictOpt>) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
            match_index: 0,
            conflict,
        }
    }

    /// The first index of the run of `term` entries that ends at or after `index`.
    fn first_index_of_term(&self, term: Term, mut index: LogIndex) -> LogIndex {
        let snapshot_last = self.store.snapshot_last_log_id().index;
        while index > snapshot_last + 1 && self.store.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }
}
