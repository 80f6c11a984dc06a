use std::cmp::max;
use std::cmp::min;

use crate::engine::Command;
use crate::engine::Engine;
use crate::engine::Progress;
use crate::engine::Role;
use crate::engine::Timer;
use crate::error::RaftResult;
use crate::error::StorageError;
use crate::messages::AppendEntriesRequest;
use crate::messages::AppendEntriesResponse;
use crate::messages::ConflictOpt;
use crate::messages::EntryPayload;
use crate::messages::InstallSnapshotRequest;
use crate::messages::Message;
use crate::state_machine::StateMachine;
use crate::storage::LogStore;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;

impl<S: LogStore, M: StateMachine> Engine<S, M> {
    pub(crate) fn handle_heartbeat_timeout(&mut self) -> RaftResult<()> {
        if !self.is_leader() {
            tracing::trace!(state = ?self.state(), "ignore heartbeat timeout");
            return Ok(());
        }
        self.commands.push(Command::InstallTimer(Timer::Heartbeat(self.config.heartbeat_interval())));
        self.send_append_to_all();
        Ok(())
    }

    /// Send an AppendEntries to every follower, including the ones with a request in flight.
    pub(crate) fn send_append_to_all(&mut self) {
        for target in self.targets(|_| true) {
            self.send_append(&target);
        }
    }

    /// Send an AppendEntries to every follower with no request in flight.
    pub(crate) fn send_append_to_idle(&mut self) {
        for target in self.targets(|p| !p.inflight) {
            self.send_append(&target);
        }
    }

    fn targets(&self, filter: impl Fn(&Progress) -> bool) -> Vec<NodeId> {
        match &self.role {
            Role::Leader(l) => l.progress.iter().filter(|(_, p)| filter(p)).map(|(id, _)| id.clone()).collect(),
            _ => vec![],
        }
    }

    /// Replicate to `target` from its `next_index`: entries if the log still holds them, the
    /// snapshot otherwise.
    pub(crate) fn send_append(&mut self, target: &NodeId) {
        let progress = match self.leader_mut().and_then(|l| l.progress.get(target)) {
            Some(p) => *p,
            None => return,
        };

        let message = match self.store.snapshot() {
            Some(snapshot) if progress.next_index <= snapshot.meta.last_included.index => {
                Message::InstallSnapshotRequest(InstallSnapshotRequest {
                    term: self.current_term,
                    leader_id: self.id.clone(),
                    meta: snapshot.meta.clone(),
                    data: snapshot.data.clone(),
                })
            }
            _ => {
                let prev_log_index = progress.next_index - 1;
                let prev_log_term = match self.store.term_at(prev_log_index) {
                    Some(t) => t,
                    None => {
                        tracing::warn!(%target, prev_log_index, "no term for prev log index, skip replication");
                        return;
                    }
                };
                let last_index = self.store.last_log_id().index;
                let stop = min(last_index + 1, progress.next_index + self.config.max_payload_entries);
                Message::AppendEntriesRequest(AppendEntriesRequest {
                    term: self.current_term,
                    leader_id: self.id.clone(),
                    prev_log_index,
                    prev_log_term,
                    entries: self.store.entries(progress.next_index, stop),
                    leader_commit: self.commit_index,
                })
            }
        };

        tracing::trace!(%target, message = %message.summary(), "replicate");

        if let Some(p) = self.leader_mut().and_then(|l| l.progress.get_mut(target)) {
            p.inflight = true;
        }
        self.commands.push(Command::Send {
            target: target.clone(),
            message,
        });
    }

    #[tracing::instrument(level = "trace", skip(self, req, resp), fields(id = %self.id))]
    pub(crate) fn handle_append_entries_response(
        &mut self,
        target: NodeId,
        req: AppendEntriesRequest,
        resp: AppendEntriesResponse,
    ) -> RaftResult<()> {
        if req.term != self.current_term || !self.is_leader() {
            tracing::debug!(%target, req_term = req.term, "ignore append entries response of a former term");
            return Ok(());
        }

        let last_log_index = self.store.last_log_id().index;
        let hint = match resp.conflict {
            Some(c) if !resp.success => Some(self.next_index_from_conflict(&req, c)),
            _ => None,
        };

        let progress = match self.leader_mut().and_then(|l| l.progress.get_mut(&target)) {
            Some(p) => p,
            None => return Ok(()),
        };
        progress.inflight = false;

        if resp.success {
            progress.match_index = max(progress.match_index, req.last_index());
            progress.next_index = max(progress.next_index, progress.match_index + 1);
            let behind = progress.next_index <= last_log_index;
            tracing::debug!(%target, match_index = progress.match_index, "replication progressed");

            self.leader_commit()?;
            if behind {
                self.send_append(&target);
            }
            return Ok(());
        }

        // Back off, and retry on the next heartbeat.
        let candidate = hint.unwrap_or(req.prev_log_index);
        let next_index = max(
            max(progress.match_index + 1, 1),
            min(candidate, min(req.prev_log_index, progress.next_index)),
        );
        tracing::debug!(%target, from = progress.next_index, to = next_index, conflict = ?resp.conflict, "log mismatch, back off");
        progress.next_index = next_index;
        Ok(())
    }

    /// Where to resume replication after a follower reported `conflict`: right after this
    /// leader's last entry of the conflicting term, else at the follower's first entry of it.
    fn next_index_from_conflict(&self, req: &AppendEntriesRequest, conflict: ConflictOpt) -> LogIndex {
        if conflict.term == 0 {
            return conflict.index;
        }

        let snapshot_last = self.store.snapshot_last_log_id().index;
        let mut index = min(req.prev_log_index, self.store.last_log_id().index);
        while index > snapshot_last {
            match self.store.term_at(index) {
                Some(t) if t == conflict.term => return index + 1,
                Some(t) if t < conflict.term => break,
                _ => {}
            }
            index -= 1;
        }
        conflict.index
    }

    /// The leader has no request in flight to `target` any more, e.g. the call timed out.
    pub(crate) fn release_inflight(&mut self, target: &NodeId, request: &Message) {
        if request.term() != self.current_term {
            return;
        }
        if let Some(p) = self.leader_mut().and_then(|l| l.progress.get_mut(target)) {
            p.inflight = false;
        }
    }

    /// Advance the commit index to the highest index stored on a majority of voters, if that
    /// entry belongs to the current term.
    pub(crate) fn leader_commit(&mut self) -> RaftResult<()> {
        let leader = match &self.role {
            Role::Leader(l) => l,
            _ => return Ok(()),
        };

        let last_log_index = self.store.last_log_id().index;
        let matched = self
            .membership
            .voting_peers()
            .iter()
            .map(|id| {
                if *id == self.id {
                    last_log_index
                } else {
                    leader.progress.get(id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect::<Vec<_>>();

        let new_commit_index = calculate_new_commit_index(matched, self.commit_index);
        if new_commit_index == self.commit_index {
            return Ok(());
        }
        if self.store.term_at(new_commit_index) != Some(self.current_term) {
            tracing::trace!(new_commit_index, "majority index is of a former term, not committed by counting");
            return Ok(());
        }

        tracing::debug!(id = %self.id, from = self.commit_index, to = new_commit_index, "leader commit");
        self.commit_index = new_commit_index;
        self.apply_committed()?;

        if !self.is_voter() && self.membership_log_id.index <= self.commit_index {
            tracing::info!(id = %self.id, "removed from the voters, leave leadership");
            self.become_follower();
        }
        Ok(())
    }

    /// Apply `(last_applied, commit_index]` to the state machine, in order, exactly once.
    pub(crate) fn apply_committed(&mut self) -> RaftResult<()> {
        while self.last_applied.index < self.commit_index {
            let index = self.last_applied.index + 1;
            let entry = match self.store.get_entry(index) {
                Some(e) => e,
                None => {
                    return Err(StorageError::Corrupted(format!(
                        "committed entry {} is missing from the log",
                        index
                    ))
                    .into())
                }
            };
            if let EntryPayload::Normal(command) = &entry.payload {
                self.state_machine.apply(entry.log_id, command);
            }
            self.last_applied = entry.log_id;
        }
        tracing::trace!(last_applied = %self.last_applied, "applied");

        self.maybe_compact()
    }

    /// Start or stop replicating to members after the membership changed.
    pub(crate) fn sync_progress_with_membership(&mut self) {
        let next_index = self.store.last_log_id().index + 1;
        let id = self.id.clone();
        let members = self.membership.node_ids().filter(|m| **m != id).cloned().collect::<Vec<_>>();

        if let Some(leader) = self.leader_mut() {
            leader.progress.retain(|target, _| members.contains(target));
            for m in members {
                leader.progress.entry(m).or_insert_with(|| Progress::new(next_index));
            }
        }
    }
}

/// Determine the value for `commit_index` based on the matched index of every voter.
///
/// This function calculates the value which is replicated on a majority of `entries` and
/// never goes below `current_commit`.
pub(crate) fn calculate_new_commit_index(mut entries: Vec<LogIndex>, current_commit: LogIndex) -> LogIndex {
    // Handle cases where len < 2.
    let len = entries.len();
    if len == 0 {
        return current_commit;
    } else if len == 1 {
        let only_elem = entries[0];
        return if only_elem < current_commit { current_commit } else { only_elem };
    };

    // Calculate offset which will give the majority slice of high-end.
    entries.sort_unstable();
    let offset = if (len % 2) == 0 { (len / 2) - 1 } else { len / 2 };
    let new_val = entries.get(offset).unwrap_or(&current_commit);
    if new_val < &current_commit {
        current_commit
    } else {
        *new_val
    }
}

