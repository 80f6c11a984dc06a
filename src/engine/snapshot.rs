use std::cmp::max;

use crate::config::SnapshotPolicy;
use crate::engine::Engine;
use crate::engine::Role;
use crate::error::RaftResult;
use crate::messages::InstallSnapshotRequest;
use crate::messages::InstallSnapshotResponse;
use crate::state_machine::StateMachine;
use crate::storage::LogStore;
use crate::storage::Snapshot;
use crate::storage::SnapshotMeta;
use crate::NodeId;

impl<S: LogStore, M: StateMachine> Engine<S, M> {
    /// Fold the applied log into a snapshot once enough entries piled up since the last one.
    pub(crate) fn maybe_compact(&mut self) -> RaftResult<()> {
        let SnapshotPolicy::LogsSinceLast(threshold) = self.config.snapshot_policy;

        let snapshot_last = self.store.snapshot_last_log_id();
        if self.last_applied.index <= snapshot_last.index || self.last_applied.index - snapshot_last.index < threshold {
            return Ok(());
        }

        let data = self.state_machine.snapshot()?;
        let (_, membership) = self.membership_upto(self.last_applied.index);
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included: self.last_applied,
                membership,
            },
            data,
        };
        self.store.compact(snapshot)?;

        tracing::info!(id = %self.id, last_included = %self.last_applied, "log compacted");
        Ok(())
    }

    /// Replace the state machine and the log prefix with the leader's snapshot.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = %self.id, last_included = %req.meta.last_included))]
    pub(crate) fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        let resp = InstallSnapshotResponse {
            term: self.current_term,
        };

        if req.term < self.current_term {
            tracing::debug!(req_term = req.term, "reject snapshot of a stale term");
            return Ok(resp);
        }

        match self.role {
            Role::Candidate(_) => self.become_follower(),
            Role::Leader(_) => {
                tracing::error!(leader = %req.leader_id, term = req.term, "another leader of the same term, reject");
                return Ok(resp);
            }
            _ => {}
        }

        self.current_leader = Some(req.leader_id.clone());
        if let Role::Follower = self.role {
            self.install_election_timer();
        }

        let last_included = req.meta.last_included;
        if last_included.index <= self.commit_index {
            tracing::debug!(commit_index = self.commit_index, "snapshot is already covered by the committed log");
            return Ok(resp);
        }

        self.store.install_snapshot(Snapshot {
            meta: req.meta,
            data: req.data,
        })?;
        if let Some(snapshot) = self.store.snapshot() {
            self.state_machine.restore(&snapshot.data)?;
        }
        self.commit_index = last_included.index;
        self.last_applied = last_included;

        let before = self.membership_log_id;
        self.reload_membership();
        if self.membership_log_id != before {
            self.on_membership_changed();
        }

        tracing::info!(id = %self.id, %last_included, last_log_id = %self.store.last_log_id(), "snapshot installed");
        Ok(resp)
    }

    pub(crate) fn handle_install_snapshot_response(
        &mut self,
        target: NodeId,
        req: InstallSnapshotRequest,
        _resp: InstallSnapshotResponse,
    ) -> RaftResult<()> {
        if req.term != self.current_term {
            return Ok(());
        }

        let last_log_index = self.store.last_log_id().index;
        let progress = match self.leader_mut().and_then(|l| l.progress.get_mut(&target)) {
            Some(p) => p,
            None => return Ok(()),
        };
        progress.inflight = false;
        progress.match_index = max(progress.match_index, req.meta.last_included.index);
        progress.next_index = max(progress.next_index, progress.match_index + 1);
        let behind = progress.next_index <= last_log_index;
        tracing::debug!(%target, match_index = progress.match_index, "snapshot installed on follower");

        self.leader_commit()?;
        if behind {
            self.send_append(&target);
        }
        Ok(())
    }
}
