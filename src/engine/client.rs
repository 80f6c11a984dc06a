use crate::engine::Command;
use crate::engine::Engine;
use crate::error::ChangeMembershipError;
use crate::error::NotLeaderError;
use crate::error::RaftResult;
use crate::membership::Membership;
use crate::messages::Entry;
use crate::messages::EntryPayload;
use crate::state_machine::StateMachine;
use crate::storage::LogStore;
use crate::LogId;
use crate::MessageSummary;

impl<S: LogStore, M: StateMachine> Engine<S, M> {
    fn not_leader(&self) -> NotLeaderError {
        NotLeaderError {
            leader_id: self.current_leader.clone(),
        }
    }

    /// Durably append an entry of the current term to the leader's log.
    pub(crate) fn append_as_leader(&mut self, payload: EntryPayload) -> RaftResult<LogId> {
        let log_id = LogId::new(self.current_term, self.store.last_log_id().index + 1);
        let entry = Entry { log_id, payload };
        self.store.append(std::slice::from_ref(&entry))?;
        tracing::debug!(id = %self.id, entry = %entry.summary(), "leader append");
        Ok(log_id)
    }

    /// Accept a command from a client.
    ///
    /// The returned log id identifies the entry: once `last_applied` reaches its index, the
    /// command is committed iff the entry at that index still has the same term.
    pub(crate) fn handle_client_write(&mut self, command: Vec<u8>) -> RaftResult<()> {
        if !self.is_leader() {
            let err = self.not_leader();
            self.commands.push(Command::ClientResponse(Err(err.into())));
            return Ok(());
        }

        let log_id = self.append_as_leader(EntryPayload::Normal(command))?;
        self.commands.push(Command::ClientResponse(Ok(log_id)));

        self.leader_commit()?;
        self.send_append_to_idle();
        Ok(())
    }

    /// Propose a new membership, differing from the current one by at most one voter.
    ///
    /// The new membership takes effect as soon as its entry is appended.
    pub(crate) fn handle_change_membership(&mut self, membership: Membership) -> RaftResult<()> {
        match self.check_membership_change(&membership) {
            Ok(()) => {}
            Err(err) => {
                tracing::info!(id = %self.id, error = %err, "reject membership change");
                self.commands.push(Command::MembershipResponse(Err(err)));
                return Ok(());
            }
        }

        let log_id = self.append_as_leader(EntryPayload::ConfigChange(membership.clone()))?;
        self.membership = membership;
        self.membership_log_id = log_id;
        self.on_membership_changed();
        self.commands.push(Command::MembershipResponse(Ok(log_id)));

        self.leader_commit()?;
        self.send_append_to_idle();
        Ok(())
    }

    fn check_membership_change(&self, membership: &Membership) -> Result<(), ChangeMembershipError> {
        if !self.is_leader() {
            return Err(self.not_leader().into());
        }
        if self.membership_log_id.index > self.commit_index {
            return Err(ChangeMembershipError::ChangeInProgress {
                membership_log_id: self.membership_log_id,
            });
        }
        if membership.voting_peers().is_empty() {
            return Err(ChangeMembershipError::EmptyVoters);
        }
        if *membership == self.membership {
            return Err(ChangeMembershipError::Noop);
        }
        let changes = self.membership.voter_changes(membership);
        if changes > 1 {
            return Err(ChangeMembershipError::TooManyVoterChanges { changes });
        }
        Ok(())
    }
}
