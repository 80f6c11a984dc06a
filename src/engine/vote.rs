use crate::engine::CandidateState;
use crate::engine::Command;
use crate::engine::Engine;
use crate::engine::LeaderState;
use crate::engine::Progress;
use crate::engine::Role;
use crate::engine::Timer;
use crate::error::RaftResult;
use crate::messages::EntryPayload;
use crate::messages::Message;
use crate::messages::VoteRequest;
use crate::messages::VoteResponse;
use crate::state_machine::StateMachine;
use crate::storage::LogStore;
use crate::NodeId;

impl<S: LogStore, M: StateMachine> Engine<S, M> {
    pub(crate) fn handle_election_timeout(&mut self) -> RaftResult<()> {
        match self.role {
            Role::Follower | Role::Candidate(_) => self.start_election(),
            _ => {
                tracing::trace!(state = ?self.state(), "ignore election timeout");
                Ok(())
            }
        }
    }

    /// Become a candidate of the next term and solicit votes from the other voters.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id))]
    pub(crate) fn start_election(&mut self) -> RaftResult<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.save_hard_state()?;

        let mut candidate = CandidateState::default();
        candidate.votes_granted.insert(self.id.clone());
        self.role = Role::Candidate(candidate);
        self.current_leader = None;
        self.install_election_timer();

        tracing::info!(id = %self.id, term = self.current_term, "start election");

        if self.membership.is_quorum(std::iter::once(&self.id)) {
            return self.become_leader();
        }

        let last_log_id = self.store.last_log_id();
        let req = VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: last_log_id.index,
            last_log_term: last_log_id.term,
        };
        for target in self.membership.voting_peers() {
            if target == self.id {
                continue;
            }
            self.commands.push(Command::Send {
                target,
                message: Message::VoteRequest(req.clone()),
            });
        }
        Ok(())
    }

    /// Decide whether to grant a vote. A higher term in `req` has already been adopted.
    ///
    /// A grant is made durable before it is returned.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = %self.id, candidate = %req.candidate_id))]
    pub(crate) fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        let reject = |reason: &str, term| {
            tracing::debug!(reason, req_term = req.term, "reject vote request");
            VoteResponse {
                term,
                vote_granted: false,
            }
        };

        if req.term < self.current_term {
            return Ok(reject("stale term", self.current_term));
        }

        if !self.is_voter() {
            return Ok(reject("not a voter", self.current_term));
        }

        if let Some(voted_for) = &self.voted_for {
            if voted_for != &req.candidate_id {
                return Ok(reject("already voted for another candidate", self.current_term));
            }
        }

        let last_log_id = self.store.last_log_id();
        if req.last_log_id() < last_log_id {
            return Ok(reject("candidate log is not up to date", self.current_term));
        }

        self.voted_for = Some(req.candidate_id.clone());
        self.save_hard_state()?;
        self.install_election_timer();

        tracing::info!(id = %self.id, term = self.current_term, candidate = %req.candidate_id, "grant vote");
        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: true,
        })
    }

    pub(crate) fn handle_vote_response(&mut self, target: NodeId, req: VoteRequest, resp: VoteResponse) -> RaftResult<()> {
        if req.term != self.current_term {
            tracing::debug!(%target, req_term = req.term, "ignore vote response of a former election");
            return Ok(());
        }

        let candidate = match &mut self.role {
            Role::Candidate(c) => c,
            _ => return Ok(()),
        };

        if !resp.vote_granted {
            tracing::debug!(%target, "vote rejected");
            return Ok(());
        }

        candidate.votes_granted.insert(target);
        if self.membership.is_quorum(candidate.votes_granted.iter()) {
            return self.become_leader();
        }
        Ok(())
    }

    /// Take over leadership for the current term.
    ///
    /// A blank entry of the new term is appended and replicated at once: entries of former terms
    /// only commit together with an entry of the current one.
    pub(crate) fn become_leader(&mut self) -> RaftResult<()> {
        let next_index = self.store.last_log_id().index + 1;
        let progress = self
            .membership
            .node_ids()
            .filter(|id| **id != self.id)
            .map(|id| (id.clone(), Progress::new(next_index)))
            .collect();

        self.role = Role::Leader(LeaderState { progress });
        self.current_leader = Some(self.id.clone());
        tracing::info!(id = %self.id, term = self.current_term, "become leader");

        self.commands.push(Command::InstallTimer(Timer::Heartbeat(self.config.heartbeat_interval())));
        self.append_as_leader(EntryPayload::Blank)?;
        self.send_append_to_all();

        // A single voter commits on its own.
        self.leader_commit()
    }
}
