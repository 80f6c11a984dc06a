//! The Raft protocol as a deterministic state machine.
//!
//! [`Engine::step`] consumes one [`Event`] and returns the [`Command`]s the runtime has to
//! execute. The engine owns the node's [`LogStore`] and [`StateMachine`] and writes to them
//! synchronously, so every durable write is done before a `Respond` or `Send` depending on it is
//! handed out. It reads no clock and performs no network I/O: timer expiry and RPC results
//! come back in as events.

mod append_entries;
mod client;
mod replication;
mod snapshot;
mod vote;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod client_test;
#[cfg(test)]
mod replication_test;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use serde::Deserialize;
use serde::Serialize;

use crate::config::Config;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::NetworkError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::Membership;
use crate::messages::Entry;
use crate::messages::EntryPayload;
use crate::messages::Message;
use crate::metrics::RaftMetrics;
use crate::state_machine::StateMachine;
use crate::storage::HardState;
use crate::storage::LogStore;
use crate::LogId;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;
use crate::Term;

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is not a voter: it replicates the log but never votes or campaigns.
    Learner,
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The node stopped after a failure of its durable storage, or was shut down.
    Shutdown,
}

impl State {
    /// Check if currently in learner state.
    pub fn is_learner(&self) -> bool {
        matches!(self, Self::Learner)
    }

    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// An input to the engine.
#[derive(Debug)]
pub enum Event {
    /// The last installed election timer fired.
    ElectionTimeout,
    /// The last installed heartbeat timer fired.
    HeartbeatTimeout,
    /// A request from a peer. The engine answers with exactly one `Command::Respond`.
    RpcReceived { from: NodeId, message: Message },
    /// The outcome of a `Command::Send`, with the request that was sent.
    RpcResult {
        target: NodeId,
        request: Message,
        result: Result<Message, NetworkError>,
    },
    /// Append a command to the replicated log. Answered by a `Command::ClientResponse`.
    ClientWrite { command: Vec<u8> },
    /// Propose a new membership. Answered by a `Command::MembershipResponse`.
    ChangeMembership { membership: Membership },
}

/// A timer the runtime has to (re)arm. Installing a timer replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Election(Duration),
    Heartbeat(Duration),
}

/// An output of the engine, to be executed by the runtime in order.
#[derive(Debug)]
pub enum Command {
    /// Send a request to a peer and feed the outcome back as `Event::RpcResult`.
    Send { target: NodeId, message: Message },
    /// Reply to the request being handled.
    Respond { message: Message },
    /// Reply to the `ClientWrite` being handled.
    ClientResponse(Result<LogId, ClientWriteError>),
    /// Reply to the `ChangeMembership` being handled.
    MembershipResponse(Result<LogId, ChangeMembershipError>),
    InstallTimer(Timer),
}

/// Replication progress of one follower, as tracked by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    pub(crate) next_index: LogIndex,
    pub(crate) match_index: LogIndex,
    /// An append or snapshot request is outstanding.
    pub(crate) inflight: bool,
}

impl Progress {
    pub(crate) fn new(next_index: LogIndex) -> Self {
        Progress {
            next_index,
            match_index: 0,
            inflight: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LeaderState {
    /// One entry per member other than the leader itself, learners included.
    pub(crate) progress: BTreeMap<NodeId, Progress>,
}

#[derive(Debug, Default)]
pub(crate) struct CandidateState {
    pub(crate) votes_granted: BTreeSet<NodeId>,
}

/// The role of a node with its role specific volatile state.
#[derive(Debug)]
pub(crate) enum Role {
    Learner,
    Follower,
    Candidate(CandidateState),
    Leader(LeaderState),
    Shutdown,
}

/// A Raft node's protocol state.
pub struct Engine<S: LogStore, M: StateMachine> {
    pub(crate) id: NodeId,
    pub(crate) config: Arc<Config>,
    pub(crate) store: S,
    pub(crate) state_machine: M,
    pub(crate) rng: StdRng,

    pub(crate) role: Role,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) current_leader: Option<NodeId>,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogId,

    /// The membership a pristine cluster starts with, in effect until a config entry or a
    /// snapshot replaces it.
    pub(crate) bootstrap: Membership,
    /// The effective membership: the latest one in the log, applied as soon as it is appended.
    pub(crate) membership: Membership,
    /// Where `membership` comes from. Index 0 is the bootstrap membership.
    pub(crate) membership_log_id: LogId,

    pub(crate) commands: Vec<Command>,
}

impl<S: LogStore, M: StateMachine> Engine<S, M> {
    /// Load a node from its store.
    ///
    /// The state machine is restored from the latest snapshot; committed entries after it are
    /// re-applied once this node learns the commit index again.
    pub fn new(
        id: impl Into<NodeId>,
        config: Arc<Config>,
        bootstrap: Membership,
        store: S,
        mut state_machine: M,
        rng: StdRng,
    ) -> RaftResult<Self> {
        let id = id.into();
        let hs = store.hard_state();

        let mut last_applied = LogId::default();
        if let Some(snapshot) = store.snapshot() {
            state_machine.restore(&snapshot.data)?;
            last_applied = snapshot.meta.last_included;
        }

        let mut eng = Engine {
            id,
            config,
            store,
            state_machine,
            rng,
            role: Role::Follower,
            current_term: hs.current_term,
            voted_for: hs.voted_for,
            current_leader: None,
            commit_index: last_applied.index,
            last_applied,
            membership: bootstrap.clone(),
            bootstrap,
            membership_log_id: LogId::default(),
            commands: vec![],
        };
        eng.reload_membership();
        eng.role = if eng.is_voter() { Role::Follower } else { Role::Learner };

        tracing::info!(
            id = %eng.id,
            term = eng.current_term,
            voted_for = ?eng.voted_for,
            last_log_id = %eng.store.last_log_id(),
            last_applied = %eng.last_applied,
            state = ?eng.state(),
            "engine loaded"
        );
        Ok(eng)
    }

    /// Commands to run before the first event: a voter arms its election timer.
    pub fn startup(&mut self) -> Vec<Command> {
        if let Role::Follower = self.role {
            self.install_election_timer();
        }
        std::mem::take(&mut self.commands)
    }

    /// Handle one event.
    ///
    /// An `Err` is fatal: the node could not make its state durable and stops. It then
    /// answers every further event with `RaftError::ShuttingDown`.
    #[tracing::instrument(level = "trace", skip_all, fields(id = %self.id, term = self.current_term))]
    pub fn step(&mut self, event: Event) -> RaftResult<Vec<Command>> {
        if let Role::Shutdown = self.role {
            return Err(RaftError::ShuttingDown);
        }

        let res = match event {
            Event::ElectionTimeout => self.handle_election_timeout(),
            Event::HeartbeatTimeout => self.handle_heartbeat_timeout(),
            Event::RpcReceived { from, message } => self.handle_rpc(from, message),
            Event::RpcResult {
                target,
                request,
                result,
            } => self.handle_rpc_result(target, request, result),
            Event::ClientWrite { command } => self.handle_client_write(command),
            Event::ChangeMembership { membership } => self.handle_change_membership(membership),
        };

        match res {
            Ok(()) => Ok(std::mem::take(&mut self.commands)),
            Err(err) => {
                tracing::error!(id = %self.id, error = %err, "storage failure, stop participating in the cluster");
                self.role = Role::Shutdown;
                self.commands.clear();
                Err(err)
            }
        }
    }

    fn handle_rpc(&mut self, from: NodeId, message: Message) -> RaftResult<()> {
        tracing::debug!(%from, message = %message.summary(), "recv rpc");

        if message.term() > self.current_term {
            self.update_term(message.term())?;
        }

        let reply = match message {
            Message::VoteRequest(req) => Message::VoteResponse(self.handle_vote_request(req)?),
            Message::AppendEntriesRequest(req) => Message::AppendEntriesResponse(self.handle_append_entries_request(req)?),
            Message::InstallSnapshotRequest(req) => {
                Message::InstallSnapshotResponse(self.handle_install_snapshot_request(req)?)
            }
            other => {
                tracing::warn!(%from, kind = other.kind_name(), "a response is not a request, dropped");
                return Ok(());
            }
        };
        self.commands.push(Command::Respond { message: reply });
        Ok(())
    }

    fn handle_rpc_result(
        &mut self,
        target: NodeId,
        request: Message,
        result: Result<Message, NetworkError>,
    ) -> RaftResult<()> {
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!(%target, error = %err, kind = request.kind_name(), "rpc failed, treated as dropped");
                self.release_inflight(&target, &request);
                return Ok(());
            }
        };

        if resp.term() > self.current_term {
            return self.update_term(resp.term());
        }

        match (request, resp) {
            (Message::VoteRequest(req), Message::VoteResponse(resp)) => self.handle_vote_response(target, req, resp),
            (Message::AppendEntriesRequest(req), Message::AppendEntriesResponse(resp)) => {
                self.handle_append_entries_response(target, req, resp)
            }
            (Message::InstallSnapshotRequest(req), Message::InstallSnapshotResponse(resp)) => {
                self.handle_install_snapshot_response(target, req, resp)
            }
            (request, resp) => {
                tracing::warn!(
                    %target,
                    request = request.kind_name(),
                    response = resp.kind_name(),
                    "response does not match request, dropped"
                );
                self.release_inflight(&target, &request);
                Ok(())
            }
        }
    }

    /// Adopt a higher term observed in any message: clear the vote and step down.
    pub(crate) fn update_term(&mut self, term: Term) -> RaftResult<()> {
        debug_assert!(term > self.current_term);
        tracing::info!(id = %self.id, from = self.current_term, to = term, "observed higher term");

        self.current_term = term;
        self.voted_for = None;
        self.save_hard_state()?;

        match self.role {
            Role::Leader(_) => {
                self.become_follower();
                self.install_election_timer();
            }
            Role::Candidate(_) => self.become_follower(),
            _ => self.current_leader = None,
        }
        Ok(())
    }

    pub(crate) fn become_follower(&mut self) {
        self.role = if self.is_voter() { Role::Follower } else { Role::Learner };
        self.current_leader = None;
        tracing::info!(id = %self.id, term = self.current_term, state = ?self.state(), "step down");
    }

    pub(crate) fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.store.save_hard_state(&hs)?;
        Ok(())
    }

    pub(crate) fn install_election_timer(&mut self) {
        let timeout = self.config.new_rand_election_timeout(&mut self.rng);
        self.commands.push(Command::InstallTimer(Timer::Election(timeout)));
    }

    pub(crate) fn is_voter(&self) -> bool {
        self.membership.is_voter(&self.id)
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub(crate) fn leader_mut(&mut self) -> Option<&mut LeaderState> {
        match &mut self.role {
            Role::Leader(l) => Some(l),
            _ => None,
        }
    }

    /// The latest membership found at or before `upto`: from a config entry in the log, else
    /// from the snapshot, else the bootstrap one.
    pub(crate) fn membership_upto(&self, upto: LogIndex) -> (LogId, Membership) {
        let snapshot_last = self.store.snapshot_last_log_id().index;
        for index in (snapshot_last + 1..=upto).rev() {
            if let Some(Entry {
                log_id,
                payload: EntryPayload::ConfigChange(m),
            }) = self.store.get_entry(index)
            {
                return (log_id, m);
            }
        }
        match self.store.snapshot() {
            Some(s) => (s.meta.last_included, s.meta.membership.clone()),
            None => (LogId::default(), self.bootstrap.clone()),
        }
    }

    /// Recompute the effective membership from the log, e.g. after a truncation removed the
    /// entry it came from.
    pub(crate) fn reload_membership(&mut self) {
        let (log_id, membership) = self.membership_upto(self.store.last_log_id().index);
        self.membership_log_id = log_id;
        self.membership = membership;
    }

    /// React to a change of the effective membership: a node that gained or lost its vote
    /// changes role, a leader starts or stops replicating to members.
    pub(crate) fn on_membership_changed(&mut self) {
        let voter = self.is_voter();
        tracing::info!(id = %self.id, membership_log_id = %self.membership_log_id, voter, "membership changed");

        match self.role {
            Role::Learner if voter => {
                self.role = Role::Follower;
                self.install_election_timer();
            }
            Role::Follower | Role::Candidate(_) if !voter => {
                self.role = Role::Learner;
            }
            Role::Leader(_) => self.sync_progress_with_membership(),
            _ => {}
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn state(&self) -> State {
        match self.role {
            Role::Learner => State::Learner,
            Role::Follower => State::Follower,
            Role::Candidate(_) => State::Candidate,
            Role::Leader(_) => State::Leader,
            Role::Shutdown => State::Shutdown,
        }
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn current_leader(&self) -> Option<&NodeId> {
        self.current_leader.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogId {
        self.last_applied
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state_machine(&self) -> &M {
        &self.state_machine
    }

    /// Stop the node and hand back its durable part, e.g. to restart on top of it.
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn metrics(&self) -> RaftMetrics {
        RaftMetrics {
            id: self.id.clone(),
            state: self.state(),
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            last_log_index: self.store.last_log_id().index,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader.clone(),
            membership: self.membership.clone(),
            snapshot: self.store.snapshot().map(|s| s.meta.last_included),
        }
    }
}
