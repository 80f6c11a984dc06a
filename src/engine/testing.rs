//! Helpers for engine unit tests.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::Config;
use crate::error::StorageError;
use crate::config::SnapshotPolicy;
use crate::engine::Command;
use crate::engine::Engine;
use crate::engine::Event;
use crate::engine::Timer;
use crate::membership::Membership;
use crate::messages::AppendEntriesRequest;
use crate::messages::AppendEntriesResponse;
use crate::messages::ConflictOpt;
use crate::messages::Entry;
use crate::messages::Message;
use crate::messages::VoteResponse;
use crate::state_machine::MemStateMachine;
use crate::storage::HardState;
use crate::storage::LogStore;
use crate::storage::MemStore;
use crate::storage::Snapshot;
use crate::LogId;
use crate::LogIndex;
use crate::NodeId;

pub(crate) type UTEngine = Engine<MemStore, MemStateMachine>;

pub(crate) fn log_id(term: u64, index: u64) -> LogId {
    LogId::new(term, index)
}

/// A normal entry with a command derived from its position.
pub(crate) fn ent(term: u64, index: u64) -> Entry {
    crate::storage::store_test::ent(term, index)
}

pub(crate) fn m123() -> Membership {
    Membership::new().with_voter("1", "n1:1").with_voter("2", "n2:1").with_voter("3", "n3:1")
}

pub(crate) fn config() -> Config {
    Config::build("ut".to_string()).validate().expect("valid config")
}

/// Node "1" of `m123()` on top of `store`.
pub(crate) fn eng_with(config: Config, store: MemStore) -> UTEngine {
    Engine::new("1", Arc::new(config), m123(), store, MemStateMachine::new(), StdRng::seed_from_u64(7))
        .expect("load engine")
}

/// A pristine follower "1" of `m123()`.
pub(crate) fn eng() -> UTEngine {
    eng_with(config(), MemStore::new())
}

/// A store holding `entries` and the given term.
pub(crate) fn store_with(term: u64, entries: &[Entry]) -> MemStore {
    let mut store = MemStore::new();
    store
        .save_hard_state(&HardState {
            current_term: term,
            voted_for: None,
        })
        .expect("save hard state");
    store.append(entries).expect("append");
    store
}

/// Drive `eng` through an election it wins with the vote of "2". Returns the commands of
/// taking over leadership.
pub(crate) fn make_leader(eng: &mut UTEngine) -> Vec<Command> {
    eng.step(Event::ElectionTimeout).expect("election");
    let term = eng.current_term;
    let last = eng.store.last_log_id();
    let cmds = eng.step(Event::RpcResult {
        target: "2".to_string(),
        request: Message::VoteRequest(crate::messages::VoteRequest {
            term,
            candidate_id: "1".to_string(),
            last_log_index: last.index,
            last_log_term: last.term,
        }),
        result: Ok(Message::VoteResponse(VoteResponse {
            term,
            vote_granted: true,
        })),
    })
    .expect("vote response");
    assert!(eng.is_leader());
    cmds
}

/// A leader whose followers acknowledged its first heartbeats.
pub(crate) fn leader_with(config: Config, store: MemStore) -> UTEngine {
    let mut eng = eng_with(config, store);
    let cmds = make_leader(&mut eng);
    for (target, req) in appends(&cmds) {
        ack(&mut eng, &target, req);
    }
    eng
}

pub(crate) fn leader() -> UTEngine {
    leader_with(config(), MemStore::new())
}

/// Feed a failed append response from `target` for `req`.
pub(crate) fn reject(eng: &mut UTEngine, target: &str, req: AppendEntriesRequest, conflict: Option<ConflictOpt>) -> Vec<Command> {
    let resp = AppendEntriesResponse {
        term: req.term,
        success: false,
        match_index: 0,
        conflict,
    };
    eng.step(Event::RpcResult {
        target: target.to_string(),
        request: Message::AppendEntriesRequest(req),
        result: Ok(Message::AppendEntriesResponse(resp)),
    })
    .expect("append response")
}

/// The leader's `(next_index, match_index)` of `target`.
pub(crate) fn progress_of(eng: &mut UTEngine, target: &str) -> (u64, u64) {
    let p = eng.leader_mut().and_then(|l| l.progress.get(target)).copied().expect("progress");
    (p.next_index, p.match_index)
}

pub(crate) fn sends(cmds: &[Command]) -> Vec<(NodeId, Message)> {
    cmds.iter()
        .filter_map(|c| match c {
            Command::Send { target, message } => Some((target.clone(), message.clone())),
            _ => None,
        })
        .collect()
}

/// The AppendEntries requests in `cmds`, by target.
pub(crate) fn appends(cmds: &[Command]) -> Vec<(NodeId, AppendEntriesRequest)> {
    sends(cmds)
        .into_iter()
        .filter_map(|(t, m)| match m {
            Message::AppendEntriesRequest(req) => Some((t, req)),
            _ => None,
        })
        .collect()
}

pub(crate) fn responses(cmds: &[Command]) -> Vec<Message> {
    cmds.iter()
        .filter_map(|c| match c {
            Command::Respond { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub(crate) fn timers(cmds: &[Command]) -> Vec<Timer> {
    cmds.iter()
        .filter_map(|c| match c {
            Command::InstallTimer(t) => Some(*t),
            _ => None,
        })
        .collect()
}

pub(crate) fn has_election_timer(cmds: &[Command]) -> bool {
    timers(cmds).iter().any(|t| matches!(t, Timer::Election(_)))
}

/// Feed a successful append response from `target` for `req`.
pub(crate) fn ack(eng: &mut UTEngine, target: &str, req: AppendEntriesRequest) -> Vec<Command> {
    let resp = AppendEntriesResponse {
        term: req.term,
        success: true,
        match_index: req.last_index(),
        conflict: None,
    };
    eng.step(Event::RpcResult {
        target: target.to_string(),
        request: Message::AppendEntriesRequest(req),
        result: Ok(Message::AppendEntriesResponse(resp)),
    })
    .expect("append response")
}

pub(crate) fn config_with_snapshot_every(n: u64) -> Config {
    Config::build("ut".to_string())
        .snapshot_policy(SnapshotPolicy::LogsSinceLast(n))
        .validate()
        .expect("valid config")
}

/// A `MemStore` whose writes can be switched to fail.
#[derive(Debug, Default)]
pub(crate) struct FailingStore {
    pub(crate) inner: MemStore,
    pub(crate) fail_hard_state: bool,
    pub(crate) fail_append: bool,
}

impl FailingStore {
    fn check(&self, fail: bool, what: &str) -> Result<(), StorageError> {
        if fail {
            let err = std::io::Error::other("disk is gone");
            return Err(StorageError::io(what, err));
        }
        Ok(())
    }
}

impl LogStore for FailingStore {
    fn hard_state(&self) -> HardState {
        self.inner.hard_state()
    }

    fn save_hard_state(&mut self, hs: &HardState) -> Result<(), StorageError> {
        self.check(self.fail_hard_state, "save hard state")?;
        self.inner.save_hard_state(hs)
    }

    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        self.check(self.fail_append, "append")?;
        self.inner.append(entries)
    }

    fn get_entry(&self, index: LogIndex) -> Option<Entry> {
        self.inner.get_entry(index)
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.check(self.fail_append, "truncate")?;
        self.inner.truncate_from(index)
    }

    fn last_log_id(&self) -> LogId {
        self.inner.last_log_id()
    }

    fn snapshot(&self) -> Option<&Snapshot> {
        self.inner.snapshot()
    }

    fn compact(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.inner.compact(snapshot)
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.inner.install_snapshot(snapshot)
    }
}

/// Follower "1" of `m123()` on a `FailingStore`.
pub(crate) fn failing_eng() -> Engine<FailingStore, MemStateMachine> {
    Engine::new(
        "1",
        Arc::new(config()),
        m123(),
        FailingStore::default(),
        MemStateMachine::new(),
        StdRng::seed_from_u64(7),
    )
    .expect("load engine")
}
