//! Raft metrics for observability.
//!
//! Metrics are observed on a running Raft node via the `Raft::metrics()` method, which returns a
//! `watch` channel updated after every state transition. Tests and applications use [`Wait`] to
//! block until a node reaches some state, e.g. until a write is applied.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::engine::State;
use crate::membership::Membership;
use crate::LogId;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;
use crate::Term;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: Term,
    /// The candidate this node voted for in `current_term`.
    pub voted_for: Option<NodeId>,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: LogIndex,
    /// The highest log index known to be committed.
    pub commit_index: LogIndex,
    /// The last log entry applied to this Raft node's state machine.
    pub last_applied: LogId,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The effective membership of the cluster.
    pub membership: Membership,
    /// The last log id included in the latest snapshot.
    pub snapshot: Option<LogId>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId, membership: Membership) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            voted_for: None,
            last_log_index: 0,
            commit_index: 0,
            last_applied: LogId::default(),
            current_leader: None,
            membership,
            snapshot: None,
        }
    }
}

impl MessageSummary for RaftMetrics {
    fn summary(&self) -> String {
        format!(
            "Metrics{{id:{},{:?}, term:{}, last_log:{}, commit:{}, last_applied:{}, leader:{:?}, snapshot:{:?}}}",
            self.id,
            self.state,
            self.current_term,
            self.last_log_index,
            self.commit_index,
            self.last_applied,
            self.current_leader,
            self.snapshot,
        )
    }
}

// Error variants related to metrics.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Wait is a wrapper of RaftMetrics channel that impls several utils to wait for metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy some condition or timeout.
    #[tracing::instrument(level = "trace", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let timeout_at = Instant::now() + self.timeout;

        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();

            tracing::debug!(id = %latest.id, "wait {} latest: {}", msg.to_string(), latest.summary());

            if func(&latest) {
                tracing::debug!(id = %latest.id, "done wait {} latest: {}", msg.to_string(), latest.summary());
                return Ok(latest);
            }

            let now = Instant::now();
            if now >= timeout_at {
                return Err(WaitError::Timeout(
                    self.timeout,
                    format!("{} latest: {}", msg.to_string(), latest.summary()),
                ));
            }

            let delay = tokio::time::sleep_until(timeout_at);

            tokio::select! {
                _ = delay => {
                    tracing::debug!(id = %latest.id, "timeout wait {} latest: {}", msg.to_string(), latest.summary());
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {}", msg.to_string(), latest.summary())));
                }
                changed = rx.changed() => {
                    if let Err(err) = changed {
                        tracing::debug!(id = %latest.id, error = %err, "metrics channel closed, wait {}", msg.to_string());
                        return Err(WaitError::ShuttingDown);
                    }
                }
            };
        }
    }

    /// Wait for `current_leader` to become `Some(leader_id)` until timeout.
    pub async fn current_leader(&self, leader_id: &str, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader.as_deref() == Some(leader_id),
            &format!("{} .current_leader -> {}", msg.to_string(), leader_id),
        )
        .await
    }

    /// Wait until exactly `want_log_index` logs are appended and applied, or timeout.
    pub async fn log(&self, want_log_index: LogIndex, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index == want_log_index,
            &format!("{} .last_log_index -> {}", msg.to_string(), want_log_index),
        )
        .await?;

        self.metrics(
            |x| x.last_applied.index == want_log_index,
            &format!("{} .last_applied -> {}", msg.to_string(), want_log_index),
        )
        .await
    }

    /// Wait until at least `want_log_index` logs are applied, or timeout.
    pub async fn applied_at_least(&self, want_log_index: LogIndex, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_applied.index >= want_log_index,
            &format!("{} .last_applied >= {}", msg.to_string(), want_log_index),
        )
        .await
    }

    /// Wait for `state` to become `want_state` or timeout.
    pub async fn state(&self, want_state: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.state == want_state,
            &format!("{} .state -> {:?}", msg.to_string(), want_state),
        )
        .await
    }

    /// Wait for the voters of the effective membership to become `want_voters`.
    pub async fn voters(&self, want_voters: BTreeSet<NodeId>, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.membership.voting_peers() == want_voters,
            &format!("{} .membership.voters -> {:?}", msg.to_string(), want_voters),
        )
        .await
    }

    /// Wait for `snapshot` to become `want_snapshot` or timeout.
    pub async fn snapshot(&self, want_snapshot: LogId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.snapshot == Some(want_snapshot),
            &format!("{} .snapshot -> {}", msg.to_string(), want_snapshot),
        )
        .await
    }
}
