//! Public Raft interface.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::core::RaftMsg;
use crate::core::RaftRespRx;
use crate::engine::Engine;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::Membership;
use crate::messages::Envelope;
use crate::messages::Message;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::state_machine::StateMachine;
use crate::storage::LogStore;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

struct RaftInner {
    id: NodeId,
    tx_api: mpsc::UnboundedSender<(RaftMsg, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The Raft API.
///
/// This is the interface to a running Raft node: `new` spawns the node's task, the methods talk
/// to it.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, the node has stopped, possibly
/// because its storage failed. Call `shutdown` to await the task and collect its error.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<RaftInner>,
}

impl Raft {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster. It must
    /// be stable across restarts of the node.
    ///
    /// ### `bootstrap`
    /// The membership of a pristine cluster. A membership found in the log or in a snapshot
    /// overrides it.
    ///
    /// ### `network`
    /// Used to send requests to other members; see [`RaftNetwork`].
    ///
    /// ### `store`, `state_machine`
    /// The durable state of the node and the consumer of committed commands. The state machine
    /// is restored from the latest snapshot in `store` before the task starts.
    #[tracing::instrument(level="debug", skip(config, bootstrap, network, store, state_machine), fields(cluster=%config.cluster_name))]
    pub fn new<N, S, M>(
        id: impl Into<NodeId> + std::fmt::Debug,
        config: Arc<Config>,
        bootstrap: Membership,
        network: Arc<N>,
        store: S,
        state_machine: M,
    ) -> RaftResult<Self>
    where
        N: RaftNetwork,
        S: LogStore,
        M: StateMachine,
    {
        Self::with_rng(id, config, bootstrap, network, store, state_machine, StdRng::from_os_rng())
    }

    /// Same as `new` with an explicit random source for election timeouts.
    pub fn with_rng<N, S, M>(
        id: impl Into<NodeId>,
        config: Arc<Config>,
        bootstrap: Membership,
        network: Arc<N>,
        store: S,
        state_machine: M,
        rng: StdRng,
    ) -> RaftResult<Self>
    where
        N: RaftNetwork,
        S: LogStore,
        M: StateMachine,
    {
        let id = id.into();
        let engine = Engine::new(id.clone(), config.clone(), bootstrap, store, state_machine, rng)?;

        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(engine.metrics());
        let (tx_shutdown, rx_shutdown) = oneshot::channel();

        let raft_handle = RaftCore::spawn(engine, config, network, rx_api, tx_metrics, rx_shutdown);

        let inner = RaftInner {
            id,
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Submit a request received from a peer, and get the response to send back.
    ///
    /// `envelope` must carry a request: a VoteRequest, an AppendEntriesRequest or an
    /// InstallSnapshotRequest.
    #[tracing::instrument(level = "debug", skip(self, envelope), fields(rpc=%envelope.message.summary()))]
    pub async fn handle_rpc(&self, envelope: Envelope) -> Result<Message, RaftError> {
        if !envelope.message.is_request() {
            return Err(RaftError::InvalidRpc(envelope.message.kind_name().to_string()));
        }

        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Rpc { envelope, tx }, rx).await
    }

    /// Append a command to the replicated log.
    ///
    /// Only the leader accepts writes; any other node returns `ClientWriteError::ForwardToLeader`
    /// with the leader it knows of.
    ///
    /// The returned `LogId` is where the command was durably appended on the leader. It is not
    /// committed yet: wait with `wait().applied_at_least(log_id.index)` and check the term of
    /// what got applied there. A leader change may replace an uncommitted entry.
    #[tracing::instrument(level = "debug", skip(self, command), fields(len = command.len()))]
    pub async fn client_write(&self, command: Vec<u8>) -> Result<LogId, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ClientWrite { command, tx }, rx).await
    }

    /// Propose a new cluster membership.
    ///
    /// At most one voter may be added or removed at a time, and a change is only accepted after
    /// the previous one committed. Learners can be added and removed freely. The new membership
    /// is in effect as soon as its entry is appended.
    #[tracing::instrument(level = "debug", skip(self, membership), fields(voters=?membership.voting_peers()))]
    pub async fn change_membership(&self, membership: Membership) -> Result<LogId, ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ChangeMembership { membership, tx }, rx).await
    }

    /// Invoke RaftCore by sending a RaftMsg and blocks waiting for response.
    async fn call_core<T, E>(&self, mes: RaftMsg, rx: RaftRespRx<T, E>) -> Result<T, E>
    where E: From<RaftError> {
        let span = tracing::debug_span!("CH_call_core");

        let sum = mes.summary();

        let send_res = self.inner.tx_api.send((mes, span));
        if let Err(send_err) = send_res {
            tracing::error!(%send_err, mes=%sum, "error send tx to RaftCore");
            return Err(RaftError::ShuttingDown.into());
        }

        match rx.await {
            Ok(res) => res,
            Err(e) => {
                tracing::error!(%e, mes=%sum, "error recv rx from RaftCore");
                Err(RaftError::ShuttingDown.into())
            }
        }
    }

    /// The leader as currently known by this node.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader.clone()
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use iris_raft::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log-3").await?;
    ///
    /// // wait for raft node's current leader to become "2":
    /// r.wait(None).current_leader("2", "leader").await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(None).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node, and return the error it stopped on, if any.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            handle.await??;
        }
        Ok(())
    }
}
