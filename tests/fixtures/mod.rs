//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use iris_raft::error::NetworkError;
use iris_raft::messages::Envelope;
use iris_raft::messages::Message;
use iris_raft::metrics::Wait;
use iris_raft::state_machine::MemStateMachine;
use iris_raft::storage::MemStore;
use iris_raft::Config;
use iris_raft::LogIndex;
use iris_raft::LogStore;
use iris_raft::Membership;
use iris_raft::NodeId;
use iris_raft::Raft;
use iris_raft::RaftMetrics;
use iris_raft::RaftNetwork;
use iris_raft::State;
use lazy_static::lazy_static;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[allow(unused)]
macro_rules! func_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let n = &name[..name.len() - 3];
        let nn = n.replace("::{{closure}}", "");
        nn
    }};
}

/// Install the global tracing subscriber once, and return a span named after the calling test.
#[allow(unused)]
macro_rules! init_ut {
    () => {{
        let name = func_name!();
        let last = name.split("::").last().unwrap_or("ut").to_string();

        crate::fixtures::init_default_ut_tracing();

        tracing::debug_span!("ut", "{}", last)
    }};
}

pub fn init_default_ut_tracing() {
    static START: Once = Once::new();

    START.call_once(|| {
        let mut g = GLOBAL_UT_LOG_GUARD.as_ref().lock().unwrap();
        *g = Some(init_global_tracing("ut", "_log", "DEBUG"));
    });
}

lazy_static! {
    static ref GLOBAL_UT_LOG_GUARD: Arc<Mutex<Option<WorkerGuard>>> = Arc::new(Mutex::new(None));
}

pub fn init_global_tracing(app_name: &str, dir: &str, level: &str) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::never(dir, app_name);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let sub = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).finish();
    // Several test binaries may share a process in some runners: keep the first subscriber.
    let _ = tracing::subscriber::set_global_default(sub);

    tracing::info!("initialized global tracing: in {}/{} at {}", dir, app_name, level);
    guard
}

/// The default timeout of the wait helpers.
pub fn timeout() -> Option<Duration> {
    Some(Duration::from_millis(3000))
}

pub fn test_config() -> Arc<Config> {
    Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"))
}

/// The address a node is known by to the router.
pub fn addr(id: &str) -> String {
    format!("mem:{}", id)
}

pub fn membership(voters: &[&str], learners: &[&str]) -> Membership {
    let mut m = Membership::new();
    for id in voters {
        m.insert(*id, addr(id), true);
    }
    for id in learners {
        m.insert(*id, addr(id), false);
    }
    m
}

pub fn ids(ids: &[&str]) -> BTreeSet<NodeId> {
    ids.iter().map(|s| s.to_string()).collect()
}

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
#[derive(Clone)]
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: Arc<Mutex<BTreeMap<NodeId, (Raft, MemStateMachine)>>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: Arc<Mutex<HashSet<NodeId>>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Start every member of `bootstrap` with a fresh `MemStore`.
    pub fn new_cluster(&self, bootstrap: &Membership) -> anyhow::Result<()> {
        for id in bootstrap.node_ids() {
            self.new_raft_node(id, bootstrap.clone())?;
        }
        Ok(())
    }

    /// Create and register a new Raft node bearing the given ID.
    pub fn new_raft_node(&self, id: &str, bootstrap: Membership) -> anyhow::Result<()> {
        self.new_raft_node_with_sto(id, bootstrap, MemStore::new())
    }

    #[tracing::instrument(level = "debug", skip(self, bootstrap, sto))]
    pub fn new_raft_node_with_sto<S: LogStore>(&self, id: &str, bootstrap: Membership, sto: S) -> anyhow::Result<()> {
        let sm = MemStateMachine::new();
        let node = Raft::new(id, self.config.clone(), bootstrap, Arc::new(self.clone()), sto, sm.clone())?;
        let mut rt = self.routing_table.lock().unwrap();
        rt.insert(id.to_string(), (node, sm));
        Ok(())
    }

    /// Remove the target node from the routing table & isolation.
    pub fn remove_node(&self, id: &str) -> Option<(Raft, MemStateMachine)> {
        let opt_handles = {
            let mut rt = self.routing_table.lock().unwrap();
            rt.remove(id)
        };

        {
            let mut isolated = self.isolated_nodes.lock().unwrap();
            isolated.remove(id);
        }

        opt_handles
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn isolate_node(&self, id: &str) {
        self.isolated_nodes.lock().unwrap().insert(id.to_string());
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn restore_node(&self, id: &str) {
        self.isolated_nodes.lock().unwrap().remove(id);
    }

    fn is_isolated(&self, id: &str) -> bool {
        self.isolated_nodes.lock().unwrap().contains(id)
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.lock().unwrap();
        rt.values().map(|node| node.0.metrics().borrow().clone()).collect()
    }

    pub fn get_metrics(&self, node_id: &str) -> anyhow::Result<RaftMetrics> {
        let node = self.get_raft_handle(node_id)?;
        let metrics = node.metrics().borrow().clone();
        Ok(metrics)
    }

    pub fn get_raft_handle(&self, node_id: &str) -> anyhow::Result<Raft> {
        let rt = self.routing_table.lock().unwrap();
        let node = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(node.0.clone())
    }

    pub fn get_state_machine(&self, node_id: &str) -> anyhow::Result<MemStateMachine> {
        let rt = self.routing_table.lock().unwrap();
        let node = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(node.1.clone())
    }

    /// The single leader among the nodes that are not isolated, if there is one.
    pub fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.lock().unwrap().clone();
        let leaders = self
            .latest_metrics()
            .into_iter()
            .filter(|m| m.state == State::Leader && !isolated.contains(&m.id))
            .map(|m| m.id)
            .collect::<Vec<_>>();
        match leaders.as_slice() {
            [one] => Some(one.clone()),
            _ => None,
        }
    }

    /// Wait for metrics until it satisfies some condition.
    pub fn wait(&self, node_id: &str, timeout: Option<Duration>) -> anyhow::Result<Wait> {
        let node = self.get_raft_handle(node_id)?;
        Ok(node.wait(timeout))
    }

    /// Wait until every node in `node_ids` reports `want_log` as its last log index and last applied index.
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_log: LogIndex,
        timeout: Option<Duration>,
        msg: &str,
    ) -> anyhow::Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout)?.log(want_log, format!("{} on node {}", msg, id)).await?;
        }
        Ok(())
    }

    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> anyhow::Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout)?.state(want_state, format!("{} on node {}", msg, id)).await?;
        }
        Ok(())
    }

    /// Wait until exactly one of `node_ids` leads and the others follow it, and return the leader.
    pub async fn wait_for_leader(&self, node_ids: &BTreeSet<NodeId>, msg: &str) -> anyhow::Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout().unwrap_or_default();
        loop {
            let metrics = self.latest_metrics();
            let of_interest = metrics.iter().filter(|m| node_ids.contains(&m.id)).collect::<Vec<_>>();
            let leaders = of_interest.iter().filter(|m| m.state == State::Leader).collect::<Vec<_>>();

            if let [leader] = leaders.as_slice() {
                let agreed = of_interest.iter().all(|m| {
                    m.id == leader.id
                        || (m.current_leader.as_ref() == Some(&leader.id) && m.current_term == leader.current_term)
                });
                if agreed {
                    return Ok(leader.id.clone());
                }
            }

            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timeout waiting for a leader among {:?} when {}: {:?}", node_ids, msg, metrics);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Send a client request to the target node, causing test failure on error.
    pub async fn client_request(&self, target: &str, cmd: &str) -> anyhow::Result<iris_raft::LogId> {
        let node = self.get_raft_handle(target)?;
        let log_id = node.client_write(cmd.as_bytes().to_vec()).await?;
        Ok(log_id)
    }

    /// Request `n` writes named `{prefix}-{i}` in sequence.
    pub async fn client_request_many(&self, target: &str, prefix: &str, n: usize) -> anyhow::Result<()> {
        for i in 0..n {
            self.client_request(target, &format!("{}-{}", prefix, i)).await?;
        }
        Ok(())
    }

    /// Assert that every node in `node_ids` applied the same commands.
    pub fn assert_applied_identical(&self, node_ids: &BTreeSet<NodeId>) -> anyhow::Result<()> {
        let mut expected: Option<(NodeId, Vec<Vec<u8>>)> = None;
        for id in node_ids {
            let commands = self.get_state_machine(id)?.commands();
            match &expected {
                None => expected = Some((id.clone(), commands)),
                Some((first, want)) => {
                    assert_eq!(want, &commands, "node {} applied differently than node {}", id, first);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    async fn send(&self, target: &NodeId, addr_: &str, envelope: Envelope) -> Result<Message, NetworkError> {
        assert_eq!(addr(target), addr_, "the address comes from the sender's membership");

        if self.is_isolated(target) || self.is_isolated(&envelope.from) {
            return Err(NetworkError::Unreachable(target.clone()));
        }

        let node = {
            let rt = self.routing_table.lock().unwrap();
            rt.get(target).map(|n| n.0.clone())
        };
        let node = node.ok_or_else(|| NetworkError::Unreachable(target.clone()))?;

        node.handle_rpc(envelope).await.map_err(|e| NetworkError::Remote(e.to_string()))
    }
}
