use std::sync::Arc;

use clap::Parser;
use iris_raft::error::StorageError;
use iris_raft::network::serve;
use iris_raft::network::TcpNetwork;
use iris_raft::storage::FileStore;
use iris_raft::Config;
use iris_raft::LogId;
use iris_raft::Membership;
use iris_raft::Raft;
use iris_raft::SnapshotPolicy;
use iris_raft::StateMachine;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Run one member of an Iris raft cluster", long_about = None)]
pub struct Opt {
    /// ID of this node.
    #[clap(long, env = "IRIS_ID")]
    pub id: String,

    /// Address to accept raft connections on.
    #[clap(long, env = "IRIS_LISTEN")]
    pub listen: String,

    /// A voter of the initial cluster, as `id=addr`. Repeat for every voter, this node included.
    #[clap(long = "member", value_parser = parse_member)]
    pub members: Vec<(String, String)>,

    /// A learner of the initial cluster, as `id=addr`.
    #[clap(long = "learner", value_parser = parse_member)]
    pub learners: Vec<(String, String)>,

    /// Directory of the durable log, hard state and snapshot.
    #[clap(long, env = "IRIS_DATA_DIR")]
    pub data_dir: String,

    #[clap(long, default_value = "iris")]
    pub cluster_name: String,

    #[clap(long, default_value_t = 150)]
    pub election_timeout_min: u64,

    #[clap(long, default_value_t = 300)]
    pub election_timeout_max: u64,

    #[clap(long, default_value_t = 50)]
    pub heartbeat_interval: u64,

    #[clap(long, default_value_t = 100)]
    pub rpc_timeout: u64,

    /// Take a snapshot every this many applied entries.
    #[clap(long, default_value_t = 5000)]
    pub snapshot_logs: u64,
}

fn parse_member(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((id, addr)) if !id.is_empty() && !addr.is_empty() => Ok((id.to_string(), addr.to_string())),
        _ => Err(format!("expect id=addr, got {:?}", s)),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EchoData {
    last_applied: LogId,
    applied: u64,
}

/// Prints every committed command.
#[derive(Debug, Default)]
struct Echo {
    data: EchoData,
}

impl StateMachine for Echo {
    fn apply(&mut self, log_id: LogId, command: &[u8]) {
        self.data.last_applied = log_id;
        self.data.applied += 1;
        println!("{} {}", log_id, String::from_utf8_lossy(command));
    }

    fn snapshot(&mut self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(&self.data).map_err(|e| StorageError::Corrupted(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.data = serde_json::from_slice(data).map_err(|e| StorageError::Corrupted(e.to_string()))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();

    let config = Config::build(opt.cluster_name.clone())
        .election_timeout_min(opt.election_timeout_min)
        .election_timeout_max(opt.election_timeout_max)
        .heartbeat_interval(opt.heartbeat_interval)
        .rpc_timeout(opt.rpc_timeout)
        .snapshot_policy(SnapshotPolicy::LogsSinceLast(opt.snapshot_logs))
        .validate()?;
    let config = Arc::new(config);

    let mut bootstrap = Membership::new();
    for (id, addr) in &opt.members {
        bootstrap.insert(id.as_str(), addr.as_str(), true);
    }
    for (id, addr) in &opt.learners {
        bootstrap.insert(id.as_str(), addr.as_str(), false);
    }

    let store = FileStore::open(&opt.data_dir)?;
    let network = Arc::new(TcpNetwork::new(config.max_frame_size));
    let raft = Raft::new(opt.id.clone(), config.clone(), bootstrap, network, store, Echo::default())?;

    let listener = TcpListener::bind(&opt.listen).await?;
    tracing::info!(id = %opt.id, listen = %opt.listen, "accepting raft connections");
    let server = tokio::spawn(serve(listener, raft.clone(), config.max_frame_size));

    // Every line on stdin is a command.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        match raft.client_write(line.into_bytes()).await {
            Ok(log_id) => tracing::info!(%log_id, "appended"),
            Err(err) => tracing::warn!(error = %err, "write rejected"),
        }
    }

    server.abort();
    raft.shutdown().await?;
    Ok(())
}
