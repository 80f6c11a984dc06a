//! Raft consensus core for Iris cluster members.
//!
//! A node is an [`Engine`] (the synchronous protocol logic) driven by a single tokio task which
//! owns its [`LogStore`], its [`StateMachine`] and its timers. Applications talk to that task via
//! the cloneable [`Raft`] handle; peers talk to it through a [`RaftNetwork`] which carries
//! [`codec`]-encoded messages.

pub mod codec;
pub mod config;
mod core;
pub mod engine;
pub mod error;
pub mod membership;
pub mod messages;
pub mod metrics;
pub mod network;
pub mod raft;
mod raft_types;
pub mod state_machine;
pub mod storage;

pub use async_trait;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::engine::Engine;
pub use crate::engine::State;
pub use crate::error::ChangeMembershipError;
pub use crate::error::ClientWriteError;
pub use crate::error::ConfigError;
pub use crate::error::DecodeError;
pub use crate::error::NetworkError;
pub use crate::error::NotLeaderError;
pub use crate::error::RaftError;
pub use crate::error::StorageError;
pub use crate::membership::Membership;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::raft_types::LogId;
pub use crate::state_machine::StateMachine;
pub use crate::storage::LogStore;

/// A Raft node's ID.
pub type NodeId = String;

/// An election epoch.
pub type Term = u64;

/// A 1-based position in the replicated log. Index 0 denotes "before the first entry".
pub type LogIndex = u64;

/// A trait for producing a short, single line description of a message, for logging.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
