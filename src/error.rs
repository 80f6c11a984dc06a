//! Error types exposed by this crate.

use std::io;

use thiserror::Error;

use crate::LogId;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
///
/// Any of these stops the node: a node which can not make its state durable must not keep
/// granting votes or acknowledging entries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `LogStore` or `StateMachine` layer.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A message which is not a request was handed to `Raft::handle_rpc`.
    #[error("not a request message: {0}")]
    InvalidRpc(String),
    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,
}

/// An error from the durable layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("storage is corrupted: {0}")]
    Corrupted(String),
}

impl StorageError {
    pub fn io(context: impl ToString, source: io::Error) -> Self {
        StorageError::Io {
            context: context.to_string(),
            source,
        }
    }
}

/// Reasons a buffer could not be decoded into a message.
///
/// A decode failure is equivalent to message loss: it never touches node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer is shorter than its header or size prefix")]
    Truncated,
    #[error("an offset points outside of the buffer")]
    InvalidOffset,
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u8),
    #[error("unknown entry payload kind: {0}")]
    UnknownPayloadKind(u8),
}

/// Errors of a single outbound RPC. All of them are transient to the caller: the message is
/// considered dropped.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("rpc to {0} timed out")]
    Timeout(NodeId),
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("frame of {0} bytes exceeds the configured limit")]
    FrameTooLarge(u64),
    #[error("remote error: {0}")]
    Remote(String),
}

/// The request must be sent to the cluster leader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("this node is not the leader, known leader: {leader_id:?}")]
pub struct NotLeaderError {
    pub leader_id: Option<NodeId>,
}

/// An error related to a client write request.
#[derive(Debug, Error)]
pub enum ClientWriteError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error(transparent)]
    ForwardToLeader(#[from] NotLeaderError),
}

/// The set of errors which may take place when requesting to change the cluster membership.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChangeMembershipError {
    #[error("{0}")]
    RaftError(#[from] RaftError),
    #[error(transparent)]
    NotLeader(#[from] NotLeaderError),
    /// The previous membership change has not been committed yet.
    #[error("the membership change at {membership_log_id} is not committed yet")]
    ChangeInProgress { membership_log_id: LogId },
    /// Only one voter may be added or removed per change.
    #[error("a membership change may add or remove at most one voter, got {changes}")]
    TooManyVoterChanges { changes: usize },
    #[error("the new membership has no voters")]
    EmptyVoters,
    #[error("the new membership is the same as the current one")]
    Noop,
}

/// Error variants related to configuration.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A configuration error indicating that the given values for election timeout min & max are invalid: max must be greater than min.
    #[error("given values for election timeout min & max are invalid: max must be greater than min")]
    InvalidElectionTimeoutMinMax,
    /// The heartbeat interval must be smaller than the minimum election timeout.
    #[error("heartbeat interval must be less than election timeout min")]
    HeartbeatNotLessThanElectionTimeout,
    /// The given value for max_payload_entries is too small, must be > 0.
    #[error("the given value for max_payload_entries is too small, must be > 0")]
    MaxPayloadEntriesTooSmall,
}
