//! The Raft network interface.

mod tcp;

use async_trait::async_trait;

pub use self::tcp::serve;
pub use self::tcp::TcpNetwork;
use crate::error::NetworkError;
use crate::messages::Envelope;
use crate::messages::Message;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// One call delivers one request and returns the response. A call may fail or hang; the caller
/// bounds it with `Config::rpc_timeout` and treats every failure as a lost message, to be retried
/// by the protocol itself. A request may be delivered more than once.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send a request to `target`, listening at `addr` according to the sender's membership.
    async fn send(&self, target: &NodeId, addr: &str, envelope: Envelope) -> Result<Message, NetworkError>;
}
