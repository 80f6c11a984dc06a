//! The set of cluster members known to a node.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// A cluster member: where it listens and whether it votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub addr: String,
    /// A non-voter (learner) receives the log but is not counted in any quorum.
    pub voter: bool,
}

/// A membership configuration.
///
/// This is a plain value: a node's effective membership is only ever replaced by appending a
/// configuration-change entry to the log (or by installing a snapshot carrying one).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    members: BTreeMap<NodeId, Member>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_voter(mut self, id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        self.insert(id, addr, true);
        self
    }

    pub fn with_learner(mut self, id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        self.insert(id, addr, false);
        self
    }

    pub fn insert(&mut self, id: impl Into<NodeId>, addr: impl Into<String>, voter: bool) {
        self.members.insert(id.into(), Member {
            addr: addr.into(),
            voter,
        });
    }

    pub fn remove(&mut self, id: &str) -> Option<Member> {
        self.members.remove(id)
    }

    /// Ids of all members which are allowed to vote.
    pub fn voting_peers(&self) -> BTreeSet<NodeId> {
        self.members.iter().filter(|(_, m)| m.voter).map(|(id, _)| id.clone()).collect()
    }

    /// The number of votes that make a strict majority of the voters.
    pub fn quorum_size(&self) -> usize {
        self.members.values().filter(|m| m.voter).count() / 2 + 1
    }

    /// Whether the voters among `granted` form a majority.
    pub fn is_quorum<'a>(&self, granted: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let n = granted.into_iter().filter(|id| self.is_voter(id)).count();
        n >= self.quorum_size()
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.members.get(id).map(|m| m.voter).unwrap_or(false)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn addr(&self, id: &str) -> Option<&str> {
        self.members.get(id).map(|m| m.addr.as_str())
    }

    pub fn members(&self) -> impl Iterator<Item = (&NodeId, &Member)> {
        self.members.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.members.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// The number of nodes which are a voter in exactly one of `self` and `other`.
    pub fn voter_changes(&self, other: &Membership) -> usize {
        self.voting_peers().symmetric_difference(&other.voting_peers()).count()
    }
}
