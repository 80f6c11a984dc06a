use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::LogIndex;
use crate::Term;

/// The identity of a raft log.
/// A term and an index identifies an log globally.
///
/// Ordering is lexicographic, term first, which is exactly the "at least as up-to-date" comparison
/// used when granting votes.
#[derive(Debug, Default, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId {
    pub term: Term,
    pub index: LogIndex,
}

impl LogId {
    pub fn new(term: Term, index: LogIndex) -> Self {
        LogId { term, index }
    }
}

impl From<(Term, LogIndex)> for LogId {
    fn from(v: (Term, LogIndex)) -> Self {
        LogId { term: v.0, index: v.1 }
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}
