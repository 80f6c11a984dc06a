//! The application side of the log: where committed commands go.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde::Deserialize;
use serde::Serialize;

use crate::error::StorageError;
use crate::LogId;

/// The consumer of committed commands.
///
/// `apply` is called exactly once per committed normal entry, in log order. Membership entries
/// are consumed by Raft itself and never reach the state machine.
///
/// A state machine is volatile: on restart it is rebuilt by `restore`-ing the latest snapshot and
/// re-applying the committed log after it.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, log_id: LogId, command: &[u8]);

    /// Serialize the current state, covering everything applied so far.
    fn snapshot(&mut self) -> Result<Vec<u8>, StorageError>;

    /// Replace the current state with one produced by `snapshot`.
    fn restore(&mut self, data: &[u8]) -> Result<(), StorageError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemStateMachineData {
    pub last_applied: LogId,
    /// Every applied command, in order.
    pub commands: Vec<Vec<u8>>,
}

/// A state machine that records what it is given.
///
/// Clones share the same data, so a test can keep a handle while Raft owns another.
#[derive(Debug, Default, Clone)]
pub struct MemStateMachine {
    inner: Arc<Mutex<MemStateMachineData>>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemStateMachineData> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn last_applied(&self) -> LogId {
        self.lock().last_applied
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.lock().commands.clone()
    }

    pub fn data(&self) -> MemStateMachineData {
        self.lock().clone()
    }
}

impl StateMachine for MemStateMachine {
    fn apply(&mut self, log_id: LogId, command: &[u8]) {
        let mut d = self.lock();
        d.last_applied = log_id;
        d.commands.push(command.to_vec());
    }

    fn snapshot(&mut self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(&*self.lock()).map_err(|e| StorageError::Corrupted(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let restored: MemStateMachineData =
            serde_json::from_slice(data).map_err(|e| StorageError::Corrupted(format!("snapshot data: {}", e)))?;
        *self.lock() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_mem_state_machine_snapshot_restore() -> anyhow::Result<()> {
        let mut sm = MemStateMachine::new();
        sm.apply(LogId::new(1, 1), b"a");
        sm.apply(LogId::new(1, 3), b"b");
        let snap = sm.snapshot()?;

        let mut restored = MemStateMachine::new();
        restored.apply(LogId::new(9, 9), b"junk");
        restored.restore(&snap)?;

        assert_eq!(sm.data(), restored.data());
        assert_eq!(LogId::new(1, 3), restored.last_applied());
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec()], restored.commands());

        assert!(restored.restore(b"garbage").is_err());
        Ok(())
    }
}
