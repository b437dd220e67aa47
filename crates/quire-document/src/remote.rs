//! Remote store boundary.
//!
//! The sync engine only ever pushes versioned operation batches. Transport,
//! persistence, and fan-out to other clients live behind [`RemoteStore`].

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use quire_types::{ClientId, Operation};
use tracing::debug;

use crate::error::TransportError;

/// Where flushed operations go.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Push a batch in order. On error nothing in the batch counts as delivered.
    async fn push_ops(&self, doc_id: &str, ops: &[Operation]) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    log: Vec<(String, Operation)>,
    seen: HashSet<(ClientId, u64)>,
    fail_next: usize,
    reject_next: usize,
    offline: bool,
    pushes: usize,
}

/// In-process remote store.
///
/// Keeps every accepted op, drops re-sent `(client, version)` pairs, and can
/// be told to fail.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` pushes.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Refuse the next `n` pushes as a store that is reachable but says no.
    pub fn reject_next(&self, n: usize) {
        self.state.lock().reject_next = n;
    }

    /// Fail every push until set back.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Accepted ops for `doc_id`, in arrival order.
    pub fn ops(&self, doc_id: &str) -> Vec<Operation> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(d, _)| d == doc_id)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Number of push attempts, failed ones included.
    pub fn push_count(&self) -> usize {
        self.state.lock().pushes
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn push_ops(&self, doc_id: &str, ops: &[Operation]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.pushes += 1;
        if state.offline {
            return Err(TransportError::Unavailable("memory remote is offline".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Unavailable("injected failure".into()));
        }
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(TransportError::Rejected(format!("{} ops for {} refused", ops.len(), doc_id)));
        }
        for op in ops {
            if !state.seen.insert((op.client, op.version)) {
                debug!("memory remote: dropping duplicate v{} from {}", op.version, op.client);
                continue;
            }
            state.log.push((doc_id.to_string(), op.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_types::OpPayload;

    fn op(version: u64) -> Operation {
        Operation::new(version, ClientId(1), OpPayload::Remove { block_id: "x".into() })
    }

    #[tokio::test]
    async fn test_records_and_dedups() {
        let remote = MemoryRemote::new();
        remote.push_ops("doc", &[op(1), op(2)]).await.unwrap();
        remote.push_ops("doc", &[op(2), op(3)]).await.unwrap();
        let versions: Vec<u64> = remote.ops("doc").iter().map(|o| o.version).collect();
        assert_eq!(versions, [1, 2, 3]);
        assert!(remote.ops("other").is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let remote = MemoryRemote::new();
        remote.fail_next(1);
        assert!(remote.push_ops("doc", &[op(1)]).await.is_err());
        assert!(remote.push_ops("doc", &[op(1)]).await.is_ok());

        remote.set_offline(true);
        assert!(matches!(
            remote.push_ops("doc", &[op(2)]).await,
            Err(TransportError::Unavailable(_))
        ));
        assert_eq!(remote.push_count(), 3);
        assert_eq!(remote.ops("doc").len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_not_recorded() {
        let remote = MemoryRemote::new();
        remote.reject_next(1);
        let err = remote.push_ops("doc", &[op(1), op(2)]).await.unwrap_err();
        assert_eq!(err, TransportError::Rejected("2 ops for doc refused".into()));
        assert!(remote.ops("doc").is_empty());

        remote.push_ops("doc", &[op(1), op(2)]).await.unwrap();
        assert_eq!(remote.ops("doc").len(), 2);
    }
}
