//! Node-level error families. Every lower-layer failure lands in exactly one.

use powd_chainstate::{ChainStateError, RuleError};
use powd_storage::StoreError;

use crate::mempool::MempoolError;
use crate::miner::MiningError;
use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Malformed or rule-violating block or transaction. Rejected, not relayed.
    #[error("validation error: {0}")]
    Validation(String),
    /// Proof of work or reward not met.
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("resource error: {0}")]
    Resource(#[from] MiningError),
    /// Fatal for the operation that hit it; block acceptance halts.
    #[error("storage error: {0}")]
    Storage(String),
}

impl NodeError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, NodeError::Validation(_) | NodeError::Consensus(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Storage(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("connection closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("peer limit reached")]
    PeerLimit,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RuleError> for NodeError {
    fn from(err: RuleError) -> Self {
        match err {
            RuleError::Validation(err) => NodeError::Validation(err.to_string()),
            RuleError::Consensus(err) => NodeError::Consensus(err.to_string()),
            RuleError::Store(err) => NodeError::Storage(err.to_string()),
        }
    }
}

impl From<ChainStateError> for NodeError {
    fn from(err: ChainStateError) -> Self {
        match err {
            ChainStateError::InvalidBlock { reason, .. } => NodeError::from(reason),
            ChainStateError::Store(err) => NodeError::Storage(err.to_string()),
            ChainStateError::CorruptIndex(message) => NodeError::Storage(message.to_string()),
            // Bits in peer blocks are checked before use; this only comes
            // from stored headers.
            ChainStateError::Difficulty(err) => NodeError::Storage(err.to_string()),
            other @ (ChainStateError::Duplicate(_)
            | ChainStateError::UnknownParent(_)
            | ChainStateError::NotExtendingTip
            | ChainStateError::InsufficientWork
            | ChainStateError::ForkTooLong
            | ChainStateError::StaleStage) => NodeError::Validation(other.to_string()),
        }
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        NodeError::Storage(err.to_string())
    }
}

impl From<MempoolError> for NodeError {
    fn from(err: MempoolError) -> Self {
        match err {
            MempoolError::Rejected(rule) => NodeError::from(rule),
            other => NodeError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powd_chainstate::{ConsensusError, ValidationError};

    #[test]
    fn lower_errors_map_to_one_family() {
        let err = NodeError::from(RuleError::Validation(ValidationError::NoTransactions));
        assert!(matches!(err, NodeError::Validation(_)));
        assert!(err.is_rejection());

        let err = NodeError::from(ChainStateError::InvalidBlock {
            hash: [0; 32],
            reason: RuleError::Consensus(ConsensusError::RewardMismatch {
                expected: 1,
                found: 2,
            }),
        });
        assert!(matches!(err, NodeError::Consensus(_)));

        let err = NodeError::from(ChainStateError::Store(StoreError::Backend("disk".into())));
        assert!(err.is_fatal());

        let err = NodeError::from(NetworkError::Timeout("ping"));
        assert_eq!(err.to_string(), "network error: ping timed out");
    }
}
