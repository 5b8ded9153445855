//! Chain state, UTXO set, block validation and fork resolution.

pub mod blocks;
pub mod chain;
pub mod index;
pub mod state;
pub mod undo;
pub mod utxo;
pub mod validation;

pub use chain::{
    select_best_chain, Candidate, ChainSelector, ForkBuffer, ForkDecision, ForkWalk, SyncState,
};
pub use index::ChainTip;
pub use state::{genesis_block, Arrival, ChainState, ChainStateError, ConnectedBlock, StagedUpdate};
pub use utxo::{UtxoEntry, UtxoView};
pub use validation::{
    validate_block, validate_transaction, BlockContext, ConsensusError, RuleError,
    ValidationError,
};
