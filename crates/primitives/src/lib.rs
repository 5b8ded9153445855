//! Core block/transaction types, consensus serialization, and signing.

pub mod block;
pub mod crypto;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader, HEADER_SIZE};
pub use crypto::{sign_inputs, CryptoError, EcdsaVerifier, KeySigner, Signer, Verifier};
pub use encoding::{decode, encode, DecodeError};
pub use hash::{hash160, sha256, sha256d};
pub use merkle::merkle_root;
pub use outpoint::OutPoint;
pub use transaction::{OwnerHash, Transaction, TxIn, TxOut};
