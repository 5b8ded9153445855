//! Signer/Verifier collaborators over secp256k1 ECDSA.

use std::sync::OnceLock;

use powd_consensus::Hash256;
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};

use crate::hash::hash160;
use crate::transaction::{OwnerHash, Transaction};

static SECP256K1: OnceLock<Secp256k1<All>> = OnceLock::new();

fn secp() -> &'static Secp256k1<All> {
    SECP256K1.get_or_init(Secp256k1::new)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    InvalidSecretKey,
    InputOutOfRange(usize),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidSecretKey => write!(f, "invalid secret key"),
            CryptoError::InputOutOfRange(index) => write!(f, "input {index} out of range"),
        }
    }
}

impl std::error::Error for CryptoError {}

pub trait Signer: Send + Sync {
    fn public_key(&self) -> Vec<u8>;
    fn sign(&self, digest: &Hash256) -> Vec<u8>;

    fn owner(&self) -> OwnerHash {
        hash160(&self.public_key())
    }
}

pub trait Verifier: Send + Sync {
    fn verify(&self, digest: &Hash256, signature: &[u8], pubkey: &[u8]) -> bool;
}

pub struct KeySigner {
    secret: SecretKey,
    public: PublicKey,
}

impl KeySigner {
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = PublicKey::from_secret_key(secp(), &secret);
        Ok(Self { secret, public })
    }
}

impl Signer for KeySigner {
    fn public_key(&self) -> Vec<u8> {
        self.public.serialize().to_vec()
    }

    fn sign(&self, digest: &Hash256) -> Vec<u8> {
        let msg = Message::from_digest(*digest);
        secp().sign_ecdsa(&msg, &self.secret).serialize_der().to_vec()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EcdsaVerifier;

impl Verifier for EcdsaVerifier {
    fn verify(&self, digest: &Hash256, signature: &[u8], pubkey: &[u8]) -> bool {
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let Ok(mut sig) = Signature::from_der(signature) else {
            return false;
        };
        sig.normalize_s();
        let msg = Message::from_digest(*digest);
        secp().verify_ecdsa(&msg, &sig, &pubkey).is_ok()
    }
}

/// Fills the unlocking data of every input in `indices` with `signer`'s key.
pub fn sign_inputs(
    tx: &mut Transaction,
    indices: &[usize],
    signer: &dyn Signer,
) -> Result<(), CryptoError> {
    let digest = tx.signing_digest();
    let signature = signer.sign(&digest);
    let pubkey = signer.public_key();
    for &index in indices {
        let input = tx
            .inputs
            .get_mut(index)
            .ok_or(CryptoError::InputOutOfRange(index))?;
        input.signature = signature.clone();
        input.pubkey = pubkey.clone();
    }
    Ok(())
}
