//! Transaction types and serialization.

use powd_consensus::constants::MAX_COIN_TAG_LEN;
use powd_consensus::{money_range, Amount, Hash256};

use crate::encoding::{encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const CURRENT_TX_VERSION: u32 = 1;

/// Upper bound on inputs or outputs accepted while decoding one transaction.
pub const MAX_TX_IO: usize = 10_000;

pub const MAX_SIGNATURE_LEN: usize = 80;
pub const MAX_PUBKEY_LEN: usize = 65;

/// Owner commitment: hash160 of the spending public key.
pub type OwnerHash = [u8; 20];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub signature: Vec<u8>,
    pub pubkey: Vec<u8>,
}

impl TxIn {
    pub fn unsigned(prevout: OutPoint) -> Self {
        Self {
            prevout,
            signature: Vec::new(),
            pubkey: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub owner: OwnerHash,
    pub coin: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    /// Coinbase: the block height. Otherwise the first height at which the tx is final.
    pub lock_height: u32,
}

impl Transaction {
    /// Reward transaction for `height`, paying `value` to `owner`.
    pub fn coinbase(height: u32, value: Amount, owner: OwnerHash, coin: &str) -> Self {
        Self {
            version: CURRENT_TX_VERSION,
            inputs: Vec::new(),
            outputs: vec![TxOut {
                value,
                owner,
                coin: coin.to_string(),
            }],
            lock_height: height,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&encode(self))
    }

    pub fn size(&self) -> usize {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        encoder.len()
    }

    /// Sum of output values, `None` on overflow or an out-of-range value.
    pub fn value_out(&self) -> Option<Amount> {
        self.outputs.iter().try_fold(0i64, |acc, out| {
            if !money_range(out.value) {
                return None;
            }
            acc.checked_add(out.value).filter(|sum| money_range(*sum))
        })
    }

    /// Digest committed to by every input signature: the serialization with
    /// signatures and public keys cleared.
    pub fn signing_digest(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.encode_with_unlocking(&mut encoder, false);
        sha256d(&encoder.into_inner())
    }

    fn encode_with_unlocking(&self, encoder: &mut Encoder, include_unlocking: bool) {
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.consensus_encode(encoder);
            if include_unlocking {
                encoder.write_var_bytes(&input.signature);
                encoder.write_var_bytes(&input.pubkey);
            } else {
                encoder.write_varint(0);
                encoder.write_varint(0);
            }
        }
        encoder.write_list(&self.outputs);
        encoder.write_u32_le(self.lock_height);
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.signature);
        encoder.write_var_bytes(&self.pubkey);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let signature_len = decoder.read_count(MAX_SIGNATURE_LEN)?;
        let signature = decoder.read_bytes(signature_len)?;
        let pubkey_len = decoder.read_count(MAX_PUBKEY_LEN)?;
        let pubkey = decoder.read_bytes(pubkey_len)?;
        Ok(Self {
            prevout,
            signature,
            pubkey,
        })
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_bytes(&self.owner);
        encoder.write_var_str(&self.coin);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let owner = decoder.read_fixed::<20>()?;
        let coin_len = decoder.read_count(MAX_COIN_TAG_LEN)?;
        let coin = String::from_utf8(decoder.read_bytes(coin_len)?)
            .map_err(|_| DecodeError::InvalidData("coin tag is not utf8"))?;
        Ok(Self { value, owner, coin })
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.encode_with_unlocking(encoder, true);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let inputs = decoder.read_list(MAX_TX_IO)?;
        let outputs = decoder.read_list(MAX_TX_IO)?;
        let lock_height = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::decode;

    fn spend() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 1),
                signature: vec![1, 2, 3],
                pubkey: vec![2; 33],
            }],
            outputs: vec![TxOut {
                value: 5_000,
                owner: [9u8; 20],
                coin: "POW".to_string(),
            }],
            lock_height: 0,
        }
    }

    #[test]
    fn coinbase_ids_differ_by_height() {
        let a = Transaction::coinbase(1, 50, [1u8; 20], "POW");
        let b = Transaction::coinbase(2, 50, [1u8; 20], "POW");
        assert!(a.is_coinbase());
        assert_ne!(a.txid(), b.txid());
    }

    #[test]
    fn signing_digest_ignores_unlocking_data() {
        let tx = spend();
        let mut stripped = tx.clone();
        stripped.inputs[0].signature.clear();
        stripped.inputs[0].pubkey.clear();
        assert_eq!(tx.signing_digest(), stripped.signing_digest());
        assert_ne!(tx.txid(), stripped.txid());
    }

    #[test]
    fn value_out_rejects_overflow() {
        let mut tx = spend();
        tx.outputs.push(TxOut {
            value: i64::MAX,
            owner: [0u8; 20],
            coin: "POW".to_string(),
        });
        assert_eq!(tx.value_out(), None);
        assert_eq!(spend().value_out(), Some(5_000));
    }

    #[test]
    fn size_matches_encoding() {
        let tx = spend();
        let bytes = encode(&tx);
        assert_eq!(tx.size(), bytes.len());
        assert_eq!(decode::<Transaction>(&bytes).expect("decode"), tx);
    }

    #[test]
    fn oversized_coin_tag_is_rejected() {
        let mut tx = spend();
        tx.outputs[0].coin = "TOOLONGTAG".to_string();
        assert!(decode::<Transaction>(&encode(&tx)).is_err());
    }
}
