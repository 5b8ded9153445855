use powd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use powd_primitives::outpoint::OutPoint;

use crate::utxo::UtxoEntry;

const BLOCK_UNDO_VERSION: u8 = 1;

/// Upper bound on spent entries accepted while decoding one undo record.
const MAX_UNDO_ENTRIES: usize = 1_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

/// Outputs a connected block consumed, in spend order, so the block can be
/// disconnected exactly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub spent: Vec<SpentOutput>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.spent.len() as u64);
        for spent in &self.spent {
            spent.outpoint.consensus_encode(&mut encoder);
            encoder.write_var_bytes(&spent.entry.encode());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let count = decoder.read_count(MAX_UNDO_ENTRIES)?;
        let mut spent = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let entry = UtxoEntry::decode(&decoder.read_var_bytes()?)
                .map_err(|_| DecodeError::InvalidData("invalid utxo entry in undo"))?;
            spent.push(SpentOutput { outpoint, entry });
        }
        decoder.finish()?;
        Ok(Self { spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_roundtrip_preserves_order() {
        let undo = BlockUndo {
            spent: (0..3u8)
                .map(|i| SpentOutput {
                    outpoint: OutPoint::new([i; 32], u32::from(i)),
                    entry: UtxoEntry {
                        value: i64::from(i) * 100,
                        owner: [i; 20],
                        coin: "POW".to_string(),
                        height: u32::from(i),
                        is_coinbase: i == 0,
                    },
                })
                .collect(),
        };
        assert_eq!(BlockUndo::decode(&undo.encode()).expect("decode"), undo);
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert!(BlockUndo::decode(&[9, 0]).is_err());
    }
}
