//! Consensus parameter definitions.

use crate::constants::{
    COINBASE_MATURITY, MAX_BLOCK_SIZE, MAX_FORK_LENGTH, MAX_FUTURE_SKEW_SECS, MAX_TX_PER_BLOCK,
    MAX_TX_SIZE, PROTOCOL_VERSION,
};
use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "testnet" | "test" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    /// Easiest allowed target (lowest difficulty).
    pub pow_limit: Hash256,
    /// Hardest allowed target (highest difficulty).
    pub pow_floor: Hash256,
    pub target_spacing_secs: i64,
    /// Blocks between retargets.
    pub difficulty_adjustment_interval: u32,
    /// Number of inter-block intervals kept in the retarget ring.
    pub difficulty_window: usize,
    pub initial_reward: Amount,
    pub reward_halving_interval: u32,
    pub fee_per_byte: Amount,
    pub max_future_skew_secs: i64,
    pub max_fork_length: u32,
    pub max_block_size: u32,
    pub max_tx_per_block: u32,
    pub max_tx_size: u32,
    pub coinbase_maturity: u32,
}

impl ConsensusParams {
    /// Expected duration of one full retarget window, in seconds.
    pub fn expected_window_timespan(&self) -> i64 {
        self.target_spacing_secs * self.difficulty_window as i64
    }

    pub fn is_retarget_height(&self, height: u64) -> bool {
        height > 0 && height % u64::from(self.difficulty_adjustment_interval.max(1)) == 0
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub protocol_version: u32,
    pub default_port: u16,
    pub bootstrap_peers: &'static [&'static str],
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    let (default_port, bootstrap_peers): (u16, &'static [&'static str]) = match network {
        Network::Mainnet => (9333, &[]),
        Network::Testnet => (19333, &[]),
        Network::Regtest => (19444, &[]),
    };
    ChainParams {
        network,
        consensus: consensus_params(network),
        protocol_version: PROTOCOL_VERSION,
        default_port,
        bootstrap_peers,
    }
}

const POW_FLOOR_HEX: &str = "0000000000000000000000000000000000000000000000000000ffffffffffff";

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        genesis_time: 1_767_225_600,
        genesis_bits: 0x1e0f_ffff,
        pow_limit: const_hash("00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_floor: const_hash(POW_FLOOR_HEX),
        target_spacing_secs: 60,
        difficulty_adjustment_interval: 144,
        difficulty_window: 144,
        initial_reward: 50 * COIN,
        reward_halving_interval: 210_000,
        fee_per_byte: 1,
        max_future_skew_secs: MAX_FUTURE_SKEW_SECS,
        max_fork_length: MAX_FORK_LENGTH,
        max_block_size: MAX_BLOCK_SIZE,
        max_tx_per_block: MAX_TX_PER_BLOCK,
        max_tx_size: MAX_TX_SIZE,
        coinbase_maturity: COINBASE_MATURITY,
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        genesis_time: 1_767_225_600,
        genesis_bits: 0x1f0f_ffff,
        pow_limit: const_hash("000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_floor: const_hash(POW_FLOOR_HEX),
        target_spacing_secs: 60,
        difficulty_adjustment_interval: 72,
        difficulty_window: 72,
        initial_reward: 50 * COIN,
        reward_halving_interval: 210_000,
        fee_per_byte: 1,
        max_future_skew_secs: MAX_FUTURE_SKEW_SECS,
        max_fork_length: MAX_FORK_LENGTH,
        max_block_size: MAX_BLOCK_SIZE,
        max_tx_per_block: MAX_TX_PER_BLOCK,
        max_tx_size: MAX_TX_SIZE,
        coinbase_maturity: COINBASE_MATURITY,
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        genesis_time: 1_767_225_600,
        genesis_bits: 0x207f_ffff,
        pow_limit: const_hash("7fffff0000000000000000000000000000000000000000000000000000000000"),
        pow_floor: const_hash(POW_FLOOR_HEX),
        target_spacing_secs: 10,
        difficulty_adjustment_interval: 10,
        difficulty_window: 10,
        initial_reward: 50 * COIN,
        reward_halving_interval: 150,
        fee_per_byte: 1,
        max_future_skew_secs: MAX_FUTURE_SKEW_SECS,
        max_fork_length: MAX_FORK_LENGTH,
        max_block_size: MAX_BLOCK_SIZE,
        max_tx_per_block: MAX_TX_PER_BLOCK,
        max_tx_size: MAX_TX_SIZE,
        coinbase_maturity: 10,
    }
}

// Parameter tables are literals; a malformed one is a programming error.
fn const_hash(hex: &str) -> Hash256 {
    match hash256_from_hex(hex) {
        Ok(hash) => hash,
        Err(err) => panic!("invalid built-in hash literal {hex}: {err}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 1..=64 digits"),
            HexError::InvalidHex => write!(f, "hash hex contains a non-hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses display-order (big-endian) hex into internal byte order.
/// Short input is left-padded with zeros.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let trimmed = input.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut digits = [b'0'; 64];
    digits[64 - hex.len()..].copy_from_slice(hex.as_bytes());

    let mut bytes = [0u8; 32];
    for (i, pair) in digits.chunks_exact(2).enumerate() {
        let high = hex_value(pair[0]).ok_or(HexError::InvalidHex)?;
        let low = hex_value(pair[1]).ok_or(HexError::InvalidHex)?;
        bytes[31 - i] = (high << 4) | low;
    }
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_uses_display_order() {
        let hash = hash256_from_hex("0x01").expect("hex");
        assert_eq!(hash[0], 0x01);
        assert!(hash[1..].iter().all(|byte| *byte == 0));
        assert_eq!(
            hash256_to_hex(&hash),
            "0000000000000000000000000000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn hex_rejects_garbage() {
        assert_eq!(hash256_from_hex(""), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex("zz"), Err(HexError::InvalidHex));
        let too_long = "0".repeat(65);
        assert_eq!(hash256_from_hex(&too_long), Err(HexError::InvalidLength));
    }

    #[test]
    fn regtest_limit_is_easiest_target() {
        let params = consensus_params(Network::Regtest);
        assert_eq!(params.pow_limit[31], 0x7f);
        assert_eq!(params.pow_limit[30], 0xff);
        assert_eq!(params.pow_limit[29], 0xff);
        assert!(params.pow_limit[..29].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn retarget_heights() {
        let params = consensus_params(Network::Regtest);
        assert!(!params.is_retarget_height(0));
        assert!(!params.is_retarget_height(9));
        assert!(params.is_retarget_height(10));
        assert!(params.is_retarget_height(20));
    }
}
