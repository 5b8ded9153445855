//! Peer protocol messages, the `{type, data}` envelope and length-prefixed
//! framing.
//!
//! A frame on the wire is a 4-byte big-endian length followed by that many
//! bytes of JSON. The JSON object names the message in `type` and carries the
//! consensus encoding of its body, hex encoded, in `data`.

use std::net::SocketAddr;

use powd_consensus::{hash256_to_hex, Hash256};
use powd_primitives::block::Block;
use powd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use powd_primitives::transaction::Transaction;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;
/// Largest `Blocks` batch a peer may send or request.
pub const MAX_BLOCKS_PER_MESSAGE: usize = 100;
/// Byte budget for one `Blocks` batch before hex and JSON overhead.
pub const MAX_BLOCKS_BYTES: usize = MAX_FRAME_SIZE / 2 - 64 * 1024;
pub const MAX_INV_ITEMS: usize = 50_000;
pub const MAX_PEER_ADDRS: usize = 1_000;
const MAX_USER_AGENT_LEN: usize = 256;
const MAX_ADDR_LEN: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("empty frame")]
    EmptyFrame,
    #[error("envelope is not valid json: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("payload is not valid hex")]
    Hex,
    #[error("bad {tag} body: {source}")]
    Body {
        tag: &'static str,
        source: DecodeError,
    },
    #[error("bad peer address {0:?}")]
    Address(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvKind {
    Transaction,
    Block,
}

impl InvKind {
    fn code(self) -> u8 {
        match self {
            InvKind::Transaction => 1,
            InvKind::Block => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(InvKind::Transaction),
            2 => Ok(InvKind::Block),
            _ => Err(DecodeError::InvalidData("unknown inventory kind")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Encodable for InvItem {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.kind.code());
        encoder.write_hash_le(&self.hash);
    }
}

impl Decodable for InvItem {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            kind: InvKind::from_code(decoder.read_u8()?)?,
            hash: decoder.read_hash_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub protocol_version: u32,
    pub network: String,
    pub user_agent: String,
    pub height: u64,
    pub best_hash: Hash256,
    /// Port the sender accepts connections on; 0 when it does not listen.
    pub listen_port: u16,
    pub nonce: u64,
}

impl Encodable for VersionInfo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.protocol_version);
        encoder.write_var_str(&self.network);
        encoder.write_var_str(&self.user_agent);
        encoder.write_u64_le(self.height);
        encoder.write_hash_le(&self.best_hash);
        encoder.write_u16_le(self.listen_port);
        encoder.write_u64_le(self.nonce);
    }
}

impl Decodable for VersionInfo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let protocol_version = decoder.read_u32_le()?;
        let network = decoder.read_var_str()?;
        let user_agent = decoder.read_var_str()?;
        if user_agent.len() > MAX_USER_AGENT_LEN {
            return Err(DecodeError::InvalidData("user agent too long"));
        }
        Ok(Self {
            protocol_version,
            network,
            user_agent,
            height: decoder.read_u64_le()?,
            best_hash: decoder.read_hash_le()?,
            listen_port: decoder.read_u16_le()?,
            nonce: decoder.read_u64_le()?,
        })
    }
}

/// One protocol message. Decoding matches every tag exhaustively.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Version(VersionInfo),
    Verack,
    Ping(u64),
    Pong(u64),
    GetHeight,
    Height { height: u64, best_hash: Hash256 },
    /// Main-chain blocks from `start`, at most `count` of them.
    GetBlocks { start: u64, count: u32 },
    Blocks(Vec<Block>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    /// A freshly mined or accepted block with the hash its sender computed.
    NewBlock { hash: Hash256, block: Block },
    NewTransaction(Transaction),
    GetPeers,
    Peers(Vec<SocketAddr>),
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetHeight => "get_height",
            Message::Height { .. } => "height",
            Message::GetBlocks { .. } => "get_blocks",
            Message::Blocks(_) => "blocks",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "get_data",
            Message::NotFound(_) => "not_found",
            Message::NewBlock { .. } => "new_block",
            Message::NewTransaction(_) => "new_tx",
            Message::GetPeers => "get_peers",
            Message::Peers(_) => "peers",
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Message::Version(info) => info.consensus_encode(&mut encoder),
            Message::Verack | Message::GetHeight | Message::GetPeers => {}
            Message::Ping(nonce) | Message::Pong(nonce) => encoder.write_u64_le(*nonce),
            Message::Height { height, best_hash } => {
                encoder.write_u64_le(*height);
                encoder.write_hash_le(best_hash);
            }
            Message::GetBlocks { start, count } => {
                encoder.write_u64_le(*start);
                encoder.write_u32_le(*count);
            }
            Message::Blocks(blocks) => encoder.write_list(blocks),
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                encoder.write_list(items)
            }
            Message::NewBlock { hash, block } => {
                encoder.write_hash_le(hash);
                block.consensus_encode(&mut encoder);
            }
            Message::NewTransaction(tx) => tx.consensus_encode(&mut encoder),
            Message::Peers(addrs) => {
                encoder.write_varint(addrs.len() as u64);
                for addr in addrs {
                    encoder.write_var_str(&addr.to_string());
                }
            }
        }
        encoder.into_inner()
    }

    const TAGS: [&'static str; 15] = [
        "version",
        "verack",
        "ping",
        "pong",
        "get_height",
        "height",
        "get_blocks",
        "blocks",
        "inv",
        "get_data",
        "not_found",
        "new_block",
        "new_tx",
        "get_peers",
        "peers",
    ];

    fn decode_body(tag: &str, body: &[u8]) -> Result<Self, WireError> {
        let tag = Message::TAGS
            .iter()
            .copied()
            .find(|known| *known == tag)
            .ok_or_else(|| WireError::UnknownType(tag.to_string()))?;
        let mut decoder = Decoder::new(body);
        let message = Message::decode_tagged(tag, &mut decoder)?;
        decoder
            .finish()
            .map_err(|source| WireError::Body { tag, source })?;
        Ok(message)
    }

    fn decode_tagged(tag: &'static str, decoder: &mut Decoder) -> Result<Self, WireError> {
        let body = |source| WireError::Body { tag, source };
        let message = match tag {
            "version" => Message::Version(VersionInfo::consensus_decode(decoder).map_err(body)?),
            "verack" => Message::Verack,
            "ping" => Message::Ping(decoder.read_u64_le().map_err(body)?),
            "pong" => Message::Pong(decoder.read_u64_le().map_err(body)?),
            "get_height" => Message::GetHeight,
            "height" => Message::Height {
                height: decoder.read_u64_le().map_err(body)?,
                best_hash: decoder.read_hash_le().map_err(body)?,
            },
            "get_blocks" => Message::GetBlocks {
                start: decoder.read_u64_le().map_err(body)?,
                count: decoder.read_u32_le().map_err(body)?,
            },
            "blocks" => Message::Blocks(decoder.read_list(MAX_BLOCKS_PER_MESSAGE).map_err(body)?),
            "inv" => Message::Inv(decoder.read_list(MAX_INV_ITEMS).map_err(body)?),
            "get_data" => Message::GetData(decoder.read_list(MAX_INV_ITEMS).map_err(body)?),
            "not_found" => Message::NotFound(decoder.read_list(MAX_INV_ITEMS).map_err(body)?),
            "new_block" => Message::NewBlock {
                hash: decoder.read_hash_le().map_err(body)?,
                block: Block::consensus_decode(decoder).map_err(body)?,
            },
            "new_tx" => {
                Message::NewTransaction(Transaction::consensus_decode(decoder).map_err(body)?)
            }
            "get_peers" => Message::GetPeers,
            "peers" => Message::Peers(decode_peers(decoder)?),
            other => return Err(WireError::UnknownType(other.to_string())),
        };
        Ok(message)
    }

    /// JSON envelope bytes for this message.
    pub fn to_envelope(&self) -> Vec<u8> {
        let envelope = Envelope {
            kind: self.tag().to_string(),
            data: to_hex(&self.encode_body()),
        };
        serde_json::to_vec(&envelope).unwrap_or_default()
    }

    pub fn from_envelope(bytes: &[u8]) -> Result<Self, WireError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let body = from_hex(&envelope.data).ok_or(WireError::Hex)?;
        Message::decode_body(&envelope.kind, &body)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: String,
}

fn decode_peers(decoder: &mut Decoder) -> Result<Vec<SocketAddr>, WireError> {
    let body = |source| WireError::Body {
        tag: "peers",
        source,
    };
    let count = decoder.read_count(MAX_PEER_ADDRS).map_err(body)?;
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = decoder.read_var_str().map_err(body)?;
        if raw.len() > MAX_ADDR_LEN {
            return Err(WireError::Address(raw));
        }
        match raw.parse() {
            Ok(addr) => addrs.push(addr),
            Err(_) => return Err(WireError::Address(raw)),
        }
    }
    Ok(addrs)
}

/// Writes one frame: 4-byte big-endian length, then `payload`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. A clean end of stream before the length prefix is
/// reported as `Ok(None)`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(WireError::EmptyFrame);
    }
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &message.to_envelope()).await
}

pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, WireError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) => Message::from_envelope(&frame).map(Some),
        None => Ok(None),
    }
}

/// Splits `blocks` into batches that respect both the count and byte caps.
pub fn batch_blocks(blocks: Vec<Block>) -> Vec<Vec<Block>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut bytes = 0usize;
    for block in blocks {
        let size = block.size();
        if !current.is_empty()
            && (current.len() >= MAX_BLOCKS_PER_MESSAGE || bytes + size > MAX_BLOCKS_BYTES)
        {
            batches.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += size;
        current.push(block);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

pub fn from_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }
    input
        .as_bytes()
        .chunks_exact(2)
        .map(|pair| Some((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect()
}

/// Short display form for log lines.
pub fn short_hash(hash: &Hash256) -> String {
    let hex = hash256_to_hex(hash);
    hex[..16.min(hex.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use powd_consensus::params::{consensus_params, Network};
    use powd_chainstate::genesis_block;

    #[tokio::test]
    async fn frame_uses_big_endian_length_prefix() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello").await.expect("write");
        let mut prefix = [0u8; 4];
        server.read_exact(&mut prefix).await.expect("prefix");
        assert_eq!(prefix, [0, 0, 0, 5]);
        let mut body = [0u8; 5];
        server.read_exact(&mut body).await.expect("body");
        assert_eq!(&body, b"hello");
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_reading_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.expect("write");
        let err = read_frame(&mut server).await.expect_err("too large");
        assert!(matches!(err, WireError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn block_message_survives_the_wire() {
        let block = genesis_block(&consensus_params(Network::Regtest));
        let message = Message::NewBlock {
            hash: block.hash(),
            block: block.clone(),
        };
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_message(&mut client, &message).await.expect("write");
        let received = read_message(&mut server).await.expect("read").expect("frame");
        assert_eq!(received, message);
        let Message::NewBlock { hash, block: received } = received else {
            panic!("wrong variant");
        };
        assert_eq!(received.hash(), hash);
    }

    #[test]
    fn envelope_names_type_and_hex_data() {
        let bytes = Message::Height {
            height: 7,
            best_hash: [0xab; 32],
        }
        .to_envelope();
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["type"], "height");
        let data = value["data"].as_str().expect("data");
        assert_eq!(data.len(), (8 + 32) * 2);
        assert!(data.starts_with("0700000000000000"));
    }

    #[test]
    fn inventory_items_dedupe_by_kind_and_hash() {
        let block = InvItem {
            kind: InvKind::Block,
            hash: [4u8; 32],
        };
        let tx = InvItem {
            kind: InvKind::Transaction,
            hash: [4u8; 32],
        };
        let items: std::collections::HashSet<InvItem> = [block, tx, block].into_iter().collect();
        assert_eq!(items.len(), 2);
        assert!(items.contains(&tx));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = Message::from_envelope(br#"{"type":"gossip","data":""}"#).expect_err("unknown");
        assert!(matches!(err, WireError::UnknownType(tag) if tag == "gossip"));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let err =
            Message::from_envelope(br#"{"type":"verack","data":"00"}"#).expect_err("trailing");
        assert!(matches!(err, WireError::Body { tag: "verack", .. }));
    }

    #[test]
    fn bad_hex_is_rejected() {
        let err = Message::from_envelope(br#"{"type":"ping","data":"zz"}"#).expect_err("hex");
        assert!(matches!(err, WireError::Hex));
    }

    #[test]
    fn peers_carry_socket_addresses() {
        let addrs: Vec<SocketAddr> = vec![
            "127.0.0.1:19444".parse().expect("addr"),
            "[::1]:9333".parse().expect("addr"),
        ];
        let message = Message::Peers(addrs.clone());
        let decoded = Message::from_envelope(&message.to_envelope()).expect("decode");
        assert_eq!(decoded, Message::Peers(addrs));
    }

    #[test]
    fn batches_respect_count_cap() {
        let block = genesis_block(&consensus_params(Network::Regtest));
        let batches = batch_blocks(vec![block; 250]);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }
}
