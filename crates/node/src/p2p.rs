use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use powd_consensus::Hash256;
use tokio::sync::{mpsc, Notify};

use crate::error::NetworkError;
use crate::wire::{Message, VersionInfo};

pub type PeerId = u64;

/// Messages queued per peer before sends start failing.
pub const PEER_QUEUE_LEN: usize = 256;

#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub protocol_version: u32,
    pub user_agent: String,
    pub height: u64,
    pub best_hash: Hash256,
    /// Address the peer accepts connections on, when it announced one.
    pub listen_addr: Option<SocketAddr>,
    pub connected_since: Instant,
    pub last_seen: Instant,
    pub latency: Option<Duration>,
}

struct PeerEntry {
    snapshot: PeerSnapshot,
    sender: mpsc::Sender<Message>,
    disconnect: Arc<Notify>,
    pending_ping: Option<(u64, Instant)>,
}

/// Handed to the connection task when a peer is registered.
pub struct PeerLink {
    pub id: PeerId,
    pub outbound: mpsc::Receiver<Message>,
    pub disconnect: Arc<Notify>,
}

/// The bounded set of live peer connections. Connection tasks own the
/// sockets; this holds their outbound queues and what is known about them.
pub struct PeerSet {
    max_peers: usize,
    next_id: AtomicU64,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
}

impl PeerSet {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers: max_peers.max(1),
            next_id: AtomicU64::new(1),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Admits a connection. Fails when the set is full or the address is
    /// already connected.
    pub fn register(&self, addr: SocketAddr, inbound: bool) -> Result<PeerLink, NetworkError> {
        let mut peers = self.peers.lock();
        if peers.len() >= self.max_peers {
            return Err(NetworkError::PeerLimit);
        }
        if peers.values().any(|entry| entry.snapshot.addr == addr) {
            return Err(NetworkError::Protocol(format!("already connected to {addr}")));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, outbound) = mpsc::channel(PEER_QUEUE_LEN);
        let disconnect = Arc::new(Notify::new());
        let now = Instant::now();
        peers.insert(
            id,
            PeerEntry {
                snapshot: PeerSnapshot {
                    id,
                    addr,
                    inbound,
                    protocol_version: 0,
                    user_agent: String::new(),
                    height: 0,
                    best_hash: [0u8; 32],
                    listen_addr: None,
                    connected_since: now,
                    last_seen: now,
                    latency: None,
                },
                sender,
                disconnect: Arc::clone(&disconnect),
                pending_ping: None,
            },
        );
        Ok(PeerLink {
            id,
            outbound,
            disconnect,
        })
    }

    pub fn set_version(&self, id: PeerId, version: &VersionInfo) {
        if let Some(entry) = self.peers.lock().get_mut(&id) {
            let peer = &mut entry.snapshot;
            peer.protocol_version = version.protocol_version;
            peer.user_agent = version.user_agent.clone();
            peer.height = version.height;
            peer.best_hash = version.best_hash;
            if version.listen_port != 0 {
                peer.listen_addr = Some(SocketAddr::new(peer.addr.ip(), version.listen_port));
            }
        }
    }

    pub fn note_seen(&self, id: PeerId) {
        if let Some(entry) = self.peers.lock().get_mut(&id) {
            entry.snapshot.last_seen = Instant::now();
        }
    }

    /// Records a height the peer claims; heights only move forward unless
    /// the peer reports a different best hash.
    pub fn note_height(&self, id: PeerId, height: u64, best_hash: Hash256) {
        if let Some(entry) = self.peers.lock().get_mut(&id) {
            let peer = &mut entry.snapshot;
            if height >= peer.height || best_hash != peer.best_hash {
                peer.height = height;
                peer.best_hash = best_hash;
            }
        }
    }

    /// Lowers the peer's claimed height to `height` after it failed to
    /// serve blocks above it. Returns whether the claim was taller.
    pub fn clamp_height(&self, id: PeerId, height: u64) -> bool {
        let mut peers = self.peers.lock();
        let Some(entry) = peers.get_mut(&id) else {
            return false;
        };
        if entry.snapshot.height <= height {
            return false;
        }
        entry.snapshot.height = height;
        true
    }

    /// Queues `message` for one peer. Returns false when the peer is gone or
    /// its queue is full.
    pub fn send(&self, id: PeerId, message: Message) -> bool {
        let sender = match self.peers.lock().get(&id) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };
        sender.try_send(message).is_ok()
    }

    /// Queues `message` for every peer except `except`. Returns how many
    /// peers accepted it.
    pub fn broadcast(&self, message: &Message, except: Option<PeerId>) -> usize {
        let senders: Vec<_> = self
            .peers
            .lock()
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .map(|(_, entry)| entry.sender.clone())
            .collect();
        senders
            .into_iter()
            .filter(|sender| sender.try_send(message.clone()).is_ok())
            .count()
    }

    /// Starts a ping round-trip unless one is already outstanding.
    pub fn begin_ping(&self, id: PeerId, nonce: u64) -> bool {
        let mut peers = self.peers.lock();
        let Some(entry) = peers.get_mut(&id) else {
            return false;
        };
        if entry.pending_ping.is_some() {
            return false;
        }
        entry.pending_ping = Some((nonce, Instant::now()));
        true
    }

    /// Matches a pong against the outstanding ping and records latency.
    pub fn complete_ping(&self, id: PeerId, nonce: u64) -> Option<Duration> {
        let mut peers = self.peers.lock();
        let entry = peers.get_mut(&id)?;
        match entry.pending_ping {
            Some((sent_nonce, sent_at)) if sent_nonce == nonce => {
                let latency = sent_at.elapsed();
                entry.pending_ping = None;
                entry.snapshot.latency = Some(latency);
                entry.snapshot.last_seen = Instant::now();
                Some(latency)
            }
            _ => None,
        }
    }

    /// Peers whose outstanding ping is older than `timeout`.
    pub fn expired_pings(&self, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, entry)| {
                entry
                    .pending_ping
                    .map(|(_, sent_at)| sent_at.elapsed() > timeout)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops the peer and tells its connection task to close.
    pub fn remove(&self, id: PeerId) -> Option<PeerSnapshot> {
        let entry = self.peers.lock().remove(&id)?;
        entry.disconnect.notify_one();
        Some(entry.snapshot)
    }

    pub fn get(&self, id: PeerId) -> Option<PeerSnapshot> {
        self.peers.lock().get(&id).map(|entry| entry.snapshot.clone())
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<_> = self
            .peers
            .lock()
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        peers.sort_by_key(|peer| peer.id);
        peers
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.peers.lock().values().any(|entry| {
            entry.snapshot.addr == addr || entry.snapshot.listen_addr == Some(addr)
        })
    }

    /// Peer reporting the greatest height above `local_height`.
    pub fn best_peer(&self, local_height: u64) -> Option<(PeerId, u64)> {
        self.peers
            .lock()
            .values()
            .filter(|entry| entry.snapshot.height > local_height)
            .max_by_key(|entry| (entry.snapshot.height, std::cmp::Reverse(entry.snapshot.id)))
            .map(|entry| (entry.snapshot.id, entry.snapshot.height))
    }

    /// Addresses worth sharing with other peers.
    pub fn shareable_addrs(&self) -> Vec<SocketAddr> {
        self.peers
            .lock()
            .values()
            .filter_map(|entry| {
                if entry.snapshot.inbound {
                    entry.snapshot.listen_addr
                } else {
                    Some(entry.snapshot.addr)
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn set_is_bounded() {
        let peers = PeerSet::new(2);
        let _a = peers.register(addr(1), false).expect("first");
        let _b = peers.register(addr(2), true).expect("second");
        assert!(matches!(
            peers.register(addr(3), false),
            Err(NetworkError::PeerLimit)
        ));
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn duplicate_address_is_refused() {
        let peers = PeerSet::new(4);
        let _a = peers.register(addr(1), false).expect("first");
        assert!(matches!(
            peers.register(addr(1), true),
            Err(NetworkError::Protocol(_))
        ));
    }

    #[test]
    fn broadcast_skips_the_origin() {
        let peers = PeerSet::new(4);
        let mut a = peers.register(addr(1), false).expect("a");
        let mut b = peers.register(addr(2), false).expect("b");
        assert_eq!(peers.broadcast(&Message::GetHeight, Some(a.id)), 1);
        assert!(a.outbound.try_recv().is_err());
        assert_eq!(b.outbound.try_recv().expect("queued"), Message::GetHeight);
    }

    #[test]
    fn ping_round_trip_and_expiry() {
        let peers = PeerSet::new(4);
        let link = peers.register(addr(1), false).expect("a");
        assert!(peers.begin_ping(link.id, 7));
        assert!(!peers.begin_ping(link.id, 8));
        assert!(peers.complete_ping(link.id, 8).is_none());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(peers.expired_pings(Duration::ZERO), vec![link.id]);
        assert!(peers.complete_ping(link.id, 7).is_some());
        assert!(peers.expired_pings(Duration::ZERO).is_empty());
        assert!(peers.get(link.id).and_then(|peer| peer.latency).is_some());
    }

    #[test]
    fn best_peer_only_reports_taller_chains() {
        let peers = PeerSet::new(4);
        let a = peers.register(addr(1), false).expect("a");
        let b = peers.register(addr(2), false).expect("b");
        peers.note_height(a.id, 5, [1; 32]);
        peers.note_height(b.id, 9, [2; 32]);
        assert_eq!(peers.best_peer(3), Some((b.id, 9)));
        assert_eq!(peers.best_peer(9), None);

        assert!(peers.clamp_height(b.id, 3));
        assert!(!peers.clamp_height(b.id, 3));
        assert_eq!(peers.best_peer(3), Some((a.id, 5)));
    }

    #[tokio::test]
    async fn remove_signals_the_connection() {
        let peers = PeerSet::new(4);
        let link = peers.register(addr(1), false).expect("a");
        assert!(peers.remove(link.id).is_some());
        tokio::time::timeout(Duration::from_secs(1), link.disconnect.notified())
            .await
            .expect("notified");
        assert!(!peers.send(link.id, Message::Verack));
    }
}
