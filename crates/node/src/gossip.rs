//! Peer gossip: listener and dialer, the version handshake, one reader and
//! one writer task per connection, relay of accepted blocks and
//! transactions, height sync, liveness pings and partition tracking.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use powd_consensus::constants::{MIN_PEER_PROTO_VERSION, PROTOCOL_VERSION, SYNC_BATCH_SIZE};
use powd_consensus::{Hash256, Network};
use powd_primitives::block::Block;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{NetTimings, NodeConfig};
use crate::error::{NetworkError, NodeError};
use crate::node::{BlockOutcome, BlockSource, Node, NodeEvent};
use crate::p2p::{PeerId, PeerSnapshot};
use crate::peer_book::{Offense, PeerBook};
use crate::wire::{
    batch_blocks, read_message, short_hash, write_message, InvItem, InvKind, Message,
    VersionInfo, WireError, MAX_BLOCKS_PER_MESSAGE, MAX_INV_ITEMS, MAX_PEER_ADDRS,
};

const USER_AGENT: &str = concat!("/powd:", env!("CARGO_PKG_VERSION"), "/");

pub struct Gossip {
    node: Arc<Node>,
    book: PeerBook,
    network: Network,
    timings: NetTimings,
    bootstrap: Vec<String>,
    local_nonce: u64,
    listen_port: AtomicU16,
    /// Addresses we reached at least once and keep probing.
    watched: Mutex<HashSet<SocketAddr>>,
    /// Blocks asked for by hash; their replies are not live announcements.
    requested: Mutex<HashSet<Hash256>>,
    sync_inflight: Mutex<Option<(PeerId, Instant)>>,
    shutdown: watch::Receiver<bool>,
}

impl Gossip {
    pub fn new(node: Arc<Node>, config: &NodeConfig, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            node,
            book: PeerBook::new(),
            network: config.network,
            timings: config.net.clone(),
            bootstrap: config.bootstrap.clone(),
            local_nonce: rand::random(),
            listen_port: AtomicU16::new(0),
            watched: Mutex::new(HashSet::new()),
            requested: Mutex::new(HashSet::new()),
            sync_inflight: Mutex::new(None),
            shutdown,
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn book(&self) -> &PeerBook {
        &self.book
    }

    pub async fn bind(&self, addr: SocketAddr) -> Result<TcpListener, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.listen_port.store(local.port(), Ordering::Relaxed);
        log_info!("P2P listening on {local}");
        Ok(listener)
    }

    /// Spawns the accept loop (when listening), the background loops and
    /// the bootstrap dials.
    pub fn start(self: &Arc<Self>, listener: Option<TcpListener>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        if let Some(listener) = listener {
            tasks.push(tokio::spawn(Arc::clone(self).accept_loop(listener)));
        }
        tasks.push(tokio::spawn(Arc::clone(self).relay_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).ping_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).sync_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).probe_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).recovery_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).bootstrap()));
        tasks
    }

    /// Dials `addr`, runs the handshake and starts the connection tasks.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, NetworkError> {
        if self.node.peers().is_connected(addr) {
            return Err(NetworkError::Protocol(format!("already connected to {addr}")));
        }
        if self.book.is_banned(addr) {
            return Err(NetworkError::Protocol(format!("{addr} is banned")));
        }
        let stream = match timeout(self.timings.dial, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(NetworkError::Unreachable(format!("{addr}: {err}"))),
            Err(_) => return Err(NetworkError::Timeout("dial")),
        };
        let id = self.admit(stream, addr, false).await?;
        self.book.add_known([addr]);
        self.watched.lock().insert(addr);
        Ok(id)
    }

    async fn admit(
        self: &Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        inbound: bool,
    ) -> Result<PeerId, NetworkError> {
        let _ = stream.set_nodelay(true);
        let remote = match timeout(self.timings.handshake, self.handshake(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(NetworkError::Timeout("handshake")),
        };
        if inbound && remote.listen_port != 0 {
            let listen = SocketAddr::new(addr.ip(), remote.listen_port);
            if self.book.is_banned(listen) {
                return Err(NetworkError::Protocol(format!("{listen} is banned")));
            }
            self.book.add_known([listen]);
            self.watched.lock().insert(listen);
        }

        let peers = self.node.peers();
        let link = peers.register(addr, inbound)?;
        peers.set_version(link.id, &remote);
        let id = link.id;
        log_info!(
            "Peer {id} connected: {addr} ({}, height {}, {})",
            if inbound { "inbound" } else { "outbound" },
            remote.height,
            remote.user_agent
        );

        let (reader, writer) = stream.into_split();
        tokio::spawn(Arc::clone(self).write_loop(id, writer, link.outbound));
        let gossip = Arc::clone(self);
        let disconnect = link.disconnect;
        tokio::spawn(async move {
            let result = gossip.read_loop(id, addr, reader, disconnect).await;
            gossip.close(id, addr, result);
        });

        peers.send(id, Message::GetPeers);
        let txids: Vec<InvItem> = self
            .node
            .mempool()
            .txids()
            .into_iter()
            .take(MAX_INV_ITEMS)
            .map(|hash| InvItem {
                kind: InvKind::Transaction,
                hash,
            })
            .collect();
        if !txids.is_empty() {
            peers.send(id, Message::Inv(txids));
        }
        self.request_sync();
        Ok(id)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<VersionInfo, NetworkError> {
        write_message(stream, &Message::Version(self.local_version())).await?;
        let remote = match read_message(stream).await? {
            Some(Message::Version(version)) => version,
            Some(other) => {
                return Err(NetworkError::Protocol(format!(
                    "expected version, got {}",
                    other.tag()
                )))
            }
            None => return Err(NetworkError::Closed),
        };
        if remote.network != self.network.as_str() {
            return Err(NetworkError::Protocol(format!(
                "peer is on {}, not {}",
                remote.network,
                self.network.as_str()
            )));
        }
        if remote.protocol_version < MIN_PEER_PROTO_VERSION {
            return Err(NetworkError::Protocol(format!(
                "protocol version {} is too old",
                remote.protocol_version
            )));
        }
        if remote.nonce == self.local_nonce {
            return Err(NetworkError::Protocol("connected to self".to_string()));
        }
        write_message(stream, &Message::Verack).await?;
        match read_message(stream).await? {
            Some(Message::Verack) => Ok(remote),
            Some(other) => Err(NetworkError::Protocol(format!(
                "expected verack, got {}",
                other.tag()
            ))),
            None => Err(NetworkError::Closed),
        }
    }

    fn local_version(&self) -> VersionInfo {
        let tip = self.node.tip();
        VersionInfo {
            protocol_version: PROTOCOL_VERSION,
            network: self.network.as_str().to_string(),
            user_agent: USER_AGENT.to_string(),
            height: tip.height,
            best_hash: tip.hash,
            listen_port: self.listen_port.load(Ordering::Relaxed),
            nonce: self.local_nonce,
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        id: PeerId,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<Message>,
    ) {
        while let Some(message) = outbound.recv().await {
            match timeout(self.timings.write, write_message(&mut writer, &message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log_debug!("Peer {id} write failed: {err}");
                    break;
                }
                Err(_) => {
                    log_debug!("Peer {id} write timed out");
                    break;
                }
            }
        }
        self.node.peers().remove(id);
        let _ = writer.shutdown().await;
    }

    async fn read_loop(
        &self,
        id: PeerId,
        addr: SocketAddr,
        mut reader: OwnedReadHalf,
        disconnect: Arc<Notify>,
    ) -> Result<(), NetworkError> {
        let mut shutdown = self.shutdown.clone();
        loop {
            let message = tokio::select! {
                _ = disconnect.notified() => return Ok(()),
                _ = shutdown.changed() => return Ok(()),
                read = timeout(self.timings.read, read_message(&mut reader)) => match read {
                    Ok(Ok(Some(message))) => message,
                    Ok(Ok(None)) => return Err(NetworkError::Closed),
                    Ok(Err(err)) => return Err(err.into()),
                    Err(_) => return Err(NetworkError::Timeout("read")),
                },
            };
            self.node.peers().note_seen(id);
            self.handle_message(id, addr, message)?;
        }
    }

    fn close(&self, id: PeerId, addr: SocketAddr, result: Result<(), NetworkError>) {
        let snapshot = self.node.peers().remove(id);
        let book_addr = snapshot.as_ref().map(book_addr).unwrap_or(addr);
        {
            let mut inflight = self.sync_inflight.lock();
            if matches!(*inflight, Some((peer, _)) if peer == id) {
                *inflight = None;
            }
        }
        match result {
            Ok(()) => log_info!("Peer {id} ({addr}) disconnected"),
            Err(NetworkError::Closed) => log_info!("Peer {id} ({addr}) closed the connection"),
            Err(NetworkError::Malformed(WireError::Io(err))) => {
                log_info!("Peer {id} ({addr}) dropped: {err}")
            }
            Err(NetworkError::Malformed(err)) => {
                log_warn!("Peer {id} ({addr}) sent a malformed frame: {err}");
                self.penalize(book_addr, Offense::MalformedFrame);
            }
            Err(NetworkError::Timeout(what)) => {
                log_info!("Peer {id} ({addr}) evicted: {what} timed out");
                self.penalize(book_addr, Offense::Unresponsive);
            }
            Err(err) => log_info!("Peer {id} ({addr}) dropped: {err}"),
        }
    }

    fn penalize(&self, addr: SocketAddr, offense: Offense) {
        if self.book.record_offense(addr, offense, self.timings.ban_secs) {
            log_warn!(
                "Banned peer {addr} for {}s (score {})",
                self.timings.ban_secs,
                self.book.score(addr)
            );
        }
    }

    /// Penalizes the sender of invalid data; disconnects it once banned.
    fn misbehaved(&self, id: PeerId, addr: SocketAddr) -> Result<(), NetworkError> {
        let target = self
            .node
            .peers()
            .get(id)
            .as_ref()
            .map(book_addr)
            .unwrap_or(addr);
        self.penalize(target, Offense::InvalidData);
        if self.book.is_banned(target) {
            return Err(NetworkError::Protocol("peer banned".to_string()));
        }
        Ok(())
    }

    fn handle_message(
        &self,
        id: PeerId,
        addr: SocketAddr,
        message: Message,
    ) -> Result<(), NetworkError> {
        let peers = self.node.peers();
        match message {
            Message::Version(_) | Message::Verack => {
                return Err(NetworkError::Protocol("repeated handshake".to_string()));
            }
            Message::Ping(nonce) => {
                peers.send(id, Message::Pong(nonce));
            }
            Message::Pong(nonce) => {
                if let Some(latency) = peers.complete_ping(id, nonce) {
                    log_trace!("Peer {id} pong in {latency:?}");
                }
            }
            Message::GetHeight => {
                let tip = self.node.tip();
                peers.send(
                    id,
                    Message::Height {
                        height: tip.height,
                        best_hash: tip.hash,
                    },
                );
            }
            Message::Height { height, best_hash } => {
                peers.note_height(id, height, best_hash);
                if height > self.node.height() {
                    self.request_sync();
                }
            }
            Message::GetBlocks { start, count } => self.serve_blocks(id, start, count),
            Message::Blocks(blocks) => self.apply_batch(id, addr, blocks)?,
            Message::Inv(items) => self.handle_inv(id, items),
            Message::GetData(items) => self.serve_data(id, items),
            Message::NotFound(items) => {
                let mut requested = self.requested.lock();
                for item in &items {
                    requested.remove(&item.hash);
                }
                log_debug!("Peer {id} did not have {} requested item(s)", items.len());
            }
            Message::NewBlock { hash, block } => self.handle_new_block(id, addr, hash, block)?,
            Message::NewTransaction(tx) => {
                let txid = tx.txid();
                match self.node.submit_transaction(tx, Some(id)) {
                    Ok(_) => {}
                    Err(err) if err.is_rejection() => {
                        log_debug!(
                            "Peer {id} sent rejected transaction {}: {err}",
                            short_hash(&txid)
                        );
                    }
                    Err(err) => log_warn!("Transaction {} not pooled: {err}", short_hash(&txid)),
                }
            }
            Message::GetPeers => {
                let addrs: Vec<SocketAddr> = peers
                    .shareable_addrs()
                    .into_iter()
                    .filter(|shared| *shared != addr)
                    .take(MAX_PEER_ADDRS)
                    .collect();
                peers.send(id, Message::Peers(addrs));
            }
            Message::Peers(addrs) => {
                let added = self.book.add_known(addrs);
                if added > 0 {
                    log_debug!("Learned {added} peer address(es) from peer {id}");
                }
            }
        }
        Ok(())
    }

    fn serve_blocks(&self, id: PeerId, start: u64, count: u32) {
        let limit = count.min(SYNC_BATCH_SIZE) as usize;
        let blocks = match self.node.blocks_from(start, limit) {
            Ok(blocks) => blocks,
            Err(err) => {
                log_warn!("Could not serve blocks from {start} to peer {id}: {err}");
                return;
            }
        };
        if blocks.is_empty() {
            self.node.peers().send(id, Message::Blocks(Vec::new()));
            return;
        }
        for batch in batch_blocks(blocks) {
            if !self.node.peers().send(id, Message::Blocks(batch)) {
                break;
            }
        }
    }

    fn apply_batch(
        &self,
        id: PeerId,
        addr: SocketAddr,
        blocks: Vec<Block>,
    ) -> Result<(), NetworkError> {
        let answered = {
            let mut inflight = self.sync_inflight.lock();
            let answered = matches!(*inflight, Some((peer, _)) if peer == id);
            if answered {
                *inflight = None;
            }
            answered
        };
        if blocks.is_empty() && answered {
            self.unserved_height(id, addr);
            return Ok(());
        }
        if blocks.len() > MAX_BLOCKS_PER_MESSAGE {
            return Err(NetworkError::Protocol(format!(
                "{} blocks in one batch",
                blocks.len()
            )));
        }
        let total = blocks.len();
        let mut connected = 0usize;
        let mut sorted = blocks;
        sorted.sort_by_key(|block| block.header.height);
        for block in sorted {
            let hash = block.hash();
            let height = block.header.height;
            match self.node.process_block(block, hash, BlockSource::Synced(id)) {
                Ok(outcome) if outcome.moved_tip() => connected += 1,
                Ok(BlockOutcome::Orphan { missing }) => {
                    self.request_block(id, missing);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    log_warn!(
                        "Sync block {} at height {height} from peer {id} rejected: {err}",
                        short_hash(&hash)
                    );
                    if err.is_rejection() {
                        self.misbehaved(id, addr)?;
                    }
                    break;
                }
            }
        }
        if total > 0 {
            log_info!(
                "Sync: applied {connected}/{total} block(s) from peer {id}; height {}",
                self.node.height()
            );
        }
        if connected > 0 {
            self.request_sync();
        }
        Ok(())
    }

    /// The peer claimed a taller chain but had nothing above our tip. Its
    /// claim drops to our height until it reports again.
    fn unserved_height(&self, id: PeerId, addr: SocketAddr) {
        let height = self.node.height();
        if !self.node.peers().clamp_height(id, height) {
            return;
        }
        log_info!("Peer {id} ({addr}) served no blocks above height {height}");
        let target = self
            .node
            .peers()
            .get(id)
            .as_ref()
            .map(book_addr)
            .unwrap_or(addr);
        self.penalize(target, Offense::UnservedHeight);
        if self.book.is_banned(target) {
            self.node.peers().remove(id);
        }
    }

    fn handle_inv(&self, id: PeerId, items: Vec<InvItem>) {
        let mut wanted = Vec::new();
        for item in items {
            let known = match item.kind {
                InvKind::Block => self.node.contains_block(&item.hash).unwrap_or(true),
                InvKind::Transaction => self.node.mempool().contains(&item.hash),
            };
            if !known {
                if item.kind == InvKind::Block {
                    self.requested.lock().insert(item.hash);
                }
                wanted.push(item);
            }
        }
        if !wanted.is_empty() {
            self.node.peers().send(id, Message::GetData(wanted));
        }
    }

    fn serve_data(&self, id: PeerId, items: Vec<InvItem>) {
        let peers = self.node.peers();
        let mut missing = Vec::new();
        for item in items {
            let reply = match item.kind {
                InvKind::Block => match self.node.get_block(&item.hash) {
                    Ok(Some(block)) => Some(Message::NewBlock {
                        hash: item.hash,
                        block,
                    }),
                    Ok(None) => None,
                    Err(err) => {
                        log_warn!("Could not read block {}: {err}", short_hash(&item.hash));
                        None
                    }
                },
                InvKind::Transaction => self
                    .node
                    .mempool()
                    .get(&item.hash)
                    .map(|entry| Message::NewTransaction(entry.tx)),
            };
            match reply {
                Some(message) => {
                    peers.send(id, message);
                }
                None => missing.push(item),
            }
        }
        if !missing.is_empty() {
            peers.send(id, Message::NotFound(missing));
        }
    }

    fn handle_new_block(
        &self,
        id: PeerId,
        addr: SocketAddr,
        hash: Hash256,
        block: Block,
    ) -> Result<(), NetworkError> {
        let height = block.header.height;
        let requested = self.requested.lock().remove(&hash);
        let source = if requested {
            BlockSource::Synced(id)
        } else {
            BlockSource::Announced(id)
        };
        match self.node.process_block(block, hash, source) {
            Ok(BlockOutcome::Orphan { missing }) => {
                if !requested {
                    self.node.peers().note_height(id, height, hash);
                    if height > self.node.height() + 1 {
                        self.request_sync();
                    }
                }
                self.request_block(id, missing);
            }
            Ok(outcome) => {
                if outcome.moved_tip() {
                    if !requested {
                        self.node.peers().note_height(id, height, hash);
                    }
                    self.book.record_success(addr);
                }
            }
            Err(NodeError::Storage(reason)) => {
                log_error!(
                    "Block {} from peer {id} hit a storage failure: {reason}",
                    short_hash(&hash)
                );
            }
            Err(err) if err.is_rejection() => {
                log_warn!("Rejected block {} from peer {id}: {err}", short_hash(&hash));
                self.misbehaved(id, addr)?;
            }
            Err(err) => {
                log_debug!("Block {} from peer {id} not accepted: {err}", short_hash(&hash))
            }
        }
        Ok(())
    }

    fn request_block(&self, id: PeerId, hash: Hash256) {
        if !self.requested.lock().insert(hash) {
            return;
        }
        log_debug!("Requesting missing block {} from peer {id}", short_hash(&hash));
        self.node.peers().send(
            id,
            Message::GetData(vec![InvItem {
                kind: InvKind::Block,
                hash,
            }]),
        );
    }

    /// Asks the tallest peer for the next batch above our tip. Returns false
    /// when nobody is ahead or a request is already outstanding.
    fn request_sync(&self) -> bool {
        let expired = {
            let mut inflight = self.sync_inflight.lock();
            match *inflight {
                Some((_, since)) if since.elapsed() < self.timings.read => return false,
                Some((stalled, _)) => {
                    *inflight = None;
                    Some(stalled)
                }
                None => None,
            }
        };
        if let Some(stalled) = expired {
            if let Some(snapshot) = self.node.peers().get(stalled) {
                log_info!("Sync request to peer {stalled} went unanswered");
                self.unserved_height(stalled, snapshot.addr);
            }
        }

        let height = self.node.height();
        let Some((peer, peer_height)) = self.node.peers().best_peer(height) else {
            return false;
        };
        {
            let mut inflight = self.sync_inflight.lock();
            if inflight.is_some() {
                return false;
            }
            *inflight = Some((peer, Instant::now()));
        }
        let count = (peer_height - height).min(u64::from(SYNC_BATCH_SIZE)) as u32;
        log_info!(
            "Sync: requesting {count} block(s) above {height} from peer {peer} at {peer_height}"
        );
        self.node.peers().send(
            peer,
            Message::GetBlocks {
                start: height + 1,
                count,
            },
        )
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    log_warn!("p2p accept failed: {err}");
                    continue;
                }
            };
            let peers = self.node.peers();
            if peers.len() >= peers.max_peers() {
                log_debug!(
                    "Refusing inbound peer {addr}: max peers reached ({}/{})",
                    peers.len(),
                    peers.max_peers()
                );
                continue;
            }
            if self.book.is_banned(addr) {
                log_debug!("Refusing banned inbound peer {addr}");
                continue;
            }
            let gossip = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = gossip.admit(stream, addr, true).await {
                    log_debug!("Inbound peer {addr} refused: {err}");
                }
            });
        }
    }

    async fn relay_loop(self: Arc<Self>) {
        let mut events = self.node.subscribe();
        let mut shutdown = self.shutdown.clone();
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(NodeEvent::NewTip {
                    hash,
                    height,
                    block,
                    origin,
                    relay: true,
                }) => {
                    let sent = self
                        .node
                        .peers()
                        .broadcast(&Message::NewBlock { hash, block }, origin);
                    log_debug!(
                        "Relayed block {} at height {height} to {sent} peer(s)",
                        short_hash(&hash)
                    );
                }
                Ok(NodeEvent::NewTip { .. }) => {}
                Ok(NodeEvent::NewTransaction { tx, origin }) => {
                    self.node
                        .peers()
                        .broadcast(&Message::NewTransaction(tx), origin);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log_warn!("Relay fell behind; {missed} event(s) skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.timings.ping_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let peers = self.node.peers();
            for id in peers.expired_pings(self.timings.ping_timeout) {
                if let Some(peer) = peers.remove(id) {
                    log_info!("Evicted peer {id} ({}): ping timed out", peer.addr);
                    self.penalize(book_addr(&peer), Offense::Unresponsive);
                }
            }
            for peer in peers.snapshot() {
                let nonce: u64 = rand::random();
                if peers.begin_ping(peer.id, nonce) {
                    peers.send(peer.id, Message::Ping(nonce));
                }
            }
        }
    }

    async fn sync_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.timings.sync_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.node.peers().broadcast(&Message::GetHeight, None);
            self.request_sync();
        }
    }

    /// Marks watched peers that stay unreachable past the partition timeout
    /// as affected.
    async fn probe_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.timings.probe_interval);
        let fresh_within = self.timings.ping_interval + self.timings.ping_timeout;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let snapshot = self.node.peers().snapshot();
            let watched: Vec<SocketAddr> = self.watched.lock().iter().copied().collect();
            let now = Instant::now();
            for addr in watched {
                let live = snapshot.iter().any(|peer| {
                    book_addr(peer) == addr && peer.last_seen.elapsed() <= fresh_within
                });
                if live {
                    if self.book.probe_succeeded(addr) {
                        log_info!("Partition recovered: {addr} reachable again");
                    }
                } else if self
                    .book
                    .probe_failed(addr, now, self.timings.partition_timeout)
                {
                    log_warn!(
                        "Partition detected: {addr} unreachable for over {:?}",
                        self.timings.partition_timeout
                    );
                }
            }
        }
    }

    /// Reconnects affected peers and tops the peer set up from the book.
    async fn recovery_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.timings.recovery_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            for addr in self.book.affected() {
                if self.node.peers().is_connected(addr) {
                    continue;
                }
                match self.connect(addr).await {
                    Ok(id) => {
                        if self.book.probe_succeeded(addr) {
                            log_info!("Partition recovered: reconnected to {addr} as peer {id}");
                        }
                    }
                    Err(err) => log_debug!("Recovery dial to {addr} failed: {err}"),
                }
            }
            let peers = self.node.peers();
            let open = peers.max_peers().saturating_sub(peers.len());
            if open == 0 {
                continue;
            }
            let candidates: Vec<SocketAddr> = self
                .book
                .candidates(peers.max_peers() * 2)
                .into_iter()
                .filter(|addr| !peers.is_connected(*addr) && !self.book.is_affected(*addr))
                .take(open)
                .collect();
            for addr in candidates {
                if let Err(err) = self.connect(addr).await {
                    log_debug!("Dial to {addr} failed: {err}");
                }
            }
        }
    }

    async fn bootstrap(self: Arc<Self>) {
        for entry in &self.bootstrap {
            let addrs: Vec<SocketAddr> = match tokio::net::lookup_host(entry.as_str()).await {
                Ok(addrs) => addrs.collect(),
                Err(err) => {
                    log_warn!("Bootstrap peer {entry} did not resolve: {err}");
                    continue;
                }
            };
            let Some(addr) = addrs.first().copied() else {
                continue;
            };
            self.book.add_known([addr]);
            match self.connect(addr).await {
                Ok(id) => log_info!("Bootstrap peer {entry} connected as peer {id}"),
                Err(err) => {
                    log_warn!("Bootstrap peer {entry} unreachable: {err}");
                    self.watched.lock().insert(addr);
                }
            }
        }
    }
}

/// Address a peer is known by in the book: where it listens when it said
/// so, otherwise the socket address.
fn book_addr(peer: &PeerSnapshot) -> SocketAddr {
    if peer.inbound {
        peer.listen_addr.unwrap_or(peer.addr)
    } else {
        peer.addr
    }
}
