use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Score change for a peer that served something useful.
const SUCCESS_SCORE: i32 = 3;
/// Score at or below which a peer is banned outright.
const BAN_SCORE: i32 = -20;
const MAX_KNOWN_ADDRS: usize = 4_096;

#[derive(Clone, Debug)]
pub struct BannedPeerInfo {
    pub addr: SocketAddr,
    pub banned_until: SystemTime,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListFile {
    version: u32,
    banned: Vec<BanListEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListEntry {
    addr: SocketAddr,
    banned_until: u64,
}

const BANLIST_VERSION: u32 = 1;

/// Misbehaviour that costs a peer score.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offense {
    /// Frame or envelope that did not decode.
    MalformedFrame,
    /// Block or transaction that failed validation.
    InvalidData,
    /// Missed a ping or a read deadline.
    Unresponsive,
    /// Advertised a taller chain, then served nothing above ours.
    UnservedHeight,
}

impl Offense {
    fn penalty(self) -> i32 {
        match self {
            Offense::MalformedFrame => 10,
            Offense::InvalidData => 20,
            Offense::Unresponsive => 1,
            Offense::UnservedHeight => 5,
        }
    }
}

#[derive(Default)]
struct Partition {
    /// First failed probe of a peer not yet marked affected.
    failing_since: HashMap<SocketAddr, Instant>,
    affected: HashSet<SocketAddr>,
}

/// Long-lived knowledge about peer addresses: reputation, temporary bans,
/// addresses learned from gossip, and which peers look partitioned away.
#[derive(Default)]
pub struct PeerBook {
    scores: Mutex<HashMap<SocketAddr, i32>>,
    banned: Mutex<HashMap<SocketAddr, SystemTime>>,
    known: Mutex<HashSet<SocketAddr>>,
    partition: Mutex<Partition>,
    revision: AtomicU64,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, addr: SocketAddr) {
        let mut scores = self.scores.lock();
        let entry = scores.entry(addr).or_insert(0);
        *entry = entry.saturating_add(SUCCESS_SCORE);
    }

    /// Lowers the peer's score and bans it for `ban_secs` once the score
    /// falls to the ban threshold. Returns true when this call banned it.
    pub fn record_offense(&self, addr: SocketAddr, offense: Offense, ban_secs: u64) -> bool {
        let score = {
            let mut scores = self.scores.lock();
            let entry = scores.entry(addr).or_insert(0);
            *entry = entry.saturating_sub(offense.penalty());
            *entry
        };
        if score <= BAN_SCORE && !self.is_banned(addr) {
            self.ban_for(addr, ban_secs);
            return true;
        }
        false
    }

    pub fn score(&self, addr: SocketAddr) -> i32 {
        self.scores.lock().get(&addr).copied().unwrap_or(0)
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let now = SystemTime::now();
        let mut banned = self.banned.lock();
        if let Some(until) = banned.get(&addr).copied() {
            if until > now {
                return true;
            }
            banned.remove(&addr);
            self.scores.lock().remove(&addr);
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    pub fn ban_for(&self, addr: SocketAddr, secs: u64) {
        self.banned
            .lock()
            .insert(addr, SystemTime::now() + Duration::from_secs(secs));
        self.revision.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unban(&self, addr: SocketAddr) -> bool {
        let removed = self.banned.lock().remove(&addr).is_some();
        if removed {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn banned_peers(&self) -> Vec<BannedPeerInfo> {
        let now = SystemTime::now();
        let mut banned = self.banned.lock();
        let before = banned.len();
        banned.retain(|_, until| *until > now);
        if banned.len() != before {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        banned
            .iter()
            .map(|(addr, until)| BannedPeerInfo {
                addr: *addr,
                banned_until: *until,
            })
            .collect()
    }

    pub fn banlist_revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    /// Remembers addresses learned from bootstrap or gossip. Returns how many
    /// were new.
    pub fn add_known<I: IntoIterator<Item = SocketAddr>>(&self, addrs: I) -> usize {
        let mut known = self.known.lock();
        let mut added = 0;
        for addr in addrs {
            if known.len() >= MAX_KNOWN_ADDRS {
                break;
            }
            if known.insert(addr) {
                added += 1;
            }
        }
        added
    }

    /// Known addresses that are not banned, best score first.
    pub fn candidates(&self, limit: usize) -> Vec<SocketAddr> {
        let known: Vec<SocketAddr> = self.known.lock().iter().copied().collect();
        let mut entries: Vec<(SocketAddr, i32)> = known
            .into_iter()
            .filter(|addr| !self.is_banned(*addr))
            .map(|addr| (addr, self.score(addr)))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        entries.into_iter().map(|(addr, _)| addr).collect()
    }

    /// Notes a failed connectivity probe. Returns true when the peer has
    /// been failing for longer than `timeout` and just became affected.
    pub fn probe_failed(&self, addr: SocketAddr, now: Instant, timeout: Duration) -> bool {
        let mut partition = self.partition.lock();
        if partition.affected.contains(&addr) {
            return false;
        }
        let since = *partition.failing_since.entry(addr).or_insert(now);
        if now.saturating_duration_since(since) >= timeout {
            partition.failing_since.remove(&addr);
            partition.affected.insert(addr);
            return true;
        }
        false
    }

    /// Notes a successful probe or reconnect. Returns true when the peer was
    /// affected and has now recovered.
    pub fn probe_succeeded(&self, addr: SocketAddr) -> bool {
        let mut partition = self.partition.lock();
        partition.failing_since.remove(&addr);
        partition.affected.remove(&addr)
    }

    pub fn affected(&self) -> Vec<SocketAddr> {
        let mut affected: Vec<_> = self.partition.lock().affected.iter().copied().collect();
        affected.sort();
        affected
    }

    pub fn is_affected(&self, addr: SocketAddr) -> bool {
        self.partition.lock().affected.contains(&addr)
    }

    pub fn load_banlist(&self, path: &Path) -> Result<usize, String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.to_string()),
        };
        let file: BanListFile =
            serde_json::from_slice(&bytes).map_err(|err| format!("invalid banlist: {err}"))?;
        if file.version != BANLIST_VERSION {
            return Err(format!(
                "unsupported banlist version {} (expected {})",
                file.version, BANLIST_VERSION
            ));
        }
        let now = SystemTime::now();
        let mut inserted = 0usize;
        let mut banned = self.banned.lock();
        for entry in file.banned {
            let until = UNIX_EPOCH + Duration::from_secs(entry.banned_until);
            if until <= now {
                continue;
            }
            banned.insert(entry.addr, until);
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn save_banlist(&self, path: &Path) -> Result<(), String> {
        let mut entries: Vec<BanListEntry> = self
            .banned_peers()
            .into_iter()
            .map(|info| BanListEntry {
                addr: info.addr,
                banned_until: info
                    .banned_until
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.addr.to_string());
        let file = BanListFile {
            version: BANLIST_VERSION,
            banned: entries,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|err| err.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|err| err.to_string())?;
        if fs::rename(&tmp, path).is_err() {
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path).map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn repeated_offenses_ban_the_peer() {
        let book = PeerBook::new();
        assert!(!book.record_offense(addr(1), Offense::MalformedFrame, 60));
        assert!(!book.is_banned(addr(1)));
        assert!(book.record_offense(addr(1), Offense::MalformedFrame, 60));
        assert!(book.is_banned(addr(1)));
        assert_eq!(book.banned_peers().len(), 1);
        assert!(book.unban(addr(1)));
        assert!(!book.is_banned(addr(1)));

        for _ in 0..3 {
            assert!(!book.record_offense(addr(2), Offense::UnservedHeight, 60));
        }
        assert!(book.record_offense(addr(2), Offense::UnservedHeight, 60));
        assert_eq!(book.score(addr(2)), -20);
    }

    #[test]
    fn candidates_skip_banned_and_prefer_good_scores() {
        let book = PeerBook::new();
        assert_eq!(book.add_known([addr(1), addr(2), addr(3), addr(1)]), 3);
        book.record_success(addr(3));
        book.ban_for(addr(2), 60);
        assert_eq!(book.candidates(10), vec![addr(3), addr(1)]);
    }

    #[test]
    fn peer_becomes_affected_after_timeout_and_recovers() {
        let book = PeerBook::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(30);
        assert!(!book.probe_failed(addr(1), start, timeout));
        assert!(!book.probe_failed(addr(1), start + Duration::from_secs(10), timeout));
        assert!(book.probe_failed(addr(1), start + Duration::from_secs(31), timeout));
        assert!(!book.probe_failed(addr(1), start + Duration::from_secs(40), timeout));
        assert_eq!(book.affected(), vec![addr(1)]);
        assert!(book.probe_succeeded(addr(1)));
        assert!(book.affected().is_empty());
        assert!(!book.probe_succeeded(addr(1)));
    }

    #[test]
    fn success_resets_the_failure_clock() {
        let book = PeerBook::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(30);
        book.probe_failed(addr(1), start, timeout);
        book.probe_succeeded(addr(1));
        assert!(!book.probe_failed(addr(1), start + Duration::from_secs(31), timeout));
    }

    #[test]
    fn banlist_survives_a_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("banlist.json");
        let book = PeerBook::new();
        book.ban_for(addr(9), 3_600);
        book.save_banlist(&path).expect("save");
        let restored = PeerBook::new();
        assert_eq!(restored.load_banlist(&path).expect("load"), 1);
        assert!(restored.is_banned(addr(9)));
    }
}
