//! Stream admission and eviction. Tracks per-peer metadata (first
//! seen, static and decaying scores, open streams) across 256 lock
//! segments keyed by the last byte of the peer ID, and trims the
//! lowest-scored peers whenever the stream count crosses the high
//! watermark outside the silence window.
//!
//! Invariants: the global stream count equals the sum of per-segment
//! stream maps; a peer's `value` equals the sum of its static tag
//! values and decaying tag values.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use libp2p::PeerId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::decay::{BumpFn, DecayFn, Decayer, DecayerConfig, DecayingTag};

/// An open stream shared between the cache and whoever is writing to
/// it right now. Dropping the last handle closes the stream.
pub type SharedStream = Arc<tokio::sync::Mutex<libp2p::Stream>>;

const SEGMENT_COUNT: usize = 256;

/// Watermarks and timing for the trim heuristic.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub low_water: usize,
    pub high_water: usize,
    /// Newly seen peers are immune from trimming for this long.
    pub grace_period: Duration,
    /// Minimum spacing between automatic trim passes.
    pub silence_period: Duration,
    pub decayer: DecayerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            low_water: 0,
            high_water: 0,
            grace_period: Duration::from_secs(10),
            silence_period: Duration::from_secs(10),
            decayer: DecayerConfig::default(),
        }
    }
}

pub(crate) struct StreamEntry<S> {
    pub(crate) stream: S,
    pub(crate) last_used: Instant,
}

/// Metadata for one tracked peer.
pub(crate) struct PeerInfo<S> {
    pub(crate) first_seen: Instant,
    /// Entry created by an early tag, before any stream arrived.
    pub(crate) temp: bool,
    pub(crate) tags: HashMap<String, i64>,
    /// Decaying values keyed by tag id; entries are deleted when a
    /// decay round removes them, never set to zero.
    pub(crate) decaying: HashMap<u64, i64>,
    /// Cached sum of all tag and decaying values.
    pub(crate) value: i64,
    pub(crate) streams: HashMap<u64, StreamEntry<S>>,
}

impl<S> PeerInfo<S> {
    fn temp_entry() -> Self {
        PeerInfo {
            first_seen: Instant::now(),
            temp: true,
            tags: HashMap::new(),
            decaying: HashMap::new(),
            value: 0,
            streams: HashMap::new(),
        }
    }
}

pub(crate) struct Segment<S> {
    pub(crate) peers: HashMap<PeerId, PeerInfo<S>>,
}

impl<S> Segment<S> {
    /// Get or create the peer record, buffering early tags in a temp
    /// entry until a stream shows up.
    pub(crate) fn info_for(&mut self, peer: PeerId) -> &mut PeerInfo<S> {
        self.peers.entry(peer).or_insert_with(PeerInfo::temp_entry)
    }
}

pub(crate) struct Shared<S> {
    pub(crate) segments: Vec<Mutex<Segment<S>>>,
    pub(crate) protected: RwLock<HashMap<PeerId, HashSet<String>>>,
    pub(crate) stream_count: AtomicI64,
    next_stream_id: AtomicU64,
    cfg: ManagerConfig,
}

impl<S> Shared<S> {
    pub(crate) fn segment(&self, peer: &PeerId) -> &Mutex<Segment<S>> {
        let bytes = peer.to_bytes();
        let index = *bytes.last().unwrap_or(&0) as usize % SEGMENT_COUNT;
        &self.segments[index]
    }
}

/// Snapshot of one peer's metadata.
#[derive(Debug, Clone)]
pub struct TagInfo {
    pub first_seen: Instant,
    pub value: i64,
    pub tags: HashMap<String, i64>,
    pub streams: usize,
}

/// The stream manager. Cheap to clone; all clones share state.
pub struct Manager<S = SharedStream> {
    shared: Arc<Shared<S>>,
    decayer: Decayer<S>,
    token: CancellationToken,
    last_trim: Mutex<Instant>,
}

impl<S: Clone + Send + Sync + 'static> Manager<S> {
    /// Build a manager with the given watermarks and spawn its trim
    /// and decay workers.
    pub fn new(low_water: usize, high_water: usize, mut cfg: ManagerConfig) -> Manager<S> {
        cfg.low_water = low_water;
        cfg.high_water = high_water;

        let shared = Arc::new(Shared {
            segments: (0..SEGMENT_COUNT)
                .map(|_| {
                    Mutex::new(Segment {
                        peers: HashMap::new(),
                    })
                })
                .collect(),
            protected: RwLock::new(HashMap::new()),
            stream_count: AtomicI64::new(0),
            next_stream_id: AtomicU64::new(1),
            cfg: cfg.clone(),
        });

        let token = CancellationToken::new();
        let decayer = Decayer::spawn(cfg.decayer.clone(), shared.clone(), token.clone());

        let manager = Manager {
            shared,
            decayer,
            token,
            last_trim: Mutex::new(Instant::now()),
        };
        manager.spawn_background();
        manager
    }

    fn spawn_background(&self) {
        let shared = self.shared.clone();
        let token = self.token.clone();
        let interval = if self.shared.cfg.silence_period > Duration::ZERO {
            self.shared.cfg.silence_period
        } else {
            self.shared.cfg.grace_period / 2
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let count = shared.stream_count.load(Ordering::Relaxed);
                        if count >= shared.cfg.high_water as i64 {
                            trim(&shared);
                        }
                    }
                    _ = token.cancelled() => return,
                }
            }
        });
    }

    /// Stop the trim and decay workers. Tracked streams are dropped
    /// with the manager.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Register a fresh stream for the peer. Temp entries flip to real
    /// ones and restart their grace period.
    pub fn connected(&self, peer: PeerId, stream: S) -> u64 {
        let id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let mut segment = self.shared.segment(&peer).lock().unwrap();
        let info = segment.info_for(peer);
        if info.temp {
            info.temp = false;
            info.first_seen = Instant::now();
        }
        info.streams.insert(
            id,
            StreamEntry {
                stream,
                last_used: Instant::now(),
            },
        );
        self.shared.stream_count.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Drop a stream the caller observed failing. The peer record goes
    /// with it once no streams remain.
    pub fn disconnected(&self, peer: &PeerId, id: u64) {
        let mut segment = self.shared.segment(peer).lock().unwrap();
        let Some(info) = segment.peers.get_mut(peer) else {
            debug!(peer = %peer, "disconnect for untracked peer");
            return;
        };
        if info.streams.remove(&id).is_none() {
            debug!(peer = %peer, "disconnect for untracked stream");
            return;
        }
        self.shared.stream_count.fetch_sub(1, Ordering::Relaxed);
        if info.streams.is_empty() {
            segment.peers.remove(peer);
        }
    }

    /// A cached idle stream for the peer, refreshing its use stamp.
    pub fn stream_for(&self, peer: &PeerId) -> Option<(u64, S)> {
        let mut segment = self.shared.segment(peer).lock().unwrap();
        let info = segment.peers.get_mut(peer)?;
        let (id, entry) = info.streams.iter_mut().next()?;
        entry.last_used = Instant::now();
        Some((*id, entry.stream.clone()))
    }

    pub fn stream_count(&self) -> usize {
        self.shared.stream_count.load(Ordering::Relaxed).max(0) as usize
    }

    /// Shield a peer from trimming under the given tag.
    pub fn protect(&self, peer: PeerId, tag: &str) {
        self.shared
            .protected
            .write()
            .unwrap()
            .entry(peer)
            .or_default()
            .insert(tag.to_string());
    }

    /// Remove one protection tag; returns whether any remain.
    pub fn unprotect(&self, peer: &PeerId, tag: &str) -> bool {
        let mut protected = self.shared.protected.write().unwrap();
        let Some(tags) = protected.get_mut(peer) else {
            return false;
        };
        tags.remove(tag);
        if tags.is_empty() {
            protected.remove(peer);
            return false;
        }
        true
    }

    pub fn is_protected(&self, peer: &PeerId, tag: &str) -> bool {
        let protected = self.shared.protected.read().unwrap();
        match protected.get(peer) {
            Some(tags) if tag.is_empty() => !tags.is_empty(),
            Some(tags) => tags.contains(tag),
            None => false,
        }
    }

    /// Set a static tag value on the peer.
    pub fn tag_peer(&self, peer: PeerId, tag: &str, value: i64) {
        let mut segment = self.shared.segment(&peer).lock().unwrap();
        let info = segment.info_for(peer);
        let old = info.tags.insert(tag.to_string(), value).unwrap_or(0);
        info.value += value - old;
    }

    /// Remove a static tag from the peer.
    pub fn untag_peer(&self, peer: &PeerId, tag: &str) {
        let mut segment = self.shared.segment(peer).lock().unwrap();
        let Some(info) = segment.peers.get_mut(peer) else {
            debug!(peer = %peer, "untag for untracked peer");
            return;
        };
        if let Some(old) = info.tags.remove(tag) {
            info.value -= old;
        }
    }

    /// Insert or transform a static tag value.
    pub fn upsert_tag(&self, peer: PeerId, tag: &str, upsert: impl FnOnce(i64) -> i64) {
        let mut segment = self.shared.segment(&peer).lock().unwrap();
        let info = segment.info_for(peer);
        let old = info.tags.get(tag).copied().unwrap_or(0);
        let new = upsert(old);
        info.value += new - old;
        info.tags.insert(tag.to_string(), new);
    }

    /// Snapshot of the peer's score and stream count.
    pub fn tag_info(&self, peer: &PeerId) -> Option<TagInfo> {
        let segment = self.shared.segment(peer).lock().unwrap();
        let info = segment.peers.get(peer)?;
        let mut tags = info.tags.clone();
        for (id, value) in &info.decaying {
            if let Some(name) = self.decayer.tag_name(*id) {
                tags.insert(name, *value);
            }
        }
        Some(TagInfo {
            first_seen: info.first_seen,
            value: info.value,
            tags,
            streams: info.streams.len(),
        })
    }

    /// Register a decaying tag with the manager's decay worker.
    pub fn register_decaying_tag(
        &self,
        name: &str,
        interval: Duration,
        decay_fn: DecayFn,
        bump_fn: BumpFn,
    ) -> Result<DecayingTag, crate::decay::DecayError> {
        self.decayer.register(name, interval, decay_fn, bump_fn)
    }

    /// Run a trim pass now, regardless of watermarks and silence.
    pub fn trim_open_streams(&self) {
        trim(&self.shared);
        *self.last_trim.lock().unwrap() = Instant::now();
    }

    /// When the last automatic or manual trim ran.
    pub fn last_trim(&self) -> Instant {
        *self.last_trim.lock().unwrap()
    }
}

impl<S> Drop for Manager<S> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Candidate {
    peer: PeerId,
    temp: bool,
    value: i64,
    streams: usize,
}

/// Close the lowest-scored peers' streams until at most `low_water`
/// remain, skipping protected peers and peers inside the grace period.
fn trim<S>(shared: &Shared<S>) {
    let cfg = &shared.cfg;
    if cfg.low_water == 0 || cfg.high_water == 0 {
        return;
    }
    if shared.stream_count.load(Ordering::Relaxed) <= cfg.low_water as i64 {
        return;
    }

    let Some(grace_start) = Instant::now().checked_sub(cfg.grace_period) else {
        return;
    };
    let protected = shared.protected.read().unwrap();
    let mut candidates = Vec::new();
    let mut ncandidates = 0usize;

    for segment in &shared.segments {
        let segment = segment.lock().unwrap();
        for (peer, info) in &segment.peers {
            if protected.contains_key(peer) {
                continue;
            }
            if info.first_seen > grace_start {
                continue;
            }
            candidates.push(Candidate {
                peer: *peer,
                temp: info.temp,
                value: info.value,
                streams: info.streams.len(),
            });
            ncandidates += info.streams.len();
        }
    }
    drop(protected);

    if ncandidates < cfg.low_water {
        debug!("streams over the limit but too many in the grace period");
        return;
    }

    // Temp peers first, then ascending score.
    candidates.sort_by(|a, b| b.temp.cmp(&a.temp).then(a.value.cmp(&b.value)));

    let mut target = ncandidates as i64 - cfg.low_water as i64;
    for candidate in candidates {
        if target <= 0 {
            break;
        }
        let mut segment = shared.segment(&candidate.peer).lock().unwrap();
        let Some(info) = segment.peers.get_mut(&candidate.peer) else {
            continue;
        };
        if info.streams.is_empty() && info.temp {
            // Early-tag entry that never got a stream and is past its
            // grace period.
            segment.peers.remove(&candidate.peer);
            continue;
        }
        let closed = info.streams.len();
        info.streams.clear();
        segment.peers.remove(&candidate.peer);
        shared
            .stream_count
            .fetch_sub(closed as i64, Ordering::Relaxed);
        target -= closed as i64;
        debug!(peer = %candidate.peer, closed, "trimmed peer streams");
    }
}
