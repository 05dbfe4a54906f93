//! Decaying per-peer scores. A tag carries a decay interval and two
//! functions: `decay` transforms the value each due round (or removes
//! it), `bump` folds a delta into it. One worker visits every due tag
//! at the tracker resolution; bumps, removals and tag closures are
//! serialised through bounded channels that fail fast when full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::manager::Shared;

const COMMAND_QUEUE: usize = 128;

/// Default visit resolution of the decay worker.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_secs(60);

/// What a decay round does to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayOutcome {
    Keep(i64),
    /// Delete the entry entirely.
    Remove,
}

pub type DecayFn = Arc<dyn Fn(i64) -> DecayOutcome + Send + Sync>;
pub type BumpFn = Arc<dyn Fn(i64, i64) -> i64 + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DecayError {
    #[error("a decaying tag named {0} already exists")]
    DuplicateTag(String),
    #[error("decaying tag {0} is closed")]
    Closed(String),
    #[error("command queue full for tag {0}")]
    QueueFull(String),
}

/// Configuration for the decay worker.
#[derive(Debug, Clone)]
pub struct DecayerConfig {
    pub resolution: Duration,
}

impl Default for DecayerConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
        }
    }
}

pub(crate) struct TagShared {
    id: u64,
    name: String,
    interval: Duration,
    decay_fn: DecayFn,
    bump_fn: BumpFn,
    closed: AtomicBool,
}

/// Handle to a registered decaying tag.
#[derive(Clone)]
pub struct DecayingTag {
    shared: Arc<TagShared>,
    commands: mpsc::Sender<Command>,
}

impl DecayingTag {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Queue a bump for the peer. Errors instead of blocking when the
    /// queue is full or the tag is closed.
    pub fn bump(&self, peer: PeerId, delta: i64) -> Result<(), DecayError> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(DecayError::Closed(self.shared.name.clone()));
        }
        self.commands
            .try_send(Command::Bump {
                peer,
                tag: self.shared.clone(),
                delta,
            })
            .map_err(|_| DecayError::QueueFull(self.shared.name.clone()))
    }

    /// Queue removal of this tag's value from the peer.
    pub fn remove(&self, peer: PeerId) -> Result<(), DecayError> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(DecayError::Closed(self.shared.name.clone()));
        }
        self.commands
            .try_send(Command::Remove {
                peer,
                tag: self.shared.clone(),
            })
            .map_err(|_| DecayError::QueueFull(self.shared.name.clone()))
    }

    /// Stop tracking this tag and strip its value from every peer.
    pub fn close(&self) -> Result<(), DecayError> {
        if self.shared.closed.swap(true, Ordering::Relaxed) {
            warn!(tag = %self.shared.name, "duplicate close of decaying tag");
            return Ok(());
        }
        self.commands
            .try_send(Command::CloseTag {
                tag: self.shared.clone(),
            })
            .map_err(|_| DecayError::QueueFull(self.shared.name.clone()))
    }
}

enum Command {
    Bump {
        peer: PeerId,
        tag: Arc<TagShared>,
        delta: i64,
    },
    Remove {
        peer: PeerId,
        tag: Arc<TagShared>,
    },
    CloseTag {
        tag: Arc<TagShared>,
    },
}

struct TagState {
    shared: Arc<TagShared>,
    next_tick: Instant,
}

struct Registry {
    tags: HashMap<String, TagState>,
    next_id: u64,
}

/// The decay worker handle owned by the stream manager.
pub(crate) struct Decayer<S> {
    cfg: DecayerConfig,
    registry: Arc<Mutex<Registry>>,
    commands: mpsc::Sender<Command>,
    _marker: std::marker::PhantomData<fn() -> S>,
}

impl<S: Send + Sync + 'static> Decayer<S> {
    pub(crate) fn spawn(
        cfg: DecayerConfig,
        shared: Arc<Shared<S>>,
        token: CancellationToken,
    ) -> Decayer<S> {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let registry = Arc::new(Mutex::new(Registry {
            tags: HashMap::new(),
            next_id: 1,
        }));

        let worker_registry = registry.clone();
        let resolution = cfg.resolution;
        tokio::spawn(async move {
            process(resolution, worker_registry, shared, command_rx, token).await;
        });

        Decayer {
            cfg,
            registry,
            commands,
            _marker: std::marker::PhantomData,
        }
    }

    pub(crate) fn register(
        &self,
        name: &str,
        interval: Duration,
        decay_fn: DecayFn,
        bump_fn: BumpFn,
    ) -> Result<DecayingTag, DecayError> {
        let mut registry = self.registry.lock().unwrap();
        if registry.tags.contains_key(name) {
            return Err(DecayError::DuplicateTag(name.to_string()));
        }

        let mut interval = interval;
        if interval < self.cfg.resolution {
            warn!(
                tag = name,
                "decay interval below tracker resolution, clamping"
            );
            interval = self.cfg.resolution;
        }
        if interval.as_nanos() % self.cfg.resolution.as_nanos() != 0 {
            warn!(
                tag = name,
                "decay interval is not a multiple of the resolution, precision may be lost"
            );
        }

        let id = registry.next_id;
        registry.next_id += 1;
        let shared = Arc::new(TagShared {
            id,
            name: name.to_string(),
            interval,
            decay_fn,
            bump_fn,
            closed: AtomicBool::new(false),
        });
        registry.tags.insert(
            name.to_string(),
            TagState {
                shared: shared.clone(),
                next_tick: Instant::now() + interval,
            },
        );

        Ok(DecayingTag {
            shared,
            commands: self.commands.clone(),
        })
    }

    pub(crate) fn tag_name(&self, id: u64) -> Option<String> {
        let registry = self.registry.lock().unwrap();
        registry
            .tags
            .values()
            .find(|t| t.shared.id == id)
            .map(|t| t.shared.name.clone())
    }
}

async fn process<S>(
    resolution: Duration,
    registry: Arc<Mutex<Registry>>,
    shared: Arc<Shared<S>>,
    mut command_rx: mpsc::Receiver<Command>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(resolution);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,

            _ = ticker.tick() => {
                let now = Instant::now();
                let due: Vec<Arc<TagShared>> = {
                    let mut registry = registry.lock().unwrap();
                    let mut due = Vec::new();
                    for state in registry.tags.values_mut() {
                        if state.next_tick <= now {
                            due.push(state.shared.clone());
                            state.next_tick += state.shared.interval;
                        }
                    }
                    due
                };
                if !due.is_empty() {
                    decay_round(&shared, &due);
                }
            }

            Some(cmd) = command_rx.recv() => match cmd {
                Command::Bump { peer, tag, delta } => apply_bump(&shared, peer, &tag, delta),
                Command::Remove { peer, tag } => apply_remove(&shared, &peer, &tag),
                Command::CloseTag { tag } => close_tag(&registry, &shared, &tag),
            },
        }
    }
}

/// Visit every peer and decay the due tags. Removed values are
/// deleted, never zeroed, so `decaying` only holds live entries.
fn decay_round<S>(shared: &Shared<S>, due: &[Arc<TagShared>]) {
    for segment in &shared.segments {
        let mut segment = segment.lock().unwrap();
        for info in segment.peers.values_mut() {
            for tag in due {
                let Some(value) = info.decaying.get(&tag.id).copied() else {
                    continue;
                };
                match (tag.decay_fn)(value) {
                    DecayOutcome::Remove => {
                        info.decaying.remove(&tag.id);
                        info.value -= value;
                    }
                    DecayOutcome::Keep(after) => {
                        info.value += after - value;
                        info.decaying.insert(tag.id, after);
                    }
                }
            }
        }
    }
}

fn apply_bump<S>(shared: &Shared<S>, peer: PeerId, tag: &Arc<TagShared>, delta: i64) {
    let mut segment = shared.segment(&peer).lock().unwrap();
    let info = segment.info_for(peer);
    let old = info.decaying.get(&tag.id).copied().unwrap_or(0);
    let new = (tag.bump_fn)(old, delta);
    info.value += new - old;
    info.decaying.insert(tag.id, new);
}

fn apply_remove<S>(shared: &Shared<S>, peer: &PeerId, tag: &Arc<TagShared>) {
    let mut segment = shared.segment(peer).lock().unwrap();
    let Some(info) = segment.peers.get_mut(peer) else {
        return;
    };
    if let Some(value) = info.decaying.remove(&tag.id) {
        info.value -= value;
    }
}

fn close_tag<S>(registry: &Mutex<Registry>, shared: &Shared<S>, tag: &Arc<TagShared>) {
    registry.lock().unwrap().tags.remove(&tag.name);
    for segment in &shared.segments {
        let mut segment = segment.lock().unwrap();
        for info in segment.peers.values_mut() {
            if let Some(value) = info.decaying.remove(&tag.id) {
                info.value -= value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{Manager, ManagerConfig};
    use tokio::time::{advance, sleep};

    fn linear_decay(step: i64) -> DecayFn {
        Arc::new(move |v| {
            let after = v - step;
            if after <= 0 {
                DecayOutcome::Remove
            } else {
                DecayOutcome::Keep(after)
            }
        })
    }

    fn sum_bump() -> BumpFn {
        Arc::new(|v, delta| v + delta)
    }

    fn manager() -> Manager<u32> {
        Manager::new(
            1,
            100,
            ManagerConfig {
                decayer: DecayerConfig {
                    resolution: Duration::from_secs(1),
                },
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn bump_accumulates() {
        let m = manager();
        let peer = PeerId::random();
        m.connected(peer, 1);
        let tag = m
            .register_decaying_tag("bw", Duration::from_secs(3600), linear_decay(1), sum_bump())
            .unwrap();
        tag.bump(peer, 5).unwrap();
        tag.bump(peer, 2).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(m.tag_info(&peer).unwrap().value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn values_decay_each_interval() {
        let m = manager();
        let peer = PeerId::random();
        m.connected(peer, 1);
        let tag = m
            .register_decaying_tag("bw", Duration::from_secs(2), linear_decay(3), sum_bump())
            .unwrap();
        tag.bump(peer, 10).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(m.tag_info(&peer).unwrap().value, 10);

        advance(Duration::from_secs(2)).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(m.tag_info(&peer).unwrap().value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn decayed_out_values_are_deleted() {
        let m = manager();
        let peer = PeerId::random();
        m.connected(peer, 1);
        let tag = m
            .register_decaying_tag("bw", Duration::from_secs(1), linear_decay(100), sum_bump())
            .unwrap();
        tag.bump(peer, 5).unwrap();
        sleep(Duration::from_millis(50)).await;

        advance(Duration::from_secs(2)).await;
        sleep(Duration::from_millis(50)).await;
        let info = m.tag_info(&peer).unwrap();
        assert_eq!(info.value, 0);
        assert!(info.tags.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_strips_the_value() {
        let m = manager();
        let peer = PeerId::random();
        m.connected(peer, 1);
        let tag = m
            .register_decaying_tag("bw", Duration::from_secs(3600), linear_decay(1), sum_bump())
            .unwrap();
        tag.bump(peer, 9).unwrap();
        tag.remove(peer).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(m.tag_info(&peer).unwrap().value, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_tag_names_are_rejected() {
        let m = manager();
        let _tag = m
            .register_decaying_tag("bw", Duration::from_secs(60), linear_decay(1), sum_bump())
            .unwrap();
        assert!(matches!(
            m.register_decaying_tag("bw", Duration::from_secs(60), linear_decay(1), sum_bump()),
            Err(DecayError::DuplicateTag(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_tags_reject_bumps() {
        let m = manager();
        let peer = PeerId::random();
        let tag = m
            .register_decaying_tag("bw", Duration::from_secs(60), linear_decay(1), sum_bump())
            .unwrap();
        tag.close().unwrap();
        assert!(matches!(tag.bump(peer, 1), Err(DecayError::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_a_tag_strips_it_everywhere() {
        let m = manager();
        let peer = PeerId::random();
        m.connected(peer, 1);
        m.tag_peer(peer, "static", 4);
        let tag = m
            .register_decaying_tag("bw", Duration::from_secs(3600), linear_decay(1), sum_bump())
            .unwrap();
        tag.bump(peer, 6).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(m.tag_info(&peer).unwrap().value, 10);

        tag.close().unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(m.tag_info(&peer).unwrap().value, 4);
    }
}
