//! The replicated ledger: a linear chain of storage snapshots plus the
//! announce engine that reconciles desired state onto it.
//!
//! The ledger is eventually consistent. A single write can always lose
//! to a concurrent writer or to a node that has not caught up yet, so
//! every meaningful write goes through a periodic reconcile loop
//! (`announce_update`, `persist`, `announce_delete_*`) instead of a
//! one-shot `add`.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::block::{Block, Storage};
use crate::data::Data;
use crate::store::Store;
use crate::ticker::BackoffTicker;
use crate::Error;

/// Compressed head blocks queued for the gossip layer.
pub type BlockWriter = mpsc::UnboundedSender<Vec<u8>>;

/// The ledger head and its outbound writer. All readers get deep
/// copies; the mutex serializes every read-modify-write on the chain.
pub struct Ledger {
    chain: Mutex<Box<dyn Store>>,
    writer: BlockWriter,
}

impl Ledger {
    /// Wrap a store, creating the genesis block when the store is
    /// empty, and queue outbound head broadcasts on `writer`.
    pub fn new(writer: BlockWriter, store: Box<dyn Store>) -> Arc<Ledger> {
        if store.last().is_none() {
            store.add(Block::genesis());
        }
        Arc::new(Ledger {
            chain: Mutex::new(store),
            writer,
        })
    }

    /// Deep copy of the latest block's storage.
    pub fn current_data(&self) -> Storage {
        let chain = self.chain.lock().unwrap();
        chain.last().map(|b| b.storage).unwrap_or_default()
    }

    /// Look up a single key on the latest block.
    pub fn get_key(&self, bucket: &str, key: &str) -> Option<Data> {
        let chain = self.chain.lock().unwrap();
        chain
            .last()
            .and_then(|b| b.storage.get(bucket).and_then(|kv| kv.get(key).cloned()))
    }

    /// Whether any value in `bucket` matches the predicate.
    pub fn exists(&self, bucket: &str, f: impl Fn(&Data) -> bool) -> bool {
        let chain = self.chain.lock().unwrap();
        chain
            .last()
            .map(|b| {
                b.storage
                    .get(bucket)
                    .map(|kv| kv.values().any(|v| f(v)))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// The latest block.
    pub fn last_block(&self) -> Block {
        self.chain.lock().unwrap().last().unwrap_or_default()
    }

    /// The last known chain index.
    pub fn index(&self) -> u64 {
        self.chain.lock().unwrap().len()
    }

    /// Pretty-printed head, for debug surfaces.
    pub fn dump(&self) -> String {
        serde_json::to_string_pretty(&self.last_block()).unwrap_or_default()
    }

    /// Set entries in a bucket: deep-copy the latest storage, apply,
    /// chain a successor and broadcast it.
    pub fn add(&self, bucket: &str, entries: impl IntoIterator<Item = (String, Data)>) {
        let mut storage = self.current_data();
        let kv = storage.entry(bucket.to_string()).or_default();
        for (key, value) in entries {
            kv.insert(key, value);
        }
        self.write_data(storage);
    }

    /// Publish a successor with one key omitted.
    pub fn delete(&self, bucket: &str, key: &str) {
        let mut storage = self.current_data();
        if let Some(kv) = storage.get_mut(bucket) {
            kv.remove(key);
        }
        self.write_data(storage);
    }

    /// Publish a successor with an entire bucket omitted.
    pub fn delete_bucket(&self, bucket: &str) {
        let mut storage = self.current_data();
        storage.remove(bucket);
        self.write_data(storage);
    }

    fn write_data(&self, storage: Storage) {
        let head = {
            let chain = self.chain.lock().unwrap();
            let last = chain.last().unwrap_or_default();
            let block = last.next(storage);
            if block.is_valid_successor(&last) {
                chain.add(block);
            }
            chain.last().unwrap_or_default()
        };
        self.broadcast(&head);
    }

    fn broadcast(&self, block: &Block) {
        match serde_json::to_vec(block) {
            Ok(bytes) => {
                if self.writer.send(compress(&bytes)).is_err() {
                    debug!("block writer closed, dropping head broadcast");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode head block"),
        }
    }

    /// Adopt a head received from the gossip layer. The payload is
    /// gzip-compressed JSON; only higher-indexed blocks replace the
    /// local head, ties keep the local copy.
    pub fn update(&self, payload: &[u8]) -> Result<(), Error> {
        let block: Block = serde_json::from_slice(&decompress(payload)?)?;
        let chain = self.chain.lock().unwrap();
        if block.index > chain.len() {
            chain.add(block);
        }
        Ok(())
    }

    /// Periodically publish the current head. This converges
    /// partitions and brings fresh joiners forward.
    pub fn syncronizer(self: &Arc<Self>, token: CancellationToken, interval: Duration) {
        let ledger = self.clone();
        tokio::spawn(async move {
            let mut ticker = BackoffTicker::capped(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => ledger.broadcast(&ledger.last_block()),
                    _ = token.cancelled() => return,
                }
            }
        });
    }

    // ─── Announce engine ────────────────────────────────────────────

    /// Run `f` on every tick of a backoff ticker capped at `interval`
    /// until the token cancels.
    pub fn announce(
        self: &Arc<Self>,
        token: CancellationToken,
        interval: Duration,
        f: impl Fn(&Ledger) + Send + Sync + 'static,
    ) {
        let ledger = self.clone();
        tokio::spawn(async move {
            let mut ticker = BackoffTicker::capped(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => f(&ledger),
                    _ = token.cancelled() => return,
                }
            }
        });
    }

    /// Keep writing `value` at `bucket/key` whenever the ledger
    /// disagrees, forever (until the token cancels).
    pub fn announce_update(
        self: &Arc<Self>,
        token: CancellationToken,
        interval: Duration,
        bucket: &str,
        key: &str,
        value: Data,
    ) {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.announce(token, interval, move |ledger| {
            let current = ledger.get_key(&bucket, &key);
            if current.as_ref() != Some(&value) {
                ledger.add(&bucket, [(key.clone(), value.clone())]);
            }
        });
    }

    /// Announce `value` at `bucket/key` until the ledger reflects it,
    /// then stop. The loop also gives up after `timeout`, so several
    /// writers racing on one key cannot flood the network forever.
    pub fn persist(
        self: &Arc<Self>,
        token: CancellationToken,
        interval: Duration,
        timeout: Duration,
        bucket: &str,
        key: &str,
        value: Data,
    ) {
        let done = deadline_token(&token, timeout);
        let inner = done.clone();
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.announce(done, interval, move |ledger| {
            match ledger.get_key(&bucket, &key) {
                Some(current) if current == value => inner.cancel(),
                _ => ledger.add(&bucket, [(key.clone(), value.clone())]),
            }
        });
    }

    /// Keep issuing the delete until the key is gone, then stop.
    pub fn announce_delete_bucket_key(
        self: &Arc<Self>,
        token: CancellationToken,
        interval: Duration,
        timeout: Duration,
        bucket: &str,
        key: &str,
    ) {
        let done = deadline_token(&token, timeout);
        let inner = done.clone();
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.announce(done, interval, move |ledger| {
            if ledger.get_key(&bucket, &key).is_some() {
                ledger.delete(&bucket, &key);
            } else {
                inner.cancel();
            }
        });
    }

    /// Keep issuing the bucket delete until the bucket is gone.
    pub fn announce_delete_bucket(
        self: &Arc<Self>,
        token: CancellationToken,
        interval: Duration,
        timeout: Duration,
        bucket: &str,
    ) {
        let done = deadline_token(&token, timeout);
        let inner = done.clone();
        let bucket = bucket.to_string();
        self.announce(done, interval, move |ledger| {
            if ledger.current_data().contains_key(&bucket) {
                ledger.delete_bucket(&bucket);
            } else {
                inner.cancel();
            }
        });
    }
}

/// A child token that is cancelled when the parent cancels or the
/// timeout elapses, whichever comes first.
fn deadline_token(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let child = parent.child_token();
    let sleeper = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => sleeper.cancel(),
            _ = sleeper.cancelled() => {}
        }
    });
    child
}

fn compress(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(bytes);
    encoder.finish().unwrap_or_default()
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}
