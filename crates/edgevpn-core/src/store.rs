//! Block stores. The in-memory store keeps only the head (all any
//! node needs to participate); the sled-backed store additionally
//! survives restarts, which keeps trust-zone state visible across a
//! node bounce.

use std::path::Path;
use std::sync::Mutex;

use crate::block::Block;

/// Storage backend for the chain head.
pub trait Store: Send + Sync {
    fn add(&self, block: Block);
    /// Reported length is the latest index, so a fresh store with only
    /// the genesis block reports 0.
    fn len(&self) -> u64;
    fn last(&self) -> Option<Block>;
}

/// Single-slot store keeping only the latest block.
#[derive(Default)]
pub struct MemoryStore {
    block: Mutex<Option<Block>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn add(&self, block: Block) {
        *self.block.lock().unwrap() = Some(block);
    }

    fn len(&self) -> u64 {
        self.block
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.index)
            .unwrap_or(0)
    }

    fn last(&self) -> Option<Block> {
        self.block.lock().unwrap().clone()
    }
}

/// sled-backed store persisting every adopted block keyed by index.
pub struct DiskStore {
    tree: sled::Db,
}

impl DiskStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        Ok(Self {
            tree: sled::open(path)?,
        })
    }
}

impl Store for DiskStore {
    fn add(&self, block: Block) {
        let Ok(bytes) = serde_json::to_vec(&block) else {
            return;
        };
        let _ = self.tree.insert(block.index.to_be_bytes(), bytes);
        let _ = self.tree.flush();
    }

    fn len(&self) -> u64 {
        self.last().map(|b| b.index).unwrap_or(0)
    }

    fn last(&self) -> Option<Block> {
        let (_, bytes) = self.tree.last().ok().flatten()?;
        serde_json::from_slice(&bytes).ok()
    }
}
