//! Hash-chained ledger blocks. Every block snapshots the whole
//! two-level storage map; adoption only ever compares indexes, so the
//! checksum string form below is the one thing that must stay stable
//! across implementations.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::Data;

/// The two-level bucket → key → value map carried by every block.
pub type Storage = BTreeMap<String, BTreeMap<String, Data>>;

/// One snapshot of the entire ledger storage, chained to its
/// predecessor by hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "Index")]
    pub index: u64,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "Storage")]
    pub storage: Storage,
    #[serde(rename = "Hash")]
    pub hash: String,
    #[serde(rename = "PrevHash")]
    pub prev_hash: String,
}

impl Block {
    /// The genesis block: index 0, empty storage, no predecessor. Its
    /// hash is the checksum of the all-default block.
    pub fn genesis() -> Block {
        let seed = Block::default();
        Block {
            index: 0,
            timestamp: Utc::now().to_string(),
            storage: Storage::new(),
            hash: seed.checksum(),
            prev_hash: String::new(),
        }
    }

    /// Build the successor of `self` carrying `storage`.
    pub fn next(&self, storage: Storage) -> Block {
        let mut block = Block {
            index: self.index + 1,
            timestamp: Utc::now().to_string(),
            storage,
            hash: String::new(),
            prev_hash: self.hash.clone(),
        };
        block.hash = block.checksum();
        block
    }

    /// Whether `self` is a valid successor of `prev`.
    pub fn is_valid_successor(&self, prev: &Block) -> bool {
        prev.index + 1 == self.index
            && prev.hash == self.prev_hash
            && self.checksum() == self.hash
    }

    /// SHA-256 over the printed record, hex-encoded.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.record().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// The exact byte sequence fed to the checksum. Keys print in
    /// ascending order, entries space-separated, an empty map prints
    /// as `map[]`. Interop tests pin this form.
    fn record(&self) -> String {
        format!(
            "{}{}{}{}",
            self.index,
            self.timestamp,
            fmt_storage(&self.storage),
            self.prev_hash
        )
    }
}

fn fmt_storage(storage: &Storage) -> String {
    let entries: Vec<String> = storage
        .iter()
        .map(|(bucket, keys)| format!("{}:{}", bucket, fmt_bucket(keys)))
        .collect();
    format!("map[{}]", entries.join(" "))
}

fn fmt_bucket(bucket: &BTreeMap<String, Data>) -> String {
    let entries: Vec<String> = bucket
        .iter()
        .map(|(key, value)| format!("{}:{}", key, value.as_str()))
        .collect();
    format!("map[{}]", entries.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(index: u64, timestamp: &str, prev_hash: &str) -> Block {
        Block {
            index,
            timestamp: timestamp.into(),
            storage: Storage::new(),
            hash: String::new(),
            prev_hash: prev_hash.into(),
        }
    }

    #[test]
    fn checksum_pins_the_record_form() {
        // record = "0" + "t0" + "map[]" + "" = "0t0map[]"
        let block = bare(0, "t0", "");
        let mut hasher = Sha256::new();
        hasher.update(b"0t0map[]");
        assert_eq!(block.checksum(), hex::encode(hasher.finalize()));
    }

    #[test]
    fn record_sorts_buckets_and_keys() {
        let mut block = bare(3, "t", "p");
        let mut b = BTreeMap::new();
        b.insert("zk".to_string(), Data::from("zv"));
        b.insert("ak".to_string(), Data::from("av"));
        block.storage.insert("beta".to_string(), b);
        block
            .storage
            .insert("alpha".to_string(), BTreeMap::new());
        assert_eq!(
            block.record(),
            "3tmap[alpha:map[] beta:map[ak:av zk:zv]]p"
        );
    }

    #[test]
    fn successor_is_valid() {
        let genesis = Block::genesis();
        let next = genesis.next(Storage::new());
        assert_eq!(next.index, 1);
        assert_eq!(next.prev_hash, genesis.hash);
        assert!(next.is_valid_successor(&genesis));
    }

    #[test]
    fn tampered_successor_is_invalid() {
        let genesis = Block::genesis();
        let mut next = genesis.next(Storage::new());
        next.index = 5;
        assert!(!next.is_valid_successor(&genesis));
    }

    #[test]
    fn json_field_names_match_the_wire() {
        let block = bare(1, "t", "p");
        let json = serde_json::to_value(&block).unwrap();
        for field in ["Index", "Timestamp", "Storage", "Hash", "PrevHash"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }
}
