//! Core data model for the edgevpn overlay: hash-chained blocks, the
//! replicated ledger with its announce engine, block stores, wire
//! types and the connection token.

pub mod block;
pub mod data;
pub mod ledger;
pub mod store;
pub mod ticker;
pub mod token;
pub mod types;
pub mod utils;

pub use block::Block;
pub use data::Data;
pub use ledger::Ledger;
pub use store::{DiskStore, MemoryStore, Store};

/// Errors surfaced by the core crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("decode block: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("block store: {0}")]
    Store(#[from] sled::Error),
}
