//! Transport layer of the overlay: the libp2p swarm event loop, the
//! rotating-topic gossip hub, rendezvous discovery and the stream
//! manager that bounds per-peer open streams.

pub mod discovery;
pub mod hub;
pub mod manager;
pub mod message;

mod decay;
mod swarm;

pub use decay::{BumpFn, DecayError, DecayFn, DecayOutcome, DecayerConfig, DecayingTag};
pub use hub::TopicSchedule;
pub use manager::{Manager, ManagerConfig, SharedStream, TagInfo};
pub use message::{Annotations, Message};
pub use swarm::{NodeSwarm, SwarmCommand, SwarmConfig, SwarmEvent};
