//! Event transport and persistence for cstoken nodes.
//!
//! - [`bus`]: the publish/subscribe capability and publish backoff
//! - [`memory_bus`]: in-process bus for single-process deployments and tests
//! - [`swarm`]: libp2p GossipSub bus across processes
//! - [`file_store`]: JSON-snapshot store on disk

pub mod bus;
pub mod file_store;
pub mod memory_bus;
pub mod swarm;
pub mod transport;
