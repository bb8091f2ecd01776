//! Protocol logic: node registry, relay resolution, the token guard protocol, chain
//! bookkeeping, connectivity and task distribution.
//!
//! Every operation works against a borrowed [`cstoken_core::store::Store`] and takes the
//! current time as an argument; nothing here performs I/O of its own.

pub mod chains;
pub mod connectivity;
pub mod life;
pub mod mutex;
pub mod registry;
pub mod resolver;
pub mod tasks;
