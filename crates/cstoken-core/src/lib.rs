//! Shared vocabulary of the cstoken network: addresses, records, events and the store seam.

pub mod canonical;
pub mod event;
pub mod records;
pub mod store;
pub mod types;

pub use types::constants;
