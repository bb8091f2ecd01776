//! cstoken node: runtime state, event dispatch and the event loop shared by the
//! `cstoken-node` binary and the integration tests.

pub mod command;
pub mod config;
pub mod handler;
pub mod runtime;
pub mod state;
