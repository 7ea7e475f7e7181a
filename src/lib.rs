//! Keeps a live registry of cache nodes in sync with a discovery source and
//! fans purge requests out to all of them.

pub mod broadcast;
pub mod config;
pub mod discovery;
pub mod error;
pub mod purge;
pub mod registry;
pub mod server;
pub mod sync;
pub mod types;
