//! Durable storage under the data directory.

pub mod atomic;
pub mod config;
pub mod keyed_lock;
pub mod knowledge_store;
pub mod paths;
pub mod run_store;
