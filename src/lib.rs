// ABOUTME: Library root for table-replicator
// ABOUTME: Incremental table replication with chunked upserts and live progress events

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod postgres;
pub mod queue;
pub mod row;
pub mod schema;
pub mod server;
pub mod store;
pub mod sync;
pub mod utils;

pub use error::{Result, SyncError};
