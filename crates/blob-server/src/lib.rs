//! Content-addressed blob server.
//!
//! Persists one JSON-encoded [`lazyfs_common::Entry`] per file in a
//! single directory, named by content hash. The in-memory indices
//! (`keydir`, `known_directories`) are derived data, rebuilt from that
//! directory at startup — the blobs on disk are the source of truth.

pub mod http_server;
mod store;

pub use store::{Store, StoreError};
