//! Types shared between the blob server and the worker filesystem.
//!
//! The wire format, the on-disk blob format, and the content-address
//! rule all live here so the two sides cannot drift apart.

mod entry;

pub use entry::{content_hash, Entry, SyncEntry, SyncResponse};
