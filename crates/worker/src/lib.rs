//! Worker side of lazyfs: the on-demand FUSE filesystem, the blob
//! client feeding it, and the control-plane HTTP server that triggers
//! container runs against the mounted tree.

pub mod client;
pub mod database;
pub mod fuse;
pub mod http_server;
pub mod process;
pub mod runc;
pub mod script;
pub mod stats;
