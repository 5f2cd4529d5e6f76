//! Client core for a small file server: REST client, reachability probe, fallback cache and
//! the orchestrator keeping a file list in sync.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod file_info;
pub mod probe;
pub mod server;
pub mod sync;

pub use cache::{FallbackCache, FileStore, KeyValueStore, MemoryStore};
pub use client::FileClient;
pub use config::Config;
pub use error::{Error, Result};
pub use file_info::{FileListSnapshot, FileRecord};
pub use probe::{ProbeTarget, Prober, ServerEndpoint};
pub use sync::{ServerState, SnapshotSource, SyncOrchestrator, SyncView};
