//! Infrastructure layer for configuration, logging and local persistence
//!
//! The crawl engine never touches files directly; it goes through the
//! `KeyValueStore` seam defined here.

pub mod config; // Configuration loading and defaults
pub mod logging; // Logging infrastructure
pub mod storage; // Key-value persistence for checkpoint and crawl-run records

// Re-export commonly used items
pub use self::config::{ConfigManager, HarvestConfig};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
