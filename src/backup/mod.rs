//! Backup module
//!
//! Checksummed snapshots of configuration resources, taken before every write.

pub mod store;

pub use store::{checksum, BackupStore, ConfigBackup, PruneReport};
