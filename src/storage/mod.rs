//! Storage layer for idswap
//!
//! A single SQLite journal holds mutations, settings, sessions and backup
//! metadata; an advisory lock keeps one process in charge of it.

pub mod backup;
pub mod journal;
pub mod lock;
pub mod migrations;

pub use backup::{BackupMethod, BackupRecord};
pub use journal::{
    CategoryStats, MutationEntry, MutationIntent, MutationJournal, MutationRecord,
    RegistryChange, RegistryChangeRecord, RegistryValue, Session, Settings, Statistics,
};
pub use lock::{InstanceLock, LockHolder};
