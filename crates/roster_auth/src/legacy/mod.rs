//! The file-backed legacy registry.
//!
//! This is the storage generation that predates the member database. It stays
//! readable during the migration window: the token manager falls back to it
//! when the durable tier has nothing usable, and the migration coordinator
//! backfills the member database from its snapshot file.

mod snapshot;
mod store;

pub use snapshot::{
    FileSnapshotPersister, LegacyEntry, LegacySnapshot, RawSnapshot, SnapshotPersister,
    SNAPSHOT_VERSION,
};
pub use store::{ConsistencyViolation, LegacyIndexes, LegacyStore};
