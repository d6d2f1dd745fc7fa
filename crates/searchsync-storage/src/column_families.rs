//! Column family definitions for RocksDB.
//!
//! - entities: system-of-record rows, one per entity
//! - outbox: durable change events awaiting processing
//! - members: processor heartbeats for dynamic sharding
//! - checkpoints: resume cursors for bulk jobs

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for entity rows
pub const CF_ENTITIES: &str = "entities";

/// Column family name for outbox events
pub const CF_OUTBOX: &str = "outbox";

/// Column family name for processor membership heartbeats
pub const CF_MEMBERS: &str = "members";

/// Column family name for job checkpoints
pub const CF_CHECKPOINTS: &str = "checkpoints";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_ENTITIES, CF_OUTBOX, CF_MEMBERS, CF_CHECKPOINTS];

fn entities_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Outbox rows are rewritten and deleted, not appended; FIFO compaction must not be used.
fn outbox_options() -> Options {
    let mut opts = Options::default();
    opts.set_compaction_style(rocksdb::DBCompactionStyle::Level);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_ENTITIES, entities_options()),
        ColumnFamilyDescriptor::new(CF_OUTBOX, outbox_options()),
        ColumnFamilyDescriptor::new(CF_MEMBERS, Options::default()),
        ColumnFamilyDescriptor::new(CF_CHECKPOINTS, Options::default()),
    ]
}
