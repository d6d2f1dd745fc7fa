//! # searchsync-daemon
//!
//! Daemon binary and operator CLI for search-sync.
//!
//! The daemon wires storage, indexes and the outbox processor from
//! configuration ([`SearchSyncContext`]) and runs until signalled. The same
//! binary rebuilds indexes with the mass indexer and exposes admin and
//! ingest commands against the entity store.

pub mod cli;
pub mod commands;
pub mod context;

pub use cli::{AbortedCommands, AdminCommands, Cli, Commands, IngestCommands};
pub use commands::{
    handle_admin, handle_ingest, init_logging, load_settings, run_admin, run_ingest,
    run_mass_index, start_daemon, SettingsOverrides,
};
pub use context::SearchSyncContext;
