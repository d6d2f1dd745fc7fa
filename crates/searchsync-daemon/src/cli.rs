//! CLI argument parsing for the search-sync daemon.
//!
//! Commands:
//! - start: Run the outbox processor until interrupted
//! - mass-index: Rebuild indexes from the entity store
//! - admin: Operator commands against the outbox
//! - ingest: Write or delete entities, recording outbox events

use clap::{Parser, Subcommand};

/// Search-sync daemon
#[derive(Parser, Debug)]
#[command(name = "searchsync")]
#[command(about = "Keeps search indexes in sync with an entity store")]
#[command(version)]
pub struct Cli {
    /// Path to config file (default: ~/.config/search-sync/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start polling the outbox and applying changes to the indexes
    Start {
        /// Override database path
        #[arg(long)]
        db_path: Option<String>,

        /// Override index root directory
        #[arg(long)]
        index_path: Option<String>,

        /// Override the instance identity
        #[arg(long)]
        instance_id: Option<String>,
    },

    /// Rebuild indexes from the entity store
    MassIndex {
        /// Override database path
        #[arg(long)]
        db_path: Option<String>,

        /// Override index root directory
        #[arg(long)]
        index_path: Option<String>,

        /// Entity types to index (repeatable; default: all configured)
        #[arg(long = "type", value_name = "TYPE")]
        types: Vec<String>,

        /// Continue from the checkpoint left by a cancelled run
        #[arg(long)]
        resume: bool,

        /// Keep existing documents instead of purging first
        #[arg(long)]
        no_purge: bool,
    },

    /// Administrative commands
    Admin {
        /// Override database path
        #[arg(long)]
        db_path: Option<String>,

        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Write entities through the outbox
    Ingest {
        /// Override database path
        #[arg(long)]
        db_path: Option<String>,

        #[command(subcommand)]
        command: IngestCommands,
    },
}

/// Admin subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum AdminCommands {
    /// Show entity and outbox statistics
    Stats,

    /// Inspect or recover events that exhausted their retries
    Aborted {
        #[command(subcommand)]
        command: AbortedCommands,
    },

    /// Show a single outbox event
    Event {
        /// Outbox event id
        id: u64,
    },

    /// Trigger RocksDB compaction
    Compact,
}

/// Operations on aborted outbox events
#[derive(Subcommand, Debug, Clone)]
pub enum AbortedCommands {
    /// Count aborted events
    Count {
        /// Restrict to one tenant
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Return aborted events to pending with a fresh retry budget
    Reprocess {
        /// Restrict to one tenant
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Delete aborted events
    Clear {
        /// Restrict to one tenant
        #[arg(long)]
        tenant: Option<String>,
    },
}

/// Ingest subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum IngestCommands {
    /// Create or update an entity
    Put {
        /// Entity type
        entity: String,

        /// Entity id
        id: String,

        /// Entity data as a JSON object
        data: String,

        /// Routing key for the indexed document
        #[arg(long)]
        routing: Option<String>,

        /// Owning tenant
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Delete an entity
    Delete {
        /// Entity type
        entity: String,

        /// Entity id
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_start() {
        let cli = Cli::parse_from(["searchsync", "start"]);
        assert!(matches!(cli.command, Commands::Start { .. }));
    }

    #[test]
    fn test_cli_start_with_overrides() {
        let cli = Cli::parse_from([
            "searchsync",
            "--log-level",
            "debug",
            "start",
            "--db-path",
            "/tmp/db",
            "--instance-id",
            "node-a",
        ]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Start {
                db_path,
                index_path,
                instance_id,
            } => {
                assert_eq!(db_path.as_deref(), Some("/tmp/db"));
                assert!(index_path.is_none());
                assert_eq!(instance_id.as_deref(), Some("node-a"));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_mass_index_types() {
        let cli = Cli::parse_from([
            "searchsync",
            "mass-index",
            "--type",
            "book",
            "--type",
            "author",
            "--resume",
        ]);
        match cli.command {
            Commands::MassIndex {
                types,
                resume,
                no_purge,
                ..
            } => {
                assert_eq!(types, vec!["book", "author"]);
                assert!(resume);
                assert!(!no_purge);
            }
            _ => panic!("Expected MassIndex command"),
        }
    }

    #[test]
    fn test_cli_admin_aborted_with_tenant() {
        let cli = Cli::parse_from([
            "searchsync",
            "admin",
            "aborted",
            "reprocess",
            "--tenant",
            "acme",
        ]);
        match cli.command {
            Commands::Admin { command, .. } => match command {
                AdminCommands::Aborted {
                    command: AbortedCommands::Reprocess { tenant },
                } => assert_eq!(tenant.as_deref(), Some("acme")),
                _ => panic!("Expected Aborted Reprocess"),
            },
            _ => panic!("Expected Admin command"),
        }
    }

    #[test]
    fn test_cli_ingest_put() {
        let cli = Cli::parse_from([
            "searchsync",
            "ingest",
            "put",
            "book",
            "42",
            r#"{"title":"Dune"}"#,
            "--routing",
            "shelf-1",
        ]);
        match cli.command {
            Commands::Ingest { command, .. } => match command {
                IngestCommands::Put {
                    entity,
                    id,
                    data,
                    routing,
                    tenant,
                } => {
                    assert_eq!(entity, "book");
                    assert_eq!(id, "42");
                    assert_eq!(data, r#"{"title":"Dune"}"#);
                    assert_eq!(routing.as_deref(), Some("shelf-1"));
                    assert!(tenant.is_none());
                }
                _ => panic!("Expected Put"),
            },
            _ => panic!("Expected Ingest command"),
        }
    }
}
