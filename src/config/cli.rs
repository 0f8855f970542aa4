use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::infra::db::DbBackend;

/// Command-line arguments for the Scriptorium binary.
#[derive(Debug, Parser)]
#[command(
    name = "scriptorium",
    version,
    about = "Blog content store: schema setup and cache warm-up"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SCRIPTORIUM_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Create the schema and seed data unless the database is already initialized.
    Setup,
    /// Report whether the database still needs its first-run setup.
    Status,
    /// Ensure the schema, then prefill the cached site aggregates.
    Warm,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Force a backend instead of detecting it from the URL scheme.
    #[arg(long = "database-backend", value_name = "BACKEND", global = true)]
    pub database_backend: Option<DbBackend>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT", global = true)]
    pub database_max_connections: Option<u32>,
}
