use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tidewater", version, about = "Checkpointed warehouse-to-store refresh service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server, continuation workers and scheduler (default if no subcommand given).
    Serve {
        #[arg(long, env = "TIDEWATER_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "TIDEWATER_PORT", default_value = "8000")]
        port: u16,
    },

    /// Create the bookkeeping tables (refresh config, checkpoints, audit log, webhooks).
    Migrate {
        /// Postgres URL override (else TIDEWATER_DATABASE_URL / DATABASE_URL).
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Refresh every enabled table once, including continuations, then exit.
    RunAll {
        /// Ignore the minimum inter-refresh interval.
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration (redacted secrets).
    Config,
}
