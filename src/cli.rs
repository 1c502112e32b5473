use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

/// keypool: quota-aware API key pool proxy
#[derive(Parser)]
#[command(name = "keypool", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy server
    Serve {
        /// Port to bind (overrides KEYPOOL_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage pooled credentials
    Credential {
        #[command(subcommand)]
        command: CredentialCommands,
    },
}

#[derive(Subcommand)]
pub enum CredentialCommands {
    /// Add an upstream API key to the pool
    Add {
        #[arg(long)]
        secret: String,
        /// Quota per period; omitted or <= 0 uses KEYPOOL_DEFAULT_QUOTA
        #[arg(long)]
        quota_limit: Option<i64>,
        /// End of the current quota period (RFC 3339); defaults to one month from now
        #[arg(long)]
        refreshes_at: Option<DateTime<Utc>>,
    },
    /// List credentials with masked secrets
    List,
    /// Remove a credential
    Delete {
        #[arg(long)]
        id: Uuid,
    },
    /// Probe the upstream and reconcile quota and status
    Refresh {
        /// Refresh a single credential; all credentials when omitted
        #[arg(long)]
        id: Option<Uuid>,
    },
}
