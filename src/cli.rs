use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Settlement substrate for agent/robot marketplaces — event core, escrow
/// engine, and worker pipeline.
#[derive(Parser)]
#[command(name = "settld", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP server and the worker fleet
    Serve {
        /// Bind host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Bind port
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory (sqlite db, finance packs, evidence objects)
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// Base64 Ed25519 server signing key (generated with `keygen`);
        /// defaults to the SETTLD_SIGNING_KEY env var, else an ephemeral key
        #[arg(long)]
        signing_key: Option<String>,

        /// Shared secret for /ingest/proxy
        #[arg(long)]
        ingest_token: Option<String>,

        /// Reject requests without an x-settld-protocol header
        #[arg(long)]
        protocol_required: bool,
    },

    /// Run one retention + reconcile pass and exit (0 on success, 1 on error)
    Maintain {
        /// Data directory
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },

    /// Mint an Ed25519 signer keypair and print both halves
    Keygen,
}
