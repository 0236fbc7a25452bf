use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use settld::api;
use settld::api::state::ServerConfig;
use settld::chain::{
    ServerSigner, decode_signing_key, encode_public_key, encode_signing_key, generate_signing_key,
};
use settld::engine::settle::reconcile_wallets;
use settld::metrics::Metrics;
use settld::store::Store;
use settld::workers::{self, WorkerConfig, WorkerCtx};

mod cli;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Serve {
            host,
            port,
            data_dir,
            signing_key,
            ingest_token,
            protocol_required,
        } => {
            let signer = resolve_signer(signing_key)?;
            let config = ServerConfig {
                ingest_token: ingest_token.or_else(|| std::env::var("SETTLD_INGEST_TOKEN").ok()),
                protocol_required,
                presign_secret: std::env::var("SETTLD_PRESIGN_SECRET")
                    .unwrap_or_else(|_| "dev-presign-secret".to_string()),
                worker: WorkerConfig {
                    data_dir,
                    allow_private_urls: std::env::var("SETTLD_ALLOW_PRIVATE_URLS").is_ok(),
                    ..WorkerConfig::default()
                },
                ..ServerConfig::default()
            };
            let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
            rt.block_on(api::serve(&host, port, config, signer))
        }

        cli::Command::Maintain { data_dir } => {
            let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
            rt.block_on(async move {
                let store = Store::open(&data_dir.join("settld.db"))?;
                let (key, _) = generate_signing_key();
                let ctx = WorkerCtx {
                    store: store.clone(),
                    signer: Arc::new(ServerSigner {
                        key_id: "maintenance".to_string(),
                        key,
                    }),
                    metrics: Arc::new(Metrics::new()),
                    transport: Arc::new(workers::delivery::HttpTransport::new()),
                    config: Arc::new(WorkerConfig {
                        data_dir,
                        ..WorkerConfig::default()
                    }),
                };

                let purged = workers::retention::tick(&ctx).await?;
                let checked = {
                    let conn = store.db.lock().await;
                    reconcile_wallets(&conn)?
                };
                info!(purged, wallets_checked = checked, "maintenance pass complete");
                Ok::<(), anyhow::Error>(())
            })
            .map_err(|e| {
                // Exit 1 on fatal retention or reconcile errors.
                eprintln!("maintenance failed: {e:#}");
                std::process::exit(1);
            })
        }

        cli::Command::Keygen => {
            let (key, public) = generate_signing_key();
            println!("signing_key: {}", encode_signing_key(&key));
            println!("public_key:  {public}");
            Ok(())
        }
    }
}

fn resolve_signer(flag: Option<String>) -> Result<ServerSigner> {
    let key = match flag.or_else(|| std::env::var("SETTLD_SIGNING_KEY").ok()) {
        Some(b64) => decode_signing_key(&b64).context("decoding SETTLD_SIGNING_KEY")?,
        None => {
            let (key, _) = generate_signing_key();
            info!("no signing key configured; using an ephemeral key");
            key
        }
    };
    info!(public_key = %encode_public_key(&key.verifying_key()), "server signer ready");
    Ok(ServerSigner {
        key_id: "srvkey_current".to_string(),
        key,
    })
}
