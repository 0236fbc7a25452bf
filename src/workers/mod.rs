//! Background worker loops. Each worker exposes a `tick` that claims work
//! from the outbox (or scans projections) and drives state machines forward
//! through `commit_tx`. The loops here only control cadence and shutdown;
//! ticks are directly callable from tests.

pub mod accounting;
pub mod artifacts;
pub mod assist;
pub mod delivery;
pub mod dispatch;
pub mod health;
pub mod liveness;
pub mod month_close;
pub mod proof;
pub mod retention;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::warn;

use crate::chain::{Event, ServerSigner, create_event};
use crate::finance::AccountMapGate;
use crate::metrics::Metrics;
use crate::model::event::{Actor, EventBody};
use crate::store::Store;

#[derive(Clone)]
pub struct WorkerConfig {
    pub data_dir: PathBuf,
    pub account_map_gate: AccountMapGate,
    pub operator_policy_hash: String,
    pub allow_private_urls: bool,
    pub stall_after_ms_standard: u64,
    pub stall_after_ms_priority: u64,
    pub assist_timeout_ms: u64,
    pub ingest_retention_days: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            data_dir: PathBuf::from("./data"),
            account_map_gate: AccountMapGate::Strict,
            operator_policy_hash: String::new(),
            allow_private_urls: false,
            stall_after_ms_standard: 120_000,
            stall_after_ms_priority: 45_000,
            assist_timeout_ms: 5 * 60_000,
            ingest_retention_days: 30,
        }
    }
}

#[derive(Clone)]
pub struct WorkerCtx {
    pub store: Store,
    pub signer: Arc<ServerSigner>,
    pub metrics: Arc<Metrics>,
    pub transport: Arc<dyn delivery::DeliveryTransport>,
    pub config: Arc<WorkerConfig>,
}

/// Build a chain-linked, server-signed batch on top of the current head.
pub fn chain_events(
    stream_id: &str,
    mut head: Option<String>,
    bodies: Vec<(EventBody, Actor)>,
    at: DateTime<Utc>,
    signer: &ServerSigner,
) -> Result<Vec<Event>, crate::chain::ChainError> {
    let mut events = Vec::with_capacity(bodies.len());
    for (body, actor) in bodies {
        let mut event = create_event(stream_id, body, actor, at, head.take())?;
        signer.sign(&mut event);
        head = Some(event.chain_hash.clone());
        events.push(event);
    }
    Ok(events)
}

/// Spawn every worker loop. Returns the shutdown sender; send to stop the
/// loops claiming new work.
pub fn spawn_all(ctx: WorkerCtx) -> broadcast::Sender<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    spawn_loop(&ctx, &shutdown_tx, "dispatch", Duration::from_millis(500), |c| async move {
        dispatch::tick(&c, 16).await
    });
    spawn_loop(&ctx, &shutdown_tx, "liveness", Duration::from_secs(5), |c| async move {
        liveness::tick(&c).await
    });
    spawn_loop(&ctx, &shutdown_tx, "assist", Duration::from_secs(2), |c| async move {
        assist::tick(&c, 16).await
    });
    spawn_loop(&ctx, &shutdown_tx, "robot-health", Duration::from_secs(30), |c| async move {
        health::tick(&c).await
    });
    spawn_loop(&ctx, &shutdown_tx, "accounting", Duration::from_secs(2), |c| async move {
        accounting::tick(&c, 16).await
    });
    spawn_loop(&ctx, &shutdown_tx, "proof", Duration::from_secs(1), |c| async move {
        proof::tick(&c, 16).await
    });
    spawn_loop(&ctx, &shutdown_tx, "artifacts", Duration::from_secs(1), |c| async move {
        artifacts::tick(&c, 16).await
    });
    spawn_loop(&ctx, &shutdown_tx, "month-close", Duration::from_secs(10), |c| async move {
        month_close::tick(&c, 4).await
    });
    spawn_loop(&ctx, &shutdown_tx, "retention", Duration::from_secs(60), |c| async move {
        retention::tick(&c).await
    });
    spawn_loop(&ctx, &shutdown_tx, "delivery", Duration::from_millis(500), |c| async move {
        delivery::tick(&c, 16).await
    });

    shutdown_tx
}

fn spawn_loop<F, Fut>(
    ctx: &WorkerCtx,
    shutdown_tx: &broadcast::Sender<()>,
    name: &'static str,
    cadence: Duration,
    tick: F,
) where
    F: Fn(WorkerCtx) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<usize>> + Send,
{
    let ctx = ctx.clone();
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = tick(ctx.clone()).await {
                        warn!(worker = name, error = %format!("{e:#}"), "worker tick failed");
                    }
                }
            }
        }
    });
}
