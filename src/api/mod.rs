pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::chain::ServerSigner;
use crate::metrics::Metrics;
use crate::store::{Store, outbox};
use crate::workers::{self, WorkerCtx};

use error::ApiError;
use rate_limit::RateLimiter;
use state::{AppState, PROTOCOL_CURRENT, PROTOCOL_MIN, ServerConfig};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/capabilities", get(capabilities))
        // Ingest
        .route("/ingest/proxy", post(handlers::ingest::proxy))
        // Jobs
        .route("/jobs", post(handlers::jobs::create))
        .route("/jobs/{id}", get(handlers::jobs::get_one))
        .route("/jobs/{id}/quote", post(handlers::jobs::quote))
        .route("/jobs/{id}/book", post(handlers::jobs::book))
        .route("/jobs/{id}/dispatch", post(handlers::jobs::dispatch))
        .route("/jobs/{id}/reschedule", post(handlers::jobs::reschedule))
        .route("/jobs/{id}/cancel", post(handlers::jobs::cancel))
        .route("/jobs/{id}/abort", post(handlers::jobs::abort))
        .route("/jobs/{id}/settle", post(handlers::jobs::settle))
        .route("/jobs/{id}/dispute/open", post(handlers::jobs::dispute_open))
        .route("/jobs/{id}/dispute/close", post(handlers::jobs::dispute_close))
        .route("/jobs/{id}/events", post(handlers::jobs::append_events))
        .route("/jobs/{id}/sla-credit", post(handlers::jobs::sla_credit))
        // Robots
        .route("/robots/register", post(handlers::robots::register))
        .route("/robots/{id}/events", post(handlers::robots::append_events))
        .route("/robots/{id}/availability", post(handlers::robots::availability))
        .route("/robots/{id}/status", post(handlers::robots::status))
        // Operators
        .route("/operators/register", post(handlers::operators::register))
        .route("/operators/{id}/shift", post(handlers::operators::shift))
        .route("/operators/{id}/status", post(handlers::operators::status))
        // Agents + runs
        .route("/agents/register", post(handlers::agents::register))
        .route("/agents/{id}/wallet", get(handlers::agents::wallet_get))
        .route("/agents/{id}/wallet/credit", post(handlers::agents::wallet_credit))
        .route("/agents/{id}/runs", post(handlers::agents::create_run))
        .route("/agents/{id}/runs/{run_id}/events", post(handlers::agents::run_event))
        // Run settlement surface
        .route("/runs/{id}/settlement/resolve", post(handlers::runs::settlement_resolve))
        .route("/runs/{id}/dispute/open", post(handlers::runs::dispute_open))
        .route("/runs/{id}/dispute/evidence", post(handlers::runs::dispute_evidence))
        .route("/runs/{id}/dispute/escalate", post(handlers::runs::dispute_escalate))
        .route("/runs/{id}/dispute/close", post(handlers::runs::dispute_close))
        .route("/runs/{id}/agreement/change-order", post(handlers::runs::change_order))
        .route("/runs/{id}/agreement/cancel", post(handlers::runs::agreement_cancel))
        // Marketplace
        .route(
            "/marketplace/tasks",
            get(handlers::marketplace::list_tasks).post(handlers::marketplace::create_task),
        )
        .route("/marketplace/tasks/{id}/bids", post(handlers::marketplace::place_bid))
        .route(
            "/marketplace/tasks/{id}/bids/{bid_id}/counter-offer",
            post(handlers::marketplace::counter_offer),
        )
        .route(
            "/marketplace/tasks/{id}/bids/{bid_id}/accept",
            post(handlers::marketplace::accept_bid),
        )
        .route(
            "/marketplace/settlement-policies",
            get(handlers::marketplace::get_settlement_policies)
                .post(handlers::marketplace::put_settlement_policy),
        )
        // Ops
        .route("/ops/month-close", post(handlers::ops::month_close))
        .route("/ops/month-close/reopen", post(handlers::ops::month_reopen))
        .route("/ops/signer-keys", post(handlers::ops::signer_keys))
        .route("/ops/governance/events", post(handlers::ops::governance_events))
        .route("/ops/destinations", post(handlers::ops::put_destination))
        .route("/ops/deliveries/{id}/requeue", post(handlers::ops::requeue_delivery))
        .route("/ops/maintenance", post(handlers::ops::maintenance))
        .route("/ops/contracts-v2", post(handlers::ops::contracts))
        // Exports
        .route("/exports/ack", post(handlers::exports::ack))
        .route("/evidence/download", get(handlers::exports::evidence_download))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::control_plane,
        ))
        .layer(cors)
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let conn = state.store.db.lock().await;
    let backlog = outbox::backlog(&conn)?;
    let dlq = outbox::dlq_depth(&conn)?;
    state.metrics.outbox_backlog.set(backlog);
    Ok(Json(json!({
        "ok": true,
        "outbox_backlog": backlog,
        "outbox_dlq": dlq,
    })))
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn capabilities(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "protocol": { "current": PROTOCOL_CURRENT, "min": PROTOCOL_MIN },
        "build": state.config.build,
        "workers": [
            "dispatch", "liveness", "assist", "robot-health", "accounting",
            "proof", "artifacts", "month-close", "retention", "delivery",
        ],
        "proof_gate_modes": ["strict", "holdback", "warn"],
    }))
}

/// Bring up the store, the worker fleet, and the HTTP listener; serve until
/// ctrl-c, then stop claiming work and drain.
pub async fn serve(host: &str, port: u16, config: ServerConfig, signer: ServerSigner) -> Result<()> {
    std::fs::create_dir_all(&config.worker.data_dir).context("creating data dir")?;
    let store = Store::open(&config.worker.data_dir.join("settld.db"))?;
    let metrics = Arc::new(Metrics::new());
    let signer = Arc::new(signer);

    let worker_ctx = WorkerCtx {
        store: store.clone(),
        signer: signer.clone(),
        metrics: metrics.clone(),
        transport: Arc::new(workers::delivery::HttpTransport::new()),
        config: Arc::new(config.worker.clone()),
    };
    let shutdown_tx = workers::spawn_all(worker_ctx);

    let state = AppState {
        store,
        signer,
        metrics,
        limiter: Arc::new(RateLimiter::new(600, 60)),
        config: Arc::new(config),
    };
    let app = router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "settld listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(());
            info!("shutdown: workers stopped claiming, draining");
        })
        .await
        .context("running server")?;
    Ok(())
}
