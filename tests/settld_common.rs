#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use settld::chain::{ServerSigner, generate_signing_key};
use settld::metrics::Metrics;
use settld::model::event::{
    Actor, Booking, EventBody, Quote, Reservation, SignerOwnerKind, TimeWindow,
};
use settld::model::governance::{DEFAULT_TENANT_ID, GOVERNANCE_STREAM};
use settld::store::commit::{Op, commit_tx};
use settld::store::{self, Store};
use settld::workers::delivery::MockTransport;
use settld::workers::{WorkerConfig, WorkerCtx, chain_events};

pub const TENANT: &str = "t1";
pub const SERVER_KEY_ID: &str = "srvkey_current";

pub struct TestEnv {
    pub ctx: WorkerCtx,
    pub store: Store,
    pub signer: Arc<ServerSigner>,
    pub transport: Arc<MockTransport>,
}

pub async fn env() -> TestEnv {
    env_with_transport(MockTransport::new(0)).await
}

pub async fn env_with_transport(transport: Arc<MockTransport>) -> TestEnv {
    let store = Store::open_in_memory().expect("in-memory store");
    let (key, public) = generate_signing_key();
    let signer = Arc::new(ServerSigner {
        key_id: SERVER_KEY_ID.to_string(),
        key,
    });

    // The server key lives in the global governance stream so the signature
    // policy can resolve it.
    {
        let mut conn = store.db.lock().await;
        let events = chain_events(
            GOVERNANCE_STREAM,
            None,
            vec![(
                EventBody::SignerKeyRegistered {
                    key_id: SERVER_KEY_ID.to_string(),
                    public_key: public,
                    owner_kind: SignerOwnerKind::Server,
                    owner_id: None,
                },
                Actor::System,
            )],
            now(),
            &signer,
        )
        .expect("governance events");
        commit_tx(
            &mut conn,
            DEFAULT_TENANT_ID,
            vec![Op::GovernanceEventsAppend { events }],
            None,
        )
        .expect("seed server key");
    }

    let data_dir = std::env::temp_dir().join(format!("settld-test-{}", uuid_suffix()));
    let ctx = WorkerCtx {
        store: store.clone(),
        signer: signer.clone(),
        metrics: Arc::new(Metrics::new()),
        transport: transport.clone(),
        config: Arc::new(WorkerConfig {
            data_dir,
            account_map_gate: settld::finance::AccountMapGate::Warn,
            ..WorkerConfig::default()
        }),
    };
    TestEnv {
        ctx,
        store,
        signer,
        transport,
    }
}

fn uuid_suffix() -> String {
    settld::chain::sha256_hex(format!("{:?}", std::time::Instant::now()).as_bytes())
        .chars()
        .take(12)
        .collect()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn window() -> TimeWindow {
    TimeWindow {
        start: Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap(),
    }
}

pub const JOB_AMOUNT_CENTS: i64 = 50_000;
pub const POLICY_HASH: &str = "pol_hash_1";

pub fn created_body(customer: &str) -> EventBody {
    EventBody::JobCreated {
        template_id: "tmpl_patrol".to_string(),
        customer_id: customer.to_string(),
        site_id: "site_1".to_string(),
        zone: "z1".to_string(),
        tier: "standard".to_string(),
        privacy_mode: "standard".to_string(),
        coverage_required: false,
    }
}

pub fn quote_body(quote_id: &str) -> EventBody {
    EventBody::JobQuoted(Quote {
        quote_id: quote_id.to_string(),
        env: "ENV_OUTDOOR_GUIDED".to_string(),
        window: window(),
        amount_cents: JOB_AMOUNT_CENTS,
        currency: "USD".to_string(),
    })
}

pub fn booking_body(quote_id: &str) -> EventBody {
    EventBody::JobBooked(Booking {
        booking_id: "bkg_1".to_string(),
        quote_id: quote_id.to_string(),
        contract_id: "ctr_1".to_string(),
        policy_hash: POLICY_HASH.to_string(),
        window: window(),
        amount_cents: JOB_AMOUNT_CENTS,
        currency: "USD".to_string(),
        tier: "standard".to_string(),
        coverage_required: false,
        payer_agent_id: "agent_payer".to_string(),
        payee_agent_id: "agent_payee".to_string(),
        credit_policy: None,
    })
}

/// Append server-signed job events through the committer.
pub async fn append_job(env: &TestEnv, job_id: &str, bodies: Vec<(EventBody, Actor)>) {
    let mut conn = env.store.db.lock().await;
    let stream_id = format!("job:{job_id}");
    let head = store::stream_head(&conn, TENANT, &stream_id).expect("head");
    let events = chain_events(&stream_id, head, bodies, now(), &env.signer).expect("chain");
    commit_tx(
        &mut conn,
        TENANT,
        vec![Op::JobEventsAppend {
            job_id: job_id.to_string(),
            events,
        }],
        None,
    )
    .expect("commit job events");
}

pub async fn seed_booked_job(env: &TestEnv, job_id: &str) {
    append_job(
        env,
        job_id,
        vec![
            (created_body("cust_1"), Actor::Requester("cust_1".into())),
            (quote_body("qt_1"), Actor::Pricing),
            (booking_body("qt_1"), Actor::Requester("cust_1".into())),
        ],
    )
    .await;
}

pub async fn seed_robot(env: &TestEnv, robot_id: &str, trust: i64) {
    let mut conn = env.store.db.lock().await;
    let stream_id = format!("robot:{robot_id}");
    let events = chain_events(
        &stream_id,
        None,
        vec![
            (
                EventBody::RobotRegistered {
                    robot_id: robot_id.to_string(),
                    zone: "z1".to_string(),
                    signer_key_id: format!("robokey_{robot_id}"),
                    public_key: "unused".to_string(),
                    trust_score: trust,
                },
                Actor::System,
            ),
            (
                EventBody::RobotAvailabilitySet {
                    available: true,
                    window: None,
                },
                Actor::System,
            ),
        ],
        now(),
        &env.signer,
    )
    .expect("robot events");
    commit_tx(
        &mut conn,
        TENANT,
        vec![Op::RobotEventsAppend {
            robot_id: robot_id.to_string(),
            events,
        }],
        None,
    )
    .expect("seed robot");
}

/// Drive a booked job through reservation and execution to COMPLETED, with a
/// full-coverage report for its zone.
pub async fn drive_to_completed(env: &TestEnv, job_id: &str, robot_id: &str) {
    let res = Reservation {
        reservation_id: format!("rsv_{job_id}"),
        robot_id: robot_id.to_string(),
        window: window(),
    };
    append_job(
        env,
        job_id,
        vec![
            (
                EventBody::JobMatched {
                    robot_id: robot_id.to_string(),
                    operator_id: None,
                },
                Actor::Dispatch,
            ),
            (EventBody::JobReserved(res), Actor::Dispatch),
            (
                EventBody::DispatchConfirmed {
                    robot_id: robot_id.to_string(),
                    operator_id: None,
                },
                Actor::Dispatch,
            ),
            (
                EventBody::JobEnRoute {
                    robot_id: robot_id.to_string(),
                    eta: now(),
                },
                Actor::System,
            ),
            (
                EventBody::JobAccessGranted {
                    robot_id: robot_id.to_string(),
                    method: "keypad".to_string(),
                },
                Actor::System,
            ),
            (
                EventBody::JobExecutionStarted {
                    robot_id: robot_id.to_string(),
                },
                Actor::System,
            ),
            (
                EventBody::ZoneCoverageReported {
                    zone: "z1".to_string(),
                    coverage_pct: 100,
                    covered_at: now(),
                },
                Actor::System,
            ),
            (
                EventBody::JobExecutionCompleted {
                    robot_id: robot_id.to_string(),
                    completed_at: now(),
                },
                Actor::System,
            ),
        ],
    )
    .await;
}

/// Fund an agent wallet via the engine-grade ops.
pub async fn seed_wallet(env: &TestEnv, agent_id: &str, cents: i64) {
    use settld::model::wallet::{self, AgentWallet, LedgerProjection};
    let mut conn = env.store.db.lock().await;
    let mut w = AgentWallet::new(agent_id, "USD", now());
    let mut ledger = LedgerProjection::default();
    if cents > 0 {
        wallet::credit(&mut w, &mut ledger, cents, now()).expect("credit");
    }
    let mut ops = vec![Op::AgentWalletUpsert { wallet: w }];
    for posting in ledger.postings {
        ops.push(Op::LedgerPost { posting });
    }
    commit_tx(&mut conn, TENANT, ops, None).expect("seed wallet");
}
