//! Settlement and verification substrate for a marketplace of agent and
//! robot jobs: hash-chained event streams, deterministic reducers and
//! validators, a transactional committer with optimistic concurrency, an
//! escrow engine with a declarative settlement policy, and an outbox-driven
//! worker pipeline for dispatch, proofs, artifacts, month close, retention,
//! and ordered deliveries.

pub mod api;
pub mod canonical;
pub mod chain;
pub mod delivery;
pub mod engine;
pub mod finance;
pub mod metrics;
pub mod model;
pub mod store;
pub mod validate;
pub mod workers;
