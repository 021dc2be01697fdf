//! Produce detection and ripeness job orchestration.
//!
//! Clients submit an image under an idempotency key and poll for the result.
//! Workers claim jobs through a compare-and-set ledger, call the remote
//! vision service, and record either a detection result or a classified
//! failure. Storage, ledger, inference and dispatch sit behind traits so the
//! orchestrator runs unchanged against R2/PostgreSQL/Redis or in memory.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
