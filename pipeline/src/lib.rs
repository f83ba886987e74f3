//! Telemetry ingestion and rule evaluation pipeline.
//!
//! Inbound payloads are validated against the device/metric registry, bulk
//! inserted with conflict-ignore semantics, and every created row is run
//! through the active rules of its device-metric; triggered rules record
//! events and hand notification off to an asynchronous delivery queue.

pub mod condition;
pub mod dispatch;
pub mod errors;
pub mod evaluator;
pub mod metrics;
pub mod model;
pub mod processor;
pub mod rest;
pub mod store;
pub mod validate;
