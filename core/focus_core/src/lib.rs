//! Focus tracking core: turns status observations into sessions, keeps per-day
//! aggregates consistent with them, and derives period metrics and core events.

pub mod aggregator;
pub mod config;
pub mod core_events;
pub mod daily;
pub mod db;
pub mod error;
pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod server;
