//! Pipeline orchestration for trawler.
//!
//! A [`Runner`] wires data sources (archive, live chain) to a store and
//! drives a work plan through them: archive ingestion first, then finalized
//! ingestion from the live chain, then hot ingestion with reorg handling.
//! Progress is exposed through the `metrics` facade and an optional
//! Prometheus scrape endpoint.

mod error;
pub use error::RunnerError;

mod metrics;

mod prometheus;
pub use prometheus::{PROMETHEUS_PORT_ENV, init_prometheus_server, port_from_env};

mod runner;
pub use runner::{BatchHandler, Runner};
