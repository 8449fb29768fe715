//! Runner error taxonomy.

use metrics_exporter_prometheus::BuildError;
use thiserror::Error;
use trawler_ingest::IngestError;
use trawler_store::StoreError;

/// Errors terminating a pipeline run.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Ingestion failed.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// A store transaction failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The runner was configured without any data source.
    #[error("no data source configured")]
    NoDataSource,

    /// The Prometheus exporter failed to start.
    #[error("metrics exporter failed to start: {0}")]
    Exporter(#[from] BuildError),
}
