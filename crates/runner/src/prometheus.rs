//! Prometheus exporter bootstrap.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{info, warn};

/// Environment variable naming the Prometheus exporter port.
pub const PROMETHEUS_PORT_ENV: &str = "TRAWLER_PROMETHEUS_PORT";

/// Reads the exporter port from the environment. Unset or unparsable means
/// no exporter.
pub fn port_from_env() -> Option<u16> {
    let raw = std::env::var(PROMETHEUS_PORT_ENV).ok()?;
    match raw.parse() {
        Ok(port) => Some(port),
        Err(err) => {
            warn!(target: "prometheus", %raw, %err, "ignoring unparsable prometheus port");
            None
        }
    }
}

/// Starts a Prometheus scrape endpoint on `port`, all interfaces.
pub fn init_prometheus_server(port: u16) -> Result<(), BuildError> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(target: "prometheus", %addr, "serving prometheus metrics");
    Ok(())
}
