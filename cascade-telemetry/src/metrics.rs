use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Port of the metrics listener when none is configured.
pub const DEFAULT_METRICS_PORT: u16 = 9000;

/// Installs the global Prometheus recorder and serves `/metrics` on `port`.
///
/// Every series carries `queue` and `worker` labels so that several workers can be scraped
/// from one Prometheus job.
pub fn init_metrics(port: Option<u16>, queue: &str, worker: &str) -> Result<(), BuildError> {
    let address = SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        port.unwrap_or(DEFAULT_METRICS_PORT),
    );

    PrometheusBuilder::new()
        .with_http_listener(address)
        .add_global_label("queue", queue)
        .add_global_label("worker", worker)
        .install()
}
