use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::{debug, warn};

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Handle of the process-wide Prometheus recorder, installed on first use.
///
/// `None` if another recorder was installed first.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                debug!("Prometheus recorder installed");
                Some(handle)
            }
            Err(err) => {
                warn!(%err, "Prometheus recorder not installed, metrics endpoint will be empty");
                None
            }
        })
        .as_ref()
}

/// Renders the Prometheus text exposition served on `/metrics`
#[must_use]
pub fn render() -> String {
    prometheus_handle().map(PrometheusHandle::render).unwrap_or_default()
}
