//! Prometheus metrics recording and endpoint.
//!
//! Recording functions compile to no-ops without the `metrics` feature.

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
#[cfg(feature = "metrics")]
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))
}

/// Current size of the connection registry.
pub fn set_connected_nodes(count: usize) {
    #[cfg(feature = "metrics")]
    {
        metrics::gauge!("nodegate_connected_nodes").set(count as f64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record an inbound frame by wire type.
pub fn record_frame(kind: &str) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("type", kind.to_string())];
        metrics::counter!("nodegate_frames_total", &labels).increment(1);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

/// Record a command reaching a final status.
pub fn record_command(status: &str) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("status", status.to_string())];
        metrics::counter!("nodegate_commands_total", &labels).increment(1);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = status;
}

pub fn record_eviction() {
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("nodegate_heartbeat_evictions_total").increment(1);
    }
}

/// Record a rejected upgrade, by reason (`auth`, `rate_limit`).
pub fn record_rejected_upgrade(reason: &str) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("reason", reason.to_string())];
        metrics::counter!("nodegate_rejected_upgrades_total", &labels).increment(1);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = reason;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        // The metrics crate falls back to a no-op recorder
        set_connected_nodes(3);
        record_frame("heartbeat");
        record_command("successful");
        record_eviction();
        record_rejected_upgrade("auth");
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_install_prometheus_recorder() {
        // Can only install once per process
        let handle = install_prometheus_recorder().unwrap();
        record_eviction();
        let output = handle.render();
        assert!(output.contains("nodegate_heartbeat_evictions_total"));
    }
}
