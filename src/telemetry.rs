//! Prometheus metrics for queries, write-back and the write fanout.
//!
//! Counters are recorded through the `metrics` facade everywhere; until
//! [`install`] runs they go to the no-op recorder.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const QUERIES_STARTED: &str = "proxy_queries_started_total";
pub const QUERIES_CLOSED: &str = "proxy_queries_closed_total";
pub const QUERY_EVENTS: &str = "proxy_query_events_total";
pub const PRODUCER_PANICS: &str = "proxy_producer_panics_total";
pub const WRITE_BACKS: &str = "proxy_write_backs_total";
pub const PUBLISHES: &str = "proxy_publishes_total";
pub const ACCESS_DENIED: &str = "proxy_access_denied_total";

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder for this process. Later calls reuse the
/// first handle.
pub fn install() -> &'static PrometheusHandle {
    HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if let Err(e) = metrics::set_boxed_recorder(Box::new(recorder)) {
            tracing::warn!(error = %e, "another metrics recorder is installed");
        }
        describe();
        handle
    })
}

/// Prometheus text exposition of every recorded metric.
pub fn render() -> String {
    match HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# metrics not initialized\n".to_string(),
    }
}

fn describe() {
    metrics::describe_counter!(QUERIES_STARTED, "Merged queries started");
    metrics::describe_counter!(QUERIES_CLOSED, "Merged queries closed, by outcome (complete or expired)");
    metrics::describe_counter!(QUERY_EVENTS, "Events emitted to query callers, by source (local or upstream)");
    metrics::describe_counter!(PRODUCER_PANICS, "Query producers that panicked, by producer");
    metrics::describe_counter!(WRITE_BACKS, "Upstream events written back to the local cache, by result");
    metrics::describe_counter!(PUBLISHES, "Publish attempts per write relay, by result");
    metrics::describe_counter!(ACCESS_DENIED, "Rejected reads and writes, by operation");
    metrics::gauge!("proxy_up", 1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_reusable_and_renders_counters() {
        let first: *const PrometheusHandle = install();
        let second: *const PrometheusHandle = install();
        assert_eq!(first, second);
        metrics::increment_counter!(QUERIES_STARTED);
        let text = render();
        assert!(text.contains(QUERIES_STARTED), "{text}");
        assert!(text.contains("proxy_up 1"), "{text}");
    }
}
