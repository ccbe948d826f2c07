/// Prometheus metrics for the PDS
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Repo write operations by action (create/update/delete)
    pub static ref REPO_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "meridian_repo_operations_total",
        "Repository write operations applied",
        &["action"]
    )
    .expect("metric registration");

    /// Events handed to the persister, by message type
    pub static ref EVENTS_SEQUENCED: IntCounterVec = register_int_counter_vec!(
        "meridian_events_sequenced_total",
        "Events assigned a sequence number",
        &["type"]
    )
    .expect("metric registration");

    /// Currently connected firehose subscribers
    pub static ref FIREHOSE_SUBSCRIBERS: IntGauge = register_int_gauge!(
        "meridian_firehose_subscribers",
        "Connected subscribeRepos consumers"
    )
    .expect("metric registration");

    /// Frames written to firehose sockets, by message type
    pub static ref FIREHOSE_FRAMES_SENT: IntCounterVec = register_int_counter_vec!(
        "meridian_firehose_frames_sent_total",
        "Frames sent to subscribeRepos consumers",
        &["type"]
    )
    .expect("metric registration");
}

/// Render the default registry in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        REPO_OPERATIONS.with_label_values(&["create"]).inc();
        FIREHOSE_SUBSCRIBERS.set(2);
        let text = render();
        assert!(text.contains("meridian_repo_operations_total"));
    }
}
