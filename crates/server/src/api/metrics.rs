//! Prometheus metrics recording.

use metrics::{counter, gauge};

/// Records a data-plane operation (`add` or `search`).
pub fn record_data_op(op: &str) {
    counter!("litevec_operations_total", "op" => op.to_string()).increment(1);
}

/// Records a redirect issued to a client, labelled by plane.
pub fn record_redirect(plane: &str) {
    counter!("litevec_redirects_total", "plane" => plane.to_string()).increment(1);
}

/// Records an ownership acquire served by this node as leader.
pub fn record_acquire() {
    counter!("litevec_acquires_total").increment(1);
}

/// Records a shard released from local state.
pub fn record_release() {
    counter!("litevec_releases_total").increment(1);
}

/// Records one shard moved by the balancer.
pub fn record_balance_move() {
    counter!("litevec_balance_moves_total").increment(1);
}

/// Updates the local shard count gauge.
pub fn update_shard_gauge(count: usize) {
    gauge!("litevec_local_shards").set(count as f64);
}
