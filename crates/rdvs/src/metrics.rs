//! Metric names and helpers. Values are recorded through the `metrics`
//! facade and rendered by the Prometheus recorder installed in [`crate::http`].

/// Connection and room gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("rdv_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("rdv_connections_active").decrement(1.0);
    }

    /// Set the number of live rooms.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_rooms_active(count: usize) {
        metrics::gauge!("rdv_rooms_active").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Increment the relayed-signals counter for the given signal type.
    pub fn messages_relayed_total(kind: &'static str) {
        metrics::counter!("rdv_messages_relayed_total", "kind" => kind).increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("rdv_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Count one presence broadcast.
    pub fn presence_updates_total() {
        metrics::counter!("rdv_presence_updates_total").increment(1);
    }

    /// Count a socket turned away before it became a client.
    pub fn connections_rejected_total(reason: &'static str) {
        metrics::counter!("rdv_connections_rejected_total", "reason" => reason).increment(1);
    }

    /// Count a message that could not be queued for a client.
    pub fn delivery_failures_total(reason: &'static str) {
        metrics::counter!("rdv_delivery_failures_total", "reason" => reason).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record the time spent routing one inbound message, in seconds.
    pub fn route_latency_seconds(value: f64) {
        metrics::histogram!("rdv_route_latency_seconds").record(value);
    }
}
