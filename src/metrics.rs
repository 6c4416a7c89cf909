//! Prometheus-style metrics for connection health and message throughput.
//!
//! This module provides metrics for:
//! - Connect attempts, successes, and reconnects per channel
//! - Inbound message processing latency
//! - Derived displayed-price computations

use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use tracing::debug;

// === Metric Name Constants ===

/// Group socket connect attempts counter metric name.
pub const METRIC_CONNECT_ATTEMPTS: &str = "ws_connect_attempts_total";
/// Group socket successful opens counter metric name.
pub const METRIC_CONNECT_SUCCESS: &str = "ws_connect_success_total";
/// Group socket reconnects counter metric name.
pub const METRIC_RECONNECTS: &str = "ws_reconnects_total";
/// Inbound messages processed counter metric name.
pub const METRIC_MESSAGES_PROCESSED: &str = "ws_messages_processed_total";
/// Inbound message processing latency metric name.
pub const METRIC_MESSAGE_LATENCY: &str = "ws_message_latency_ms";
/// Derived price updates emitted counter metric name.
pub const METRIC_PRICE_UPDATES: &str = "ws_price_updates_total";
/// Malformed inbound frames counter metric name.
pub const METRIC_PARSE_ERRORS: &str = "ws_parse_errors_total";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    describe_counter!(METRIC_CONNECT_ATTEMPTS, "Total number of connect attempts");
    describe_counter!(METRIC_CONNECT_SUCCESS, "Total number of successful connects");
    describe_counter!(METRIC_RECONNECTS, "Total number of reconnects performed by the cleanup tick");
    describe_counter!(METRIC_MESSAGES_PROCESSED, "Total number of inbound WebSocket messages processed");
    describe_histogram!(METRIC_MESSAGE_LATENCY, "Inbound message processing latency in milliseconds");
    describe_counter!(METRIC_PRICE_UPDATES, "Total number of derived displayed-price events emitted");
    describe_counter!(METRIC_PARSE_ERRORS, "Total number of malformed inbound frames");

    debug!("metrics initialized");
}

/// Increment the connect-attempts counter for a channel.
pub fn inc_connect_attempts(channel: &'static str) {
    counter!(METRIC_CONNECT_ATTEMPTS, "channel" => channel).increment(1);
}

/// Increment the connect-success counter for a channel.
pub fn inc_connect_success(channel: &'static str) {
    counter!(METRIC_CONNECT_SUCCESS, "channel" => channel).increment(1);
}

/// Increment the reconnects counter for a channel.
pub fn inc_reconnects(channel: &'static str) {
    counter!(METRIC_RECONNECTS, "channel" => channel).increment(1);
}

/// Increment the processed-messages counter for a channel.
pub fn inc_messages_processed(channel: &'static str) {
    counter!(METRIC_MESSAGES_PROCESSED, "channel" => channel).increment(1);
}

/// Increment the derived price-update counter.
pub fn inc_price_updates() {
    counter!(METRIC_PRICE_UPDATES).increment(1);
}

/// Increment the parse-errors counter for a channel.
pub fn inc_parse_errors(channel: &'static str) {
    counter!(METRIC_PARSE_ERRORS, "channel" => channel).increment(1);
}

/// RAII guard for timing inbound message processing.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    channel: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for a channel's inbound message processing.
    pub fn new(channel: &'static str) -> Self {
        Self {
            start: Instant::now(),
            channel,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_MESSAGE_LATENCY, "channel" => self.channel).record(latency_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn latency_timer_measures_time() {
        let timer = LatencyTimer::new("market");
        sleep(Duration::from_millis(10));
        let elapsed = timer.elapsed_ms();
        assert!(elapsed >= 9.0);
    }
}
