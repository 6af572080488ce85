//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Swap lifecycle transitions
//! - Quote racing outcomes
//! - Chain event processing
//! - Relay synchronization progress
//!
//! The crate only records; embedding applications decide how to serve
//! the registry (see [`render`]).

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    // Swap lifecycle metrics
    pub static ref SWAP_TRANSITIONS: CounterVec = register_counter_vec!(
        "btcswap_state_transitions_total",
        "Total swap state transitions by kind and target state",
        &["kind", "state"]
    ).unwrap();

    pub static ref SWAPS_ACTIVE: GaugeVec = register_gauge_vec!(
        "btcswap_swaps_active",
        "Currently tracked non-terminal swaps per kind",
        &["kind"]
    ).unwrap();

    pub static ref SWAPS_RECOVERED: CounterVec = register_counter_vec!(
        "btcswap_swaps_recovered_total",
        "Swaps revived from storage at startup",
        &["kind"]
    ).unwrap();

    // Quote broker metrics
    pub static ref QUOTES_REQUESTED: CounterVec = register_counter_vec!(
        "btcswap_quotes_requested_total",
        "Quote requests fanned out to intermediaries",
        &["kind"]
    ).unwrap();

    pub static ref QUOTES_RECEIVED: CounterVec = register_counter_vec!(
        "btcswap_quotes_received_total",
        "Quote answers by outcome",
        &["kind", "outcome"]
    ).unwrap();

    pub static ref QUOTE_LATENCY: HistogramVec = register_histogram_vec!(
        "btcswap_quote_latency_seconds",
        "Time from fan-out to each intermediary answer",
        &["kind"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref INTERMEDIARIES_BLACKLISTED: CounterVec = register_counter_vec!(
        "btcswap_intermediaries_blacklisted_total",
        "Intermediaries excluded for protocol violations",
        &[]
    ).unwrap();

    // Chain event metrics
    pub static ref CHAIN_EVENTS: CounterVec = register_counter_vec!(
        "btcswap_chain_events_total",
        "Escrow events processed by type",
        &["event_type"]
    ).unwrap();

    pub static ref COMMIT_STATUS_POLLS: CounterVec = register_counter_vec!(
        "btcswap_commit_status_polls_total",
        "Authoritative commit status polls issued by watchdogs",
        &[]
    ).unwrap();

    // Relay synchronizer metrics
    pub static ref BITCOIN_TIP_HEIGHT: GaugeVec = register_gauge_vec!(
        "btcswap_bitcoin_tip_height",
        "Best height reported by the bitcoin source",
        &[]
    ).unwrap();

    pub static ref RELAY_TIP_HEIGHT: GaugeVec = register_gauge_vec!(
        "btcswap_relay_tip_height",
        "Best height known to the on-chain relay",
        &[]
    ).unwrap();

    pub static ref HEADERS_SUBMITTED: CounterVec = register_counter_vec!(
        "btcswap_headers_submitted_total",
        "Bitcoin headers submitted to the relay",
        &["target"]
    ).unwrap();

    pub static ref SYNC_PASSES: CounterVec = register_counter_vec!(
        "btcswap_sync_passes_total",
        "Completed relay synchronizer passes",
        &[]
    ).unwrap();
}

/// Render the current registry in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_transition(kind: &str, state: &str) {
    SWAP_TRANSITIONS.with_label_values(&[kind, state]).inc();
}

pub fn record_active_swaps(kind: &str, count: usize) {
    SWAPS_ACTIVE.with_label_values(&[kind]).set(count as f64);
}

pub fn record_recovered(kind: &str) {
    SWAPS_RECOVERED.with_label_values(&[kind]).inc();
}

pub fn record_quote_requested(kind: &str) {
    QUOTES_REQUESTED.with_label_values(&[kind]).inc();
}

pub fn record_quote_received(kind: &str, outcome: &str) {
    QUOTES_RECEIVED.with_label_values(&[kind, outcome]).inc();
}

pub fn record_quote_latency(kind: &str, latency_secs: f64) {
    QUOTE_LATENCY
        .with_label_values(&[kind])
        .observe(latency_secs);
}

pub fn record_blacklisted() {
    INTERMEDIARIES_BLACKLISTED.with_label_values(&[]).inc();
}

pub fn record_chain_event(event_type: &str) {
    CHAIN_EVENTS.with_label_values(&[event_type]).inc();
}

pub fn record_commit_status_poll() {
    COMMIT_STATUS_POLLS.with_label_values(&[]).inc();
}

pub fn record_bitcoin_tip(height: u64) {
    BITCOIN_TIP_HEIGHT
        .with_label_values(&[])
        .set(height as f64);
}

pub fn record_relay_tip(height: u64) {
    RELAY_TIP_HEIGHT.with_label_values(&[]).set(height as f64);
}

pub fn record_headers_submitted(target: &str, count: usize) {
    HEADERS_SUBMITTED
        .with_label_values(&[target])
        .inc_by(count as f64);
}

pub fn record_sync_pass() {
    SYNC_PASSES.with_label_values(&[]).inc();
}
