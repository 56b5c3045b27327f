// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[allow(unused_imports)]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

/// Initializes the descriptions for all extractor metrics.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_gauge!(
        "extractor_registered_pools",
        "Number of pools currently held in the registry."
    );
    describe_counter!(
        "extractor_watched_pools_total",
        Unit::Count,
        "Pools whose watcher completed its first state refresh."
    );
    describe_counter!(
        "extractor_pool_registrations_total",
        Unit::Count,
        "Verified pool registrations, labeled by discovery source (cache, request, logs)."
    );
    describe_counter!(
        "extractor_negative_classifications_total",
        Unit::Count,
        "Addresses recorded as absent, foreign or transiently failing, labeled by reason."
    );
    describe_gauge!(
        "extractor_pending_operations",
        "Outstanding discovery / verification operations."
    );
    describe_histogram!(
        "extractor_log_batch_size",
        "Number of logs per delivered block batch."
    );
    describe_counter!(
        "extractor_log_exceptions_total",
        Unit::Count,
        "Logs whose processing failed inside a batch."
    );
    describe_counter!(
        "extractor_log_delivery_failures_total",
        Unit::Count,
        "Log delivery failures that forced a full refresh of every watcher."
    );
    describe_counter!(
        "extractor_quality_verdicts_total",
        Unit::Count,
        "Reconciliation verdicts, labeled by status."
    );
    describe_counter!(
        "extractor_quality_races_total",
        Unit::Count,
        "Verdicts dropped because the checked watcher was superseded during the check."
    );
    describe_counter!(
        "extractor_cache_hits_total",
        Unit::Count,
        "Cache hits, labeled by cache name."
    );
    describe_counter!(
        "extractor_cache_misses_total",
        Unit::Count,
        "Cache misses, labeled by cache name."
    );
    describe_histogram!(
        "extractor_multicall_batch_size",
        "Calls per Multicall3 aggregate3 request."
    );
    describe_counter!(
        "extractor_multicall_failures_total",
        Unit::Count,
        "Multicall3 batches that failed as a whole."
    );
}

/// Installs the Prometheus exporter on `0.0.0.0:<port>`.
#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;
    describe_metrics();
    Ok(())
}

pub fn set_registered_pools(count: usize) {
    gauge!("extractor_registered_pools", count as f64);
}

pub fn increment_watched_pools() {
    increment_counter!("extractor_watched_pools_total");
}

pub fn increment_pool_registrations(source: &'static str) {
    increment_counter!("extractor_pool_registrations_total", "source" => source);
}

pub fn increment_negative_classification(reason: &'static str) {
    increment_counter!("extractor_negative_classifications_total", "reason" => reason);
}

pub fn set_pending_operations(value: f64) {
    gauge!("extractor_pending_operations", value);
}

pub fn record_log_batch(size: usize) {
    histogram!("extractor_log_batch_size", size as f64);
}

pub fn increment_log_exceptions() {
    increment_counter!("extractor_log_exceptions_total");
}

pub fn increment_log_delivery_failures() {
    increment_counter!("extractor_log_delivery_failures_total");
}

pub fn increment_quality_verdict(status: &'static str) {
    increment_counter!("extractor_quality_verdicts_total", "status" => status);
}

pub fn increment_quality_races() {
    increment_counter!("extractor_quality_races_total");
}

pub fn increment_cache_hit(cache_name: &'static str) {
    increment_counter!("extractor_cache_hits_total", "cache" => cache_name);
}

pub fn increment_cache_miss(cache_name: &'static str) {
    increment_counter!("extractor_cache_misses_total", "cache" => cache_name);
}

pub fn record_multicall_batch_size(size: f64) {
    histogram!("extractor_multicall_batch_size", size);
}

pub fn increment_multicall_failed() {
    increment_counter!("extractor_multicall_failures_total");
}
