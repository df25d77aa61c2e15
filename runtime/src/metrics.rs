//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the coordination layer:
//! - Request dispatch, coalescing and settle
//! - Result store writes and evictions
//! - Server-side render passes and drained requests
//!
//! Recording goes through the `metrics` facade, so it is a no-op until a
//! recorder is installed. [`MetricsServer`] installs the Prometheus one.
//!
//! # Example
//!
//! ```rust,no_run
//! use fetch_cache_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
///
/// Installs the global recorder and renders the text exposition format for
/// whatever endpoint the host application serves it on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the host application exposes metrics on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Address the metrics are meant to be served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Coordinator
    describe_counter!(
        "fetch_dispatch_total",
        "Total number of dispatch calls"
    );
    describe_counter!(
        "fetch_dispatch_coalesced_total",
        "Dispatch calls that joined an in-flight request instead of starting one"
    );
    describe_counter!(
        "fetch_settle_total",
        "Total number of settled requests"
    );
    describe_counter!(
        "fetch_settle_errors_total",
        "Settled requests carrying an error"
    );
    describe_histogram!(
        "fetch_settle_duration_seconds",
        "Time from transport start to settle"
    );
    describe_gauge!(
        "fetch_in_flight",
        "Requests currently in flight"
    );

    // Result store
    describe_counter!(
        "cache_writes_total",
        "Total number of result store writes"
    );
    describe_counter!(
        "cache_evictions_total",
        "Keys removed from the result store by stack eviction"
    );

    // Server rendering
    describe_counter!(
        "ssr_render_passes_total",
        "Render passes performed by the drain loop"
    );
    describe_counter!(
        "ssr_drained_requests_total",
        "Pending requests awaited by the drain loop"
    );
}

/// Coordinator metrics recorder.
pub struct CoordinatorMetrics;

impl CoordinatorMetrics {
    /// Record a dispatch; `coalesced` when it joined an in-flight request.
    pub fn record_dispatch(coalesced: bool) {
        counter!("fetch_dispatch_total").increment(1);
        if coalesced {
            counter!("fetch_dispatch_coalesced_total").increment(1);
        }
    }

    /// Record a settled request.
    pub fn record_settle(is_error: bool, duration: Duration) {
        counter!("fetch_settle_total").increment(1);
        if is_error {
            counter!("fetch_settle_errors_total").increment(1);
        }
        histogram!("fetch_settle_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record the number of requests in flight.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_in_flight(count: usize) {
        gauge!("fetch_in_flight").set(count as f64);
    }
}

/// Result store metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a store write.
    pub fn record_write() {
        counter!("cache_writes_total").increment(1);
    }

    /// Record keys evicted from the store.
    pub fn record_evictions(count: usize) {
        counter!("cache_evictions_total").increment(count as u64);
    }
}

/// Server rendering metrics recorder.
pub struct SsrMetrics;

impl SsrMetrics {
    /// Record one render pass.
    pub fn record_pass() {
        counter!("ssr_render_passes_total").increment(1);
    }

    /// Record requests awaited during a drain.
    pub fn record_drained(count: usize) {
        counter!("ssr_drained_requests_total").increment(count as u64);
    }
}
