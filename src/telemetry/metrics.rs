//! Prometheus metrics

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Counter metric types
#[derive(Debug, Clone, Copy)]
pub enum CounterMetric {
    /// Orders acknowledged by the broker
    OrdersSubmitted,
    /// Orders that reached FILLED
    OrdersFilled,
    /// Orders that reached FAILED
    OrdersFailed,
    /// Re-priced chase resubmissions
    ChaseResubmits,
    /// Limit orders converted to market
    MarketFallbacks,
    /// Exit conditions that produced a close order
    ExitTriggers,
    /// Broker calls retried after a transient error
    BrokerRetries,
    /// Local state overwritten by broker state
    ReconciliationMismatches,
    /// Persisted records without a broker counterpart
    RecoveryGaps,
}

/// Gauge metric types
#[derive(Debug, Clone, Copy)]
pub enum GaugeMetric {
    /// Open position count
    OpenPositions,
    /// Non-terminal order count
    ActiveOrders,
    /// 1 while the emergency stop is set
    EmergencyHalted,
    /// Aggregate health: 0 healthy, 1 degraded, 2 unhealthy
    HealthStatus,
}

/// Latency metric types
#[derive(Debug, Clone, Copy)]
pub enum LatencyMetric {
    /// One broker REST round trip
    BrokerCall,
    /// Submission to terminal state of an order chain
    OrderExecution,
}

fn counter_name(metric: CounterMetric) -> &'static str {
    match metric {
        CounterMetric::OrdersSubmitted => "lw_orders_submitted_total",
        CounterMetric::OrdersFilled => "lw_orders_filled_total",
        CounterMetric::OrdersFailed => "lw_orders_failed_total",
        CounterMetric::ChaseResubmits => "lw_chase_resubmits_total",
        CounterMetric::MarketFallbacks => "lw_market_fallbacks_total",
        CounterMetric::ExitTriggers => "lw_exit_triggers_total",
        CounterMetric::BrokerRetries => "lw_broker_retries_total",
        CounterMetric::ReconciliationMismatches => "lw_reconciliation_mismatches_total",
        CounterMetric::RecoveryGaps => "lw_recovery_gaps_total",
    }
}

/// Increment a counter by one
pub fn incr(metric: CounterMetric) {
    metrics::counter!(counter_name(metric)).increment(1);
}

/// Set a gauge value
pub fn set_gauge(metric: GaugeMetric, value: f64) {
    let metric_name = match metric {
        GaugeMetric::OpenPositions => "lw_open_positions",
        GaugeMetric::ActiveOrders => "lw_active_orders",
        GaugeMetric::EmergencyHalted => "lw_emergency_halted",
        GaugeMetric::HealthStatus => "lw_health_status",
    };

    metrics::gauge!(metric_name).set(value);
}

/// Record a latency measurement
pub fn record_latency(metric: LatencyMetric, duration: Duration) {
    let metric_name = match metric {
        LatencyMetric::BrokerCall => "lw_broker_call_latency_ms",
        LatencyMetric::OrderExecution => "lw_order_execution_latency_ms",
    };

    metrics::histogram!(metric_name).record(duration.as_secs_f64() * 1000.0);
}

/// Start the Prometheus scrape endpoint
pub fn install_prometheus(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}
