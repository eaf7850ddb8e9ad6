//! Prometheus metrics: login attempts and proxied panel requests.
//! When metrics are enabled, GET /metrics exposes the text format.

use once_cell::sync::OnceCell;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};

static METRICS: OnceCell<MetricsInner> = OnceCell::new();

struct MetricsInner {
    logins_total: IntCounterVec,
    panel_requests_total: IntCounterVec,
    panel_request_duration_seconds: HistogramVec,
}

/// Initialize metrics and register with the default registry. Call once when metrics are enabled.
pub fn init() -> Result<(), prometheus::Error> {
    METRICS.get_or_try_init(build).map(|_| ())
}

fn build() -> Result<MetricsInner, prometheus::Error> {
    let logins_total = IntCounterVec::new(
        Opts::new(
            "panel_proxy_logins_total",
            "Login attempts by outcome (success, fields_not_found, no_cookie, error)",
        ),
        &["outcome"],
    )?;
    let panel_requests_total = IntCounterVec::new(
        Opts::new(
            "panel_proxy_panel_requests_total",
            "Proxied panel data requests by endpoint and status class",
        ),
        &["endpoint", "status"],
    )?;
    let panel_request_duration_seconds = HistogramVec::new(
        HistogramOpts::new(
            "panel_proxy_panel_request_duration_seconds",
            "Panel data request duration in seconds by endpoint",
        )
        .buckets(prometheus::exponential_buckets(0.05, 2.0, 10)?),
        &["endpoint"],
    )?;

    prometheus::register(Box::new(logins_total.clone()))?;
    prometheus::register(Box::new(panel_requests_total.clone()))?;
    prometheus::register(Box::new(panel_request_duration_seconds.clone()))?;

    Ok(MetricsInner {
        logins_total,
        panel_requests_total,
        panel_request_duration_seconds,
    })
}

/// Record one login attempt.
pub fn record_login(outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.logins_total.with_label_values(&[outcome]).inc();
    }
}

/// Record one panel data request. status_class: "2xx", "3xx", "4xx", "5xx", "error".
pub fn record_panel_request(endpoint: &str, status_class: &str, duration_secs: f64) {
    if let Some(m) = METRICS.get() {
        m.panel_requests_total
            .with_label_values(&[endpoint, status_class])
            .inc();
        m.panel_request_duration_seconds
            .with_label_values(&[endpoint])
            .observe(duration_secs);
    }
}

/// Encode all registered metrics in Prometheus text format.
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::warn!("metrics encode failed: {}", e);
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_is_counted_after_init() {
        init().unwrap();
        init().unwrap();
        record_login("success");
        record_panel_request("numbers", "2xx", 0.12);
        let text = encode();
        assert!(text.contains("panel_proxy_logins_total"), "{}", text);
        assert!(text.contains("outcome=\"success\""), "{}", text);
        assert!(text.contains("panel_proxy_panel_requests_total"), "{}", text);
        assert!(text.contains("endpoint=\"numbers\""), "{}", text);
    }
}
