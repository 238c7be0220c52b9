use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::collections::HashSet;
use std::time::Duration;

pub struct Metrics {
    requests: IntCounterVec,
    request_duration: HistogramVec,
    batch_size: HistogramVec,
    executor_duration: HistogramVec,
    executor_retries: IntCounterVec,
    inflight_batches: IntGaugeVec,
    preprocess_rejections: IntCounterVec,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let latency_ms = generate_boundaries((1, 10, 30, 200, 1000));

        let requests = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total number of inference requests"),
            &["model", "outcome"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_ms",
                "End-to-end duration of inference requests in milliseconds",
            )
            .buckets(latency_ms.clone()),
            &["model"],
        )?;
        let batch_size = HistogramVec::new(
            HistogramOpts::new("gateway_batch_size", "Number of requests per dispatched batch")
                .buckets(exponential_buckets(1.0, 2.0, 9)?),
            &["model", "reason"],
        )?;
        let executor_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_executor_duration_ms",
                "Duration of backend calls in milliseconds",
            )
            .buckets(latency_ms),
            &["model", "outcome"],
        )?;
        let executor_retries = IntCounterVec::new(
            Opts::new(
                "gateway_executor_retries_total",
                "Backend calls retried after a transport failure",
            ),
            &["model"],
        )?;
        let inflight_batches = IntGaugeVec::new(
            Opts::new("gateway_inflight_batches", "Batches currently awaiting the backend"),
            &["model"],
        )?;
        let preprocess_rejections = IntCounterVec::new(
            Opts::new(
                "gateway_preprocess_rejections_total",
                "Requests turned away by the preprocessing pool",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(executor_duration.clone()))?;
        registry.register(Box::new(executor_retries.clone()))?;
        registry.register(Box::new(inflight_batches.clone()))?;
        registry.register(Box::new(preprocess_rejections.clone()))?;

        Ok(Metrics {
            requests,
            request_duration,
            batch_size,
            executor_duration,
            executor_retries,
            inflight_batches,
            preprocess_rejections,
            registry,
        })
    }

    pub fn record_request(&self, model: &str, outcome: &str, elapsed: Duration) {
        self.requests.with_label_values(&[model, outcome]).inc();
        self.request_duration
            .with_label_values(&[model])
            .observe(elapsed.as_secs_f64() * 1000.);
    }

    pub fn record_batch_size(&self, model: &str, reason: &str, size: usize) {
        self.batch_size
            .with_label_values(&[model, reason])
            .observe(size as f64);
    }

    pub fn record_executor_call(&self, model: &str, outcome: &str, elapsed: Duration) {
        self.executor_duration
            .with_label_values(&[model, outcome])
            .observe(elapsed.as_secs_f64() * 1000.);
    }

    pub fn record_retry(&self, model: &str) {
        self.executor_retries.with_label_values(&[model]).inc();
    }

    pub fn batch_started(&self, model: &str) {
        self.inflight_batches.with_label_values(&[model]).inc();
    }

    pub fn batch_finished(&self, model: &str) {
        self.inflight_batches.with_label_values(&[model]).dec();
    }

    pub fn record_preprocess_rejection(&self, reason: &str) {
        self.preprocess_rejections.with_label_values(&[reason]).inc();
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 1;
    let middle_step: usize = 5;
    let end_step: usize = 25;
    let tail_step: usize = 200;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_generate_boundaries() {
        let parts = (1, 3, 13, 63, 463);
        let get = generate_boundaries(parts);
        let expected = vec![1.0, 2.0, 3.0, 8.0, 13.0, 38.0, 63.0, 263.0, 463.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_boundaries_are_strictly_increasing() {
        let boundaries = generate_boundaries((1, 10, 30, 200, 1000));
        assert!(boundaries.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_metrics_are_exposed() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("face-detect", "ok", Duration::from_millis(12));
        metrics.record_batch_size("face-detect", "size", 4);
        metrics.record_retry("face-detect");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("gateway_requests_total{model=\"face-detect\",outcome=\"ok\"} 1"));
        assert!(text.contains("gateway_batch_size_count"));
        assert!(text.contains("gateway_executor_retries_total"));
    }
}
