use crate::{
    config::{GatewayConfig, ReadinessConfig, VariantConfig},
    error::{ExecutorError, GatewayError},
    executor::{self, InferenceBackend},
    pipeline::{VariantInfo, VariantPipeline},
    pool::PreprocessPool,
    postprocess::{DecodeOptions, InferenceOutput},
    request::InferenceRequest,
    telemetry::Metrics,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::instrument;

/// Entry point for inference requests: routes a payload to its variant,
/// preprocesses it, enqueues it for batching and waits for its outcome.
pub struct Gateway {
    pipelines: HashMap<String, VariantPipeline>,
    pool: PreprocessPool,
    request_timeout: Duration,
    readiness: ReadinessConfig,
    next_request_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Gateway {
    /// Starts every configured variant, obtaining each backend from
    /// `connect`. Must be called inside a tokio runtime.
    pub fn new<F>(
        config: &GatewayConfig,
        metrics: Arc<Metrics>,
        mut connect: F,
    ) -> Result<Self, GatewayError>
    where
        F: FnMut(&VariantConfig) -> Result<Arc<dyn InferenceBackend>, ExecutorError>,
    {
        let mut pipelines = HashMap::with_capacity(config.model_variants.len());
        for variant in &config.model_variants {
            let backend = connect(variant).map_err(|e| {
                tracing::error!(variant = %variant.name, "Failed to create executor: {}", e);
                GatewayError::from(e)
            })?;
            let pipeline = VariantPipeline::start(
                variant,
                config.batching_for(variant),
                backend,
                metrics.clone(),
            );
            pipelines.insert(variant.name.clone(), pipeline);
        }

        Ok(Self {
            pipelines,
            pool: PreprocessPool::new(&config.preprocess, metrics.clone()),
            request_timeout: config.request_timeout(),
            readiness: config.readiness.clone(),
            next_request_id: AtomicU64::new(0),
            metrics,
        })
    }

    /// Starts every variant on the backend named by its configuration.
    pub fn connect(config: &GatewayConfig, metrics: Arc<Metrics>) -> Result<Self, GatewayError> {
        Self::new(config, metrics, |variant| executor::connect(&variant.executor))
    }

    pub fn variants(&self) -> Vec<VariantInfo> {
        let mut variants: Vec<_> = self.pipelines.values().map(|p| p.info().clone()).collect();
        variants.sort_by(|a, b| a.name.cmp(&b.name));
        variants
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn infer(&self, model: &str, data: Bytes) -> Result<InferenceOutput, GatewayError> {
        self.infer_with(model, data, DecodeOptions::default()).await
    }

    /// Runs one request with per-request decoding overrides.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn infer_with(
        &self,
        model: &str,
        data: Bytes,
        options: DecodeOptions,
    ) -> Result<InferenceOutput, GatewayError> {
        let started = Instant::now();
        let process = self.process(model, data, options);
        let result = match timeout(self.request_timeout, process).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::RequestTimeout(self.request_timeout)),
        };

        let label = if self.pipelines.contains_key(model) {
            model
        } else {
            "unknown"
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.metrics
            .record_request(label, outcome, started.elapsed());
        if let Err(e) = &result {
            if !e.is_client_error() {
                tracing::warn!("Inference request failed: {}", e);
            }
        }
        result
    }

    async fn process(
        &self,
        model: &str,
        data: Bytes,
        options: DecodeOptions,
    ) -> Result<InferenceOutput, GatewayError> {
        let pipeline = self
            .pipelines
            .get(model)
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))?;
        if !options.is_empty() && pipeline.info().task != "detection" {
            return Err(GatewayError::InvalidRequest(format!(
                "`{}` is not a detection model and takes no decoding options",
                model
            )));
        }
        options.validate()?;

        let preprocessor = pipeline.preprocessor();
        let input = self.pool.run(move || preprocessor.prepare(&data)).await?;

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (mut request, outcome) =
            InferenceRequest::new(id, pipeline.name(), input, Instant::now());
        request.options = options;
        pipeline.submit(request);

        // dropping the handle on timeout leaves the batch untouched; its
        // outcome for this slot is discarded on delivery
        outcome.wait().await
    }

    /// Probes every variant's backend until it reports ready, with
    /// exponential backoff and jitter.
    pub async fn wait_until_ready(&self) -> Result<(), GatewayError> {
        let checks = self.pipelines.values().map(|p| self.check_ready(p));
        futures::future::try_join_all(checks).await?;
        Ok(())
    }

    async fn check_ready(&self, pipeline: &VariantPipeline) -> Result<(), GatewayError> {
        let mut retry_delay = Duration::from_millis(self.readiness.initial_delay_ms);
        let max_retry_delay = Duration::from_millis(self.readiness.max_delay_ms);
        let max_retries = self.readiness.max_retries.max(1);
        let name = pipeline.name();

        for attempt in 1..=max_retries {
            match pipeline.executor().ready().await {
                Ok(true) => {
                    tracing::info!(variant = %name, "Backend is ready");
                    return Ok(());
                }
                Ok(false) => {
                    tracing::warn!(variant = %name, "Backend not ready (attempt {}/{})", attempt, max_retries);
                }
                Err(e) => {
                    tracing::error!(variant = %name, "Readiness check failed (attempt {}/{}): {}", attempt, max_retries, e);
                }
            }

            if attempt < max_retries {
                let jitter = rand::random::<f32>() * 0.2 + 0.9;
                sleep(retry_delay.mul_f32(jitter)).await;
                retry_delay = (retry_delay * 2).min(max_retry_delay);
            }
        }

        Err(GatewayError::from(ExecutorError::transport(format!(
            "backend for `{}` not ready after {} attempts",
            name, max_retries
        ))))
    }

    /// Stops intake, flushes open batches and waits for in-flight batches.
    pub async fn shutdown(self) {
        tracing::info!("Draining {} model variants", self.pipelines.len());
        let drains = self.pipelines.into_values().map(VariantPipeline::shutdown);
        futures::future::join_all(drains).await;
    }
}
