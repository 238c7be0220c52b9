use crate::{
    accumulator::{Accumulator, AccumulatorHandle},
    batch::Batch,
    config::{BatchingConfig, VariantConfig},
    dispatcher::{dispatch_slots, BatchHandler, Dispatcher},
    error::GatewayError,
    executor::{ExecutorClient, InferenceBackend, ModelTarget},
    postprocess::Postprocessor,
    preprocess::ImagePreprocessor,
    request::InferenceRequest,
    telemetry::Metrics,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tonic::async_trait;

/// Runs one sealed batch through the backend and fans the result out.
pub struct BatchProcessor {
    variant: Arc<str>,
    executor: Arc<ExecutorClient>,
    postprocessor: Postprocessor,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl BatchHandler for BatchProcessor {
    async fn handle(&self, batch: Batch) {
        self.metrics.batch_started(&self.variant);

        let result = match batch.stack_inputs() {
            Ok(input) => self
                .executor
                .infer(batch.id(), &input)
                .await
                .map_err(GatewayError::from),
            Err(e) => Err(e),
        };

        let batch_id = batch.id();
        let report = self.postprocessor.complete(batch, result);
        tracing::debug!(
            variant = %self.variant,
            batch_id,
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            "Completed batch"
        );

        self.metrics.batch_finished(&self.variant);
    }
}

/// Public description of a configured variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantInfo {
    pub name: String,
    pub model: String,
    pub task: &'static str,
    pub transport: &'static str,
    pub max_batch_size: usize,
    pub max_batch_delay_ms: u64,
}

/// Everything serving one model variant: its preprocessing profile, the
/// accumulator feeding its dispatcher, and the backend client behind it.
pub struct VariantPipeline {
    name: Arc<str>,
    info: VariantInfo,
    preprocessor: Arc<ImagePreprocessor>,
    accumulator: AccumulatorHandle,
    executor: Arc<ExecutorClient>,
    tasks: Vec<JoinHandle<()>>,
}

impl VariantPipeline {
    pub fn start(
        config: &VariantConfig,
        batching: &BatchingConfig,
        backend: Arc<dyn InferenceBackend>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let info = VariantInfo {
            name: config.name.clone(),
            model: config.model.name.clone(),
            task: config.task.kind(),
            transport: backend.name(),
            max_batch_size: batching.max_batch_size,
            max_batch_delay_ms: batching.max_batch_delay_ms,
        };

        let executor = Arc::new(ExecutorClient::new(
            name.clone(),
            backend,
            ModelTarget::from(&config.model),
            batching,
            metrics.clone(),
        ));
        let processor = BatchProcessor {
            variant: name.clone(),
            executor: executor.clone(),
            postprocessor: Postprocessor::new(&config.model, &config.task),
            metrics: metrics.clone(),
        };

        // a sealed batch always holds a slot, so the channel never fills
        let max_inflight = batching.max_inflight_batches.max(1);
        let slots = dispatch_slots(max_inflight);
        let (sealed_tx, sealed_rx) = mpsc::channel(max_inflight);
        let dispatcher = Dispatcher::spawn(name.clone(), sealed_rx, Arc::new(processor));
        let (accumulator, accumulator_task) =
            Accumulator::spawn(name.clone(), batching.into(), slots, sealed_tx, metrics);

        tracing::info!(
            variant = %name,
            model = %info.model,
            task = info.task,
            transport = info.transport,
            max_batch_size = batching.max_batch_size,
            max_batch_delay_ms = batching.max_batch_delay_ms,
            max_inflight,
            "Started model variant"
        );

        Self {
            name,
            info,
            preprocessor: Arc::new(ImagePreprocessor::new(config.input.clone())),
            accumulator,
            executor,
            tasks: vec![accumulator_task, dispatcher],
        }
    }

    pub fn name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn info(&self) -> &VariantInfo {
        &self.info
    }

    pub fn preprocessor(&self) -> Arc<ImagePreprocessor> {
        self.preprocessor.clone()
    }

    pub fn executor(&self) -> &ExecutorClient {
        &self.executor
    }

    pub fn submit(&self, request: InferenceRequest) {
        self.accumulator.enqueue(request);
    }

    /// Stops accepting requests, flushes the open batch and waits for every
    /// dispatched batch to resolve.
    pub async fn shutdown(self) {
        let Self {
            name,
            accumulator,
            tasks,
            ..
        } = self;
        drop(accumulator);

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(variant = %name, "Pipeline task failed: {}", e);
            }
        }
    }
}
