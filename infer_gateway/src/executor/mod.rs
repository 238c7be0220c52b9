mod grpc;
mod http;
#[cfg(feature = "tensorrt")]
mod ort;

pub use grpc::GrpcBackend;
pub use http::HttpBackend;
#[cfg(feature = "tensorrt")]
pub use ort::OrtBackend;

use crate::{
    batch::BatchId,
    config::{BatchingConfig, ExecutorConfig, ModelConfig},
    error::ExecutorError,
    postprocess::BatchOutput,
    telemetry::Metrics,
};
use ndarray::Array4;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tonic::async_trait;

/// Model addressed on a backend, with its tensor bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    pub name: String,
    pub version: String,
    pub input_name: String,
    pub output_name: Option<String>,
}

impl From<&ModelConfig> for ModelTarget {
    fn from(model: &ModelConfig) -> Self {
        Self {
            name: model.name.clone(),
            version: model.version.clone(),
            input_name: model.input_name.clone(),
            output_name: model.output_name.clone(),
        }
    }
}

/// A model-serving backend reachable over one transport.
#[async_trait]
pub trait InferenceBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs one batched call. Axis 0 of `input` is the slot index and must
    /// stay the slot index of every returned tensor.
    async fn infer(
        &self,
        target: &ModelTarget,
        input: &Array4<f32>,
    ) -> Result<BatchOutput, ExecutorError>;

    async fn ready(&self, target: &ModelTarget) -> Result<bool, ExecutorError>;
}

/// Builds the backend selected by a variant's `executor.transport`.
pub fn connect(config: &ExecutorConfig) -> Result<Arc<dyn InferenceBackend>, ExecutorError> {
    match config {
        ExecutorConfig::Grpc {
            url,
            connect_timeout_ms,
        } => Ok(Arc::new(GrpcBackend::connect(
            url,
            Duration::from_millis(*connect_timeout_ms),
        )?)),
        ExecutorConfig::Http {
            url,
            connect_timeout_ms,
        } => Ok(Arc::new(HttpBackend::new(
            url,
            Duration::from_millis(*connect_timeout_ms),
        )?)),
        #[cfg(feature = "tensorrt")]
        ExecutorConfig::Ort { num_instances, .. } => {
            let path = config.get_model_path().ok_or_else(|| {
                ExecutorError::inference("ort executor has no model path".to_string())
            })?;
            Ok(Arc::new(OrtBackend::new(&path, *num_instances)?))
        }
    }
}

/// Calls one variant's backend under the executor timeout.
///
/// A transport failure is retried once after a jittered backoff; the retry
/// counts against the same timeout. Inference failures and timeouts are
/// returned as they are.
pub struct ExecutorClient {
    variant: Arc<str>,
    backend: Arc<dyn InferenceBackend>,
    target: ModelTarget,
    timeout: Duration,
    retry_backoff: Duration,
    metrics: Arc<Metrics>,
}

impl ExecutorClient {
    pub fn new(
        variant: Arc<str>,
        backend: Arc<dyn InferenceBackend>,
        target: ModelTarget,
        batching: &BatchingConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            variant,
            backend,
            target,
            timeout: batching.executor_timeout(),
            retry_backoff: batching.retry_backoff(),
            metrics,
        }
    }

    pub fn target(&self) -> &ModelTarget {
        &self.target
    }

    #[tracing::instrument(skip(self, input), fields(variant = %self.variant, backend = self.backend.name()))]
    pub async fn infer(
        &self,
        batch_id: BatchId,
        input: &Array4<f32>,
    ) -> Result<BatchOutput, ExecutorError> {
        let started = Instant::now();
        let result = match timeout(self.timeout, self.call_with_retry(input)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::timeout(format!(
                "no response from `{}` within {:?}",
                self.target.name, self.timeout
            ))),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind.as_str(),
        };
        self.metrics
            .record_executor_call(&self.variant, outcome, started.elapsed());

        result.map(|mut output| {
            output.batch_id = batch_id;
            output
        })
    }

    async fn call_with_retry(&self, input: &Array4<f32>) -> Result<BatchOutput, ExecutorError> {
        match self.backend.infer(&self.target, input).await {
            Err(err) if err.is_transient() => {
                tracing::warn!("Backend call failed, retrying once: {}", err);
                self.metrics.record_retry(&self.variant);
                let jitter = rand::random::<f32>() * 0.2 + 0.9;
                sleep(self.retry_backoff.mul_f32(jitter)).await;
                self.backend.infer(&self.target, input).await
            }
            other => other,
        }
    }

    /// Probes the backend once, bounded by the executor timeout.
    pub async fn ready(&self) -> Result<bool, ExecutorError> {
        match timeout(self.timeout, self.backend.ready(&self.target)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::timeout("readiness check timed out")),
        }
    }
}

/// Scripted backends for tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::postprocess::NamedTensor;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub enum Step {
        Respond,
        Fail(ExecutorError),
        Stall,
    }

    /// Answers each call with the next scripted step, echoing the per-slot
    /// mean of the input as a `[batch, 2]` tensor once the script runs out.
    pub struct ScriptedBackend {
        steps: Mutex<VecDeque<Step>>,
        pub calls: AtomicUsize,
        pub batch_sizes: Mutex<Vec<usize>>,
    }

    impl ScriptedBackend {
        pub fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub fn echo(input: &Array4<f32>) -> BatchOutput {
        let batch = input.shape()[0];
        let data = ndarray::Array2::from_shape_fn((batch, 2), |(i, j)| {
            let mean = input.index_axis(ndarray::Axis(0), i).mean().unwrap_or(0.);
            if j == 0 {
                mean
            } else {
                1.0
            }
        });
        BatchOutput::new(vec![NamedTensor {
            name: "output".to_string(),
            data: data.into_dyn(),
        }])
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn infer(
            &self,
            _target: &ModelTarget,
            input: &Array4<f32>,
        ) -> Result<BatchOutput, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(input.shape()[0]);
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                None | Some(Step::Respond) => Ok(echo(input)),
                Some(Step::Fail(err)) => Err(err),
                Some(Step::Stall) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn ready(&self, _target: &ModelTarget) -> Result<bool, ExecutorError> {
            Ok(true)
        }
    }

    pub fn target() -> ModelTarget {
        ModelTarget {
            name: "test".to_string(),
            version: String::new(),
            input_name: "input".to_string(),
            output_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{target, ScriptedBackend, Step};
    use super::*;

    fn client(backend: Arc<ScriptedBackend>, timeout_ms: u64) -> ExecutorClient {
        let batching = BatchingConfig {
            executor_timeout_ms: timeout_ms,
            retry_backoff_ms: 20,
            ..BatchingConfig::default()
        };
        ExecutorClient::new(
            Arc::from("test"),
            backend,
            target(),
            &batching,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    fn input() -> Array4<f32> {
        Array4::from_elem((3, 3, 2, 2), 0.5)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_retried_once() {
        let backend = ScriptedBackend::new(vec![Step::Fail(ExecutorError::transport("reset"))]);
        let client = client(backend.clone(), 1000);

        let output = client.infer(9, &input()).await.unwrap();

        assert_eq!(backend.calls(), 2);
        assert_eq!(output.batch_id, 9);
        assert_eq!(output.tensors[0].data.shape(), &[3, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_transport_error_is_returned() {
        let backend = ScriptedBackend::new(vec![
            Step::Fail(ExecutorError::transport("reset")),
            Step::Fail(ExecutorError::transport("reset again")),
        ]);
        let client = client(backend.clone(), 1000);

        let err = client.infer(1, &input()).await.unwrap_err();

        assert_eq!(backend.calls(), 2);
        assert_eq!(err, ExecutorError::transport("reset again"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inference_error_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Step::Fail(ExecutorError::inference("bad dtype"))]);
        let client = client(backend.clone(), 1000);

        let err = client.infer(1, &input()).await.unwrap_err();

        assert_eq!(backend.calls(), 1);
        assert_eq!(err.kind, crate::error::ExecutorErrorKind::Inference);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_times_out() {
        let backend = ScriptedBackend::new(vec![Step::Stall]);
        let client = client(backend.clone(), 100);
        let started = Instant::now();

        let err = client.infer(1, &input()).await.unwrap_err();

        assert_eq!(err.kind, crate::error::ExecutorErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_counts_against_the_timeout() {
        let backend = ScriptedBackend::new(vec![
            Step::Fail(ExecutorError::transport("reset")),
            Step::Stall,
        ]);
        let client = client(backend.clone(), 100);

        let err = client.infer(1, &input()).await.unwrap_err();

        assert_eq!(err.kind, crate::error::ExecutorErrorKind::Timeout);
        assert_eq!(backend.calls(), 2);
    }
}
