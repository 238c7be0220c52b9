use super::{InferenceBackend, ModelTarget};
use crate::{
    error::ExecutorError,
    postprocess::{BatchOutput, NamedTensor},
};
use ndarray::Array4;
use ort::{
    execution_providers::TensorRTExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::path::Path;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tonic::async_trait;

const DEFAULT_OUTPUT: &str = "output0";

/// In-process ONNX Runtime sessions on the TensorRT execution provider,
/// used round-robin.
#[derive(Clone)]
pub struct OrtBackend {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
}

impl OrtBackend {
    pub fn new(model_path: &Path, num_instances: usize) -> Result<Self, ExecutorError> {
        ort::init()
            .with_execution_providers([TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .build()])
            .commit()
            .map_err(|e| ExecutorError::inference(format!("failed to init ort: {}", e)))?;

        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_path)?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ExecutorError::inference(format!("failed to load {:?}: {}", model_path, e)))?;

        tracing::info!("Created {} ONNX sessions", num_instances);

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn run(
        &self,
        input: &Array4<f32>,
        output_name: &str,
    ) -> Result<ndarray::ArrayD<f32>, ExecutorError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ExecutorError::inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling batch with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ExecutorError::inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ExecutorError::inference(format!("inference failed: {}", e)))?;

        let output = select_output(outputs.get(output_name), output_name)?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| ExecutorError::inference(format!("failed to extract tensor: {}", e)))?;

        ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| ExecutorError::inference(format!("invalid tensor shape: {}", e)))
    }
}

fn select_output<T>(output: Option<T>, name: &str) -> Result<T, ExecutorError> {
    output.ok_or_else(|| ExecutorError::inference(format!("model has no output `{}`", name)))
}

#[async_trait]
impl InferenceBackend for OrtBackend {
    fn name(&self) -> &'static str {
        "ort"
    }

    async fn infer(
        &self,
        target: &ModelTarget,
        input: &Array4<f32>,
    ) -> Result<BatchOutput, ExecutorError> {
        let backend = self.clone();
        let output_name = target
            .output_name
            .clone()
            .unwrap_or_else(|| DEFAULT_OUTPUT.to_string());
        let input = input.as_standard_layout().into_owned();

        let data = tokio::task::spawn_blocking({
            let output_name = output_name.clone();
            move || backend.run(&input, &output_name)
        })
        .await
        .map_err(|e| ExecutorError::inference(format!("ort task failed: {}", e)))??;

        Ok(BatchOutput::new(vec![NamedTensor {
            name: output_name,
            data,
        }]))
    }

    async fn ready(&self, _target: &ModelTarget) -> Result<bool, ExecutorError> {
        Ok(!self.sessions.is_empty())
    }
}
