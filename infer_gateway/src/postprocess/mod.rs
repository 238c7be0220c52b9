mod detection;
mod embedding;

pub use detection::{Detection, DetectionDecoder};
pub use embedding::{Embedding, EmbeddingDecoder};

use crate::{
    batch::{Batch, BatchId},
    config::{ModelConfig, TaskConfig},
    error::{ExecutorError, GatewayError},
    preprocess::ImageGeometry,
    request::Delivery,
};
use ndarray::{ArrayD, ArrayViewD, Axis};
use serde::{Deserialize, Serialize};

/// Structured result handed back to one client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InferenceOutput {
    Detections { detections: Vec<Detection> },
    Embedding(Embedding),
}

/// Per-request overrides of a detection variant's decoding settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct DecodeOptions {
    /// Minimum detection score.
    pub threshold: Option<f32>,
    /// Keep at most this many detections, largest first; 0 keeps all.
    pub limit: Option<usize>,
}

impl DecodeOptions {
    pub fn is_empty(&self) -> bool {
        self.threshold.is_none() && self.limit.is_none()
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        match self.threshold {
            Some(threshold) if !(0.0..=1.0).contains(&threshold) => Err(
                GatewayError::InvalidRequest(format!(
                    "threshold must be within [0, 1], got {}",
                    threshold
                )),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NamedTensor {
    pub name: String,
    pub data: ArrayD<f32>,
}

/// Raw outputs of one backend call. Axis 0 of every tensor is the slot index.
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    pub batch_id: BatchId,
    pub tensors: Vec<NamedTensor>,
    /// Per-slot failures reported by the backend, indexed like the batch.
    pub slot_errors: Vec<Option<String>>,
}

impl BatchOutput {
    pub fn new(tensors: Vec<NamedTensor>) -> Self {
        Self {
            batch_id: 0,
            tensors,
            slot_errors: Vec::new(),
        }
    }

    pub fn tensor(&self, name: Option<&str>) -> Option<&NamedTensor> {
        match name {
            Some(name) => self.tensors.iter().find(|t| t.name == name),
            None => self.tensors.first(),
        }
    }

    fn slot_error(&self, index: usize) -> Option<&str> {
        self.slot_errors.get(index).and_then(|e| e.as_deref())
    }
}

/// Decodes one slot's slice of the output tensor for a model task.
#[derive(Debug, Clone)]
pub enum TaskDecoder {
    Detection(DetectionDecoder),
    Embedding(EmbeddingDecoder),
}

impl TaskDecoder {
    pub fn from_config(task: &TaskConfig) -> Self {
        match task {
            TaskConfig::Detection {
                score_threshold,
                iou_threshold,
                max_detections,
                num_classes,
                num_landmarks,
                mask,
            } => TaskDecoder::Detection(DetectionDecoder {
                score_threshold: *score_threshold,
                iou_threshold: *iou_threshold,
                max_detections: *max_detections,
                num_classes: *num_classes,
                num_landmarks: *num_landmarks,
                mask: *mask,
            }),
            TaskConfig::Embedding { dim, normalize } => TaskDecoder::Embedding(EmbeddingDecoder {
                dim: *dim,
                normalize: *normalize,
            }),
        }
    }

    pub fn decode(
        &self,
        slot: ArrayViewD<f32>,
        geometry: &ImageGeometry,
        options: &DecodeOptions,
    ) -> Result<InferenceOutput, String> {
        match self {
            TaskDecoder::Detection(decoder) => decoder
                .decode(slot, geometry, options)
                .map(|detections| InferenceOutput::Detections { detections }),
            TaskDecoder::Embedding(decoder) => decoder.decode(slot).map(InferenceOutput::Embedding),
        }
    }
}

/// How the outcomes of one batch were delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionReport {
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl CompletionReport {
    fn record(&mut self, delivery: Delivery, ok: bool) {
        match delivery {
            Delivery::Delivered if ok => self.succeeded += 1,
            Delivery::Delivered => self.failed += 1,
            Delivery::Abandoned => self.abandoned += 1,
            Delivery::AlreadyResolved => {}
        }
    }
}

/// Demultiplexes a batch result into exactly one outcome per slot.
#[derive(Debug, Clone)]
pub struct Postprocessor {
    output_name: Option<String>,
    decoder: TaskDecoder,
}

impl Postprocessor {
    pub fn new(model: &ModelConfig, task: &TaskConfig) -> Self {
        Self {
            output_name: model.output_name.clone(),
            decoder: TaskDecoder::from_config(task),
        }
    }

    pub fn complete(
        &self,
        batch: Batch,
        result: Result<BatchOutput, GatewayError>,
    ) -> CompletionReport {
        let batch_id = batch.id();
        let output = match result.and_then(|output| self.check(batch_id, output)) {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(batch_id, size = batch.len(), error = %err, "Batch failed");
                return self.fail(batch, err);
            }
        };

        let Some(tensor) = output.tensor(self.output_name.as_deref()) else {
            let err = GatewayError::from(ExecutorError::inference(format!(
                "backend response has no output tensor `{}`",
                self.output_name.as_deref().unwrap_or("<first>")
            )));
            return self.fail(batch, err);
        };

        let produced = tensor.data.shape()[0];
        if produced > batch.len() {
            // rows can no longer be matched to slots by position
            let err = GatewayError::from(ExecutorError::inference(format!(
                "backend returned {} rows for a batch of {}",
                produced,
                batch.len()
            )));
            tracing::warn!(batch_id, expected = batch.len(), produced, "Backend returned more slots than the batch holds");
            return self.fail(batch, err);
        }
        if produced < batch.len() {
            tracing::warn!(
                batch_id,
                expected = batch.len(),
                produced,
                "Backend returned fewer slots than the batch holds"
            );
        }

        let mut report = CompletionReport::default();
        for (index, mut request) in batch.into_requests().into_iter().enumerate() {
            let outcome = if let Some(message) = output.slot_error(index) {
                Err(GatewayError::from(ExecutorError::inference(message)))
            } else if index >= produced {
                Err(GatewayError::Postprocess(format!(
                    "no output for slot {} of batch {}",
                    index, batch_id
                )))
            } else {
                self.decoder
                    .decode(
                        tensor.data.index_axis(Axis(0), index),
                        &request.input.geometry,
                        &request.options,
                    )
                    .map_err(GatewayError::Postprocess)
            };

            if let Err(err) = &outcome {
                tracing::debug!(batch_id, slot = index, request_id = request.id, error = %err, "Slot failed");
            }
            let ok = outcome.is_ok();
            report.record(request.slot.deliver(outcome), ok);
        }
        report
    }

    fn check(&self, batch_id: BatchId, output: BatchOutput) -> Result<BatchOutput, GatewayError> {
        if output.batch_id != batch_id {
            return Err(GatewayError::Internal(format!(
                "result for batch {} routed to batch {}",
                output.batch_id, batch_id
            )));
        }
        if output.tensors.iter().any(|t| t.data.ndim() == 0) {
            return Err(GatewayError::from(ExecutorError::inference(
                "backend returned a tensor without a batch axis",
            )));
        }
        Ok(output)
    }

    fn fail(&self, batch: Batch, err: GatewayError) -> CompletionReport {
        let len = batch.len();
        let delivered = batch.fail_all(err);
        CompletionReport {
            succeeded: 0,
            failed: delivered,
            abandoned: len - delivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::batch_of;
    use ndarray::{Array2, IxDyn};

    fn embedding_postprocessor() -> Postprocessor {
        Postprocessor {
            output_name: Some("fc1".to_string()),
            decoder: TaskDecoder::Embedding(EmbeddingDecoder {
                dim: Some(2),
                normalize: true,
            }),
        }
    }

    fn output(batch_id: BatchId, rows: &[[f32; 2]]) -> BatchOutput {
        let data = Array2::from_shape_fn((rows.len(), 2), |(i, j)| rows[i][j]).into_dyn();
        BatchOutput {
            batch_id,
            tensors: vec![NamedTensor {
                name: "fc1".to_string(),
                data,
            }],
            slot_errors: Vec::new(),
        }
    }

    fn vector_of(outcome: &InferenceOutput) -> Vec<f32> {
        match outcome {
            InferenceOutput::Embedding(e) => e.vector.clone(),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slots_are_routed_by_position() {
        let (batch, handles) = batch_of(&[0.0, 0.0, 0.0]);
        let result = output(batch.id(), &[[1.0, 0.0], [0.0, 2.0], [3.0, 4.0]]);

        let report = embedding_postprocessor().complete(batch, Ok(result));
        assert_eq!(report.succeeded, 3);

        let mut vectors = Vec::new();
        for handle in handles {
            vectors.push(vector_of(&handle.wait().await.unwrap()));
        }
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 2.0], vec![3.0, 4.0]]);
    }

    #[tokio::test]
    async fn test_whole_batch_failure_is_uniform() {
        let (batch, handles) = batch_of(&[0.0, 0.0, 0.0]);
        let err = GatewayError::from(ExecutorError::timeout("deadline"));

        let report = embedding_postprocessor().complete(batch, Err(err.clone()));
        assert_eq!(report.failed, 3);

        for handle in handles {
            assert_eq!(handle.wait().await.unwrap_err(), err);
        }
    }

    #[tokio::test]
    async fn test_missing_output_tensor_fails_every_slot() {
        let (batch, handles) = batch_of(&[0.0, 0.0]);
        let mut result = output(batch.id(), &[[1.0, 0.0], [0.0, 1.0]]);
        result.tensors[0].name = "other".to_string();

        embedding_postprocessor().complete(batch, Ok(result));

        for handle in handles {
            assert_eq!(handle.wait().await.unwrap_err().kind(), "executor_inference");
        }
    }

    #[tokio::test]
    async fn test_short_output_fails_only_missing_slots() {
        let (batch, handles) = batch_of(&[0.0, 0.0, 0.0]);
        let result = output(batch.id(), &[[1.0, 0.0], [0.0, 1.0]]);

        let report = embedding_postprocessor().complete(batch, Ok(result));
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);

        let outcomes: Vec<_> = futures::future::join_all(handles.into_iter().map(|h| h.wait())).await;
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_ok());
        assert_eq!(outcomes[2].as_ref().unwrap_err().kind(), "postprocess_error");
    }

    #[tokio::test]
    async fn test_extra_output_rows_fail_the_batch() {
        let (batch, handles) = batch_of(&[0.0, 0.0]);
        let result = output(batch.id(), &[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);

        let report = embedding_postprocessor().complete(batch, Ok(result));
        assert_eq!(report.failed, 2);

        for handle in handles {
            assert_eq!(handle.wait().await.unwrap_err().kind(), "executor_inference");
        }
    }

    #[tokio::test]
    async fn test_detection_options_apply_per_slot() {
        let postprocessor = Postprocessor {
            output_name: None,
            decoder: TaskDecoder::Detection(DetectionDecoder {
                score_threshold: 0.5,
                iou_threshold: 0.45,
                max_detections: 0,
                num_classes: Some(1),
                num_landmarks: 0,
                mask: false,
            }),
        };
        let (mut batch, handles) = batch_of(&[0.0, 0.0]);
        batch.requests_mut()[1].options = DecodeOptions {
            threshold: Some(0.2),
            limit: None,
        };
        // the same weak detection for both slots: [slot, channel, anchor]
        let head = ndarray::Array3::from_shape_fn((2, 5, 1), |(_, c, _)| {
            [1.0, 1.0, 1.0, 1.0, 0.3][c]
        });
        let result = BatchOutput {
            batch_id: batch.id(),
            ..BatchOutput::new(vec![NamedTensor {
                name: "output0".to_string(),
                data: head.into_dyn(),
            }])
        };

        postprocessor.complete(batch, Ok(result));

        let counts: Vec<usize> = futures::future::join_all(handles.into_iter().map(|h| h.wait()))
            .await
            .into_iter()
            .map(|outcome| match outcome.unwrap() {
                InferenceOutput::Detections { detections } => detections.len(),
                other => panic!("unexpected output {:?}", other),
            })
            .collect();
        assert_eq!(counts, vec![0, 1]);
    }

    #[test]
    fn test_decode_options_validation() {
        assert!(DecodeOptions::default().is_empty());
        assert!(DecodeOptions {
            threshold: Some(0.4),
            limit: Some(3),
        }
        .validate()
        .is_ok());

        let err = DecodeOptions {
            threshold: Some(1.5),
            limit: None,
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn test_slot_errors_are_isolated() {
        let (batch, handles) = batch_of(&[0.0, 0.0, 0.0]);
        let mut result = output(batch.id(), &[[1.0, 0.0], [0.0, 0.0], [0.0, 1.0]]);
        result.slot_errors = vec![None, Some("nan in output".to_string()), None];

        embedding_postprocessor().complete(batch, Ok(result));

        let outcomes: Vec<_> = futures::future::join_all(handles.into_iter().map(|h| h.wait())).await;
        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1].as_ref().unwrap_err().kind(), "executor_inference");
        assert!(outcomes[2].is_ok());
    }

    #[tokio::test]
    async fn test_misrouted_result_is_internal_error() {
        let (batch, handles) = batch_of(&[0.0]);
        let result = output(batch.id() + 1, &[[1.0, 0.0]]);

        embedding_postprocessor().complete(batch, Ok(result));

        let err = handles.into_iter().next().unwrap().wait().await.unwrap_err();
        assert_eq!(err.kind(), "internal_error");
    }

    #[tokio::test]
    async fn test_abandoned_callers_are_counted() {
        let (batch, mut handles) = batch_of(&[0.0, 0.0]);
        drop(handles.pop());
        let result = output(batch.id(), &[[1.0, 0.0], [0.0, 1.0]]);

        let report = embedding_postprocessor().complete(batch, Ok(result));
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.abandoned, 1);
    }

    #[test]
    fn test_scalar_tensor_is_rejected() {
        let result = BatchOutput {
            batch_id: 3,
            tensors: vec![NamedTensor {
                name: "fc1".to_string(),
                data: ArrayD::zeros(IxDyn(&[])),
            }],
            slot_errors: Vec::new(),
        };
        let err = embedding_postprocessor().check(3, result).unwrap_err();
        assert_eq!(err.kind(), "executor_inference");
    }

    #[test]
    fn test_inference_output_serializes_with_type_tag() {
        let output = InferenceOutput::Embedding(Embedding {
            vector: vec![3.0, 4.0],
            norm: 5.0,
            normalized: None,
        });
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["type"], "embedding");
        assert_eq!(json["norm"], 5.0);
        assert!(json.get("normalized").is_none());
    }
}
