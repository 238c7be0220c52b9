use super::{InferenceBackend, ModelTarget};
use crate::{
    error::ExecutorError,
    postprocess::{BatchOutput, NamedTensor},
};
use kserve_proto::{
    GrpcInferenceServiceClient, InferInputTensor, InferRequestedOutputTensor, ModelInferRequest,
    ModelInferResponse, ModelReadyRequest,
};
use ndarray::{Array4, ArrayD, IxDyn};
use std::time::Duration;
use tonic::{
    async_trait,
    transport::{Channel, Endpoint},
    Code, Request, Status,
};

const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// KServe v2 `ModelInfer` over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcBackend {
    client: GrpcInferenceServiceClient<Channel>,
}

impl GrpcBackend {
    /// Creates a lazily connected channel; the readiness check is what
    /// first reaches the server.
    pub fn connect(url: &str, connect_timeout: Duration) -> Result<Self, ExecutorError> {
        let channel = Endpoint::from_shared(url.to_string())
            .map_err(|e| ExecutorError::transport(format!("invalid executor url {}: {}", url, e)))?
            .connect_timeout(connect_timeout)
            .connect_lazy();

        let client = GrpcInferenceServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);

        tracing::info!("Created gRPC executor client for {}", url);
        Ok(Self { client })
    }
}

#[async_trait]
impl InferenceBackend for GrpcBackend {
    fn name(&self) -> &'static str {
        "grpc"
    }

    async fn infer(
        &self,
        target: &ModelTarget,
        input: &Array4<f32>,
    ) -> Result<BatchOutput, ExecutorError> {
        let request = build_request(target, input);
        let response = self
            .client
            .clone()
            .model_infer(Request::new(request))
            .await
            .map_err(map_status)?;

        parse_response(response.into_inner())
    }

    async fn ready(&self, target: &ModelTarget) -> Result<bool, ExecutorError> {
        let request = ModelReadyRequest {
            name: target.name.clone(),
            version: target.version.clone(),
        };
        let response = self
            .client
            .clone()
            .model_ready(Request::new(request))
            .await
            .map_err(map_status)?;

        Ok(response.into_inner().ready)
    }
}

fn build_request(target: &ModelTarget, input: &Array4<f32>) -> ModelInferRequest {
    let raw: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();

    ModelInferRequest {
        model_name: target.name.clone(),
        model_version: target.version.clone(),
        id: String::new(),
        inputs: vec![InferInputTensor {
            name: target.input_name.clone(),
            datatype: "FP32".to_string(),
            shape: input.shape().iter().map(|d| *d as i64).collect(),
            ..Default::default()
        }],
        outputs: target
            .output_name
            .iter()
            .map(|name| InferRequestedOutputTensor {
                name: name.clone(),
                ..Default::default()
            })
            .collect(),
        raw_input_contents: vec![raw],
        ..Default::default()
    }
}

fn parse_response(response: ModelInferResponse) -> Result<BatchOutput, ExecutorError> {
    let use_raw = !response.raw_output_contents.is_empty();
    if use_raw && response.raw_output_contents.len() != response.outputs.len() {
        return Err(ExecutorError::inference(format!(
            "response has {} outputs but {} raw contents",
            response.outputs.len(),
            response.raw_output_contents.len()
        )));
    }

    let mut tensors = Vec::with_capacity(response.outputs.len());
    for (index, output) in response.outputs.into_iter().enumerate() {
        if output.datatype != "FP32" {
            return Err(ExecutorError::inference(format!(
                "output `{}` has datatype {}, expected FP32",
                output.name, output.datatype
            )));
        }

        let shape = output
            .shape
            .iter()
            .map(|d| usize::try_from(*d))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| {
                ExecutorError::inference(format!(
                    "output `{}` has a negative dimension: {:?}",
                    output.name, output.shape
                ))
            })?;

        let data = if use_raw {
            let raw = &response.raw_output_contents[index];
            if raw.len() % 4 != 0 {
                return Err(ExecutorError::inference(format!(
                    "raw contents of `{}` are not a whole number of FP32 values",
                    output.name
                )));
            }
            raw.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        } else {
            output
                .contents
                .map(|c| c.fp32_contents)
                .unwrap_or_default()
        };

        let data = ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| {
            ExecutorError::inference(format!(
                "output `{}` does not match its shape {:?}: {}",
                output.name, shape, e
            ))
        })?;
        tensors.push(NamedTensor {
            name: output.name,
            data,
        });
    }

    Ok(BatchOutput::new(tensors))
}

fn map_status(status: Status) -> ExecutorError {
    let detail = format!("{:?}: {}", status.code(), status.message());
    match status.code() {
        Code::Unavailable | Code::Unknown | Code::Aborted | Code::Cancelled => {
            ExecutorError::transport(detail)
        }
        Code::DeadlineExceeded => ExecutorError::timeout(detail),
        _ => ExecutorError::inference(detail),
    }
}
