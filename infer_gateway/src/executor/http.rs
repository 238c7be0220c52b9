use super::{InferenceBackend, ModelTarget};
use crate::{
    error::ExecutorError,
    postprocess::{BatchOutput, NamedTensor},
};
use ndarray::{Array4, ArrayD, IxDyn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tonic::async_trait;

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    inputs: Vec<InputTensor<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    outputs: Vec<RequestedOutput<'a>>,
}

#[derive(Debug, Serialize)]
struct InputTensor<'a> {
    name: &'a str,
    shape: Vec<usize>,
    datatype: &'static str,
    data: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct RequestedOutput<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    outputs: Vec<OutputTensor>,
}

#[derive(Debug, Deserialize)]
struct OutputTensor {
    name: String,
    shape: Vec<usize>,
    datatype: String,
    data: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// KServe v2 REST inference protocol.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ExecutorError::transport(format!("failed to build http client: {}", e)))?;

        tracing::info!("Created HTTP executor client for {}", url);
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
        })
    }

    fn model_url(&self, target: &ModelTarget) -> String {
        if target.version.is_empty() {
            format!("{}/v2/models/{}", self.base_url, target.name)
        } else {
            format!(
                "{}/v2/models/{}/versions/{}",
                self.base_url, target.name, target.version
            )
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn infer(
        &self,
        target: &ModelTarget,
        input: &Array4<f32>,
    ) -> Result<BatchOutput, ExecutorError> {
        let body = InferRequest {
            inputs: vec![InputTensor {
                name: &target.input_name,
                shape: input.shape().to_vec(),
                datatype: "FP32",
                data: input.iter().copied().collect(),
            }],
            outputs: target
                .output_name
                .iter()
                .map(|name| RequestedOutput { name })
                .collect(),
        };

        let response = self
            .client
            .post(format!("{}/infer", self.model_url(target)))
            .json(&body)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(map_status(status, detail));
        }

        let parsed: InferResponse = response.json().await.map_err(|e| {
            ExecutorError::inference(format!("malformed inference response: {}", e))
        })?;
        parse_outputs(parsed)
    }

    async fn ready(&self, target: &ModelTarget) -> Result<bool, ExecutorError> {
        let response = self
            .client
            .get(format!("{}/ready", self.model_url(target)))
            .send()
            .await
            .map_err(map_request_error)?;

        Ok(response.status().is_success())
    }
}

fn parse_outputs(response: InferResponse) -> Result<BatchOutput, ExecutorError> {
    let tensors = response
        .outputs
        .into_iter()
        .map(|output| {
            if output.datatype != "FP32" {
                return Err(ExecutorError::inference(format!(
                    "output `{}` has datatype {}, expected FP32",
                    output.name, output.datatype
                )));
            }
            let data = ArrayD::from_shape_vec(IxDyn(&output.shape), output.data).map_err(|e| {
                ExecutorError::inference(format!(
                    "output `{}` does not match its shape {:?}: {}",
                    output.name, output.shape, e
                ))
            })?;
            Ok(NamedTensor {
                name: output.name,
                data,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BatchOutput::new(tensors))
}

fn map_request_error(err: reqwest::Error) -> ExecutorError {
    if err.is_timeout() {
        ExecutorError::timeout(err.to_string())
    } else {
        ExecutorError::transport(err.to_string())
    }
}

fn map_status(status: StatusCode, detail: String) -> ExecutorError {
    let detail = format!("{}: {}", status.as_u16(), detail);
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ExecutorError::transport(detail)
        }
        _ => ExecutorError::inference(detail),
    }
}
