//! Wire types and client for the KServe v2 `GRPCInferenceService`, the
//! protocol spoken by Triton and compatible model servers.

tonic::include_proto!("inference");

pub use grpc_inference_service_client::GrpcInferenceServiceClient;
pub use model_infer_request::{InferInputTensor, InferRequestedOutputTensor};
pub use model_infer_response::InferOutputTensor;
