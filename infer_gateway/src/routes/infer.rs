use crate::{
    error::{ExecutorErrorKind, GatewayError},
    pipeline::VariantInfo,
    postprocess::{DecodeOptions, InferenceOutput},
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::instrument;

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Decode(_) | GatewayError::Shape(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::UnknownModel(_) => StatusCode::NOT_FOUND,
            GatewayError::Overloaded(_) | GatewayError::RequestTimeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Executor(e) if e.kind != ExecutorErrorKind::Inference => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Executor(_)
            | GatewayError::Postprocess(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
pub struct ModelList {
    models: Vec<VariantInfo>,
}

pub async fn list_models(State(state): State<SharedState>) -> Json<ModelList> {
    Json(ModelList {
        models: state.gateway.variants(),
    })
}

/// `?threshold=` and `?limit=` override a detection model's score threshold
/// and detection limit for this request.
#[instrument(skip(state, options, image_data))]
pub async fn infer(
    State(state): State<SharedState>,
    Path(model): Path<String>,
    options: Result<Query<DecodeOptions>, QueryRejection>,
    image_data: Bytes,
) -> Result<Json<InferenceOutput>, GatewayError> {
    let Query(options) = options.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let output = state.gateway.infer_with(&model, image_data, options).await?;
    Ok(Json(output))
}
