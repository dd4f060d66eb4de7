//! HTTP rendering of ledger errors: the status travels as the response code,
//! the body is the serialized `{code, message}` pair.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cgs_governance::ServiceError;

#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = %self.0.code, message = %self.0.message, "request failed");
        } else {
            tracing::debug!(code = %self.0.code, message = %self.0.message, "request rejected");
        }
        (status, Json(self.0)).into_response()
    }
}
