use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_session::ValidatorError;
use serde::Serialize;
use thiserror::Error;

use crate::check::CheckStatus;

/// Failures that prevent the gateway from producing a verdict.
///
/// A rejected credential is not an error; it is a normal `UNAUTHORIZED`
/// verdict. Every variant here means "could not determine".
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session validator unavailable")]
    ServiceUnavailable(#[source] ValidatorError),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    status: CheckStatus,
    valid: bool,
    error: ErrorDetails<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetails<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        };

        let mut response = Json(ErrorBody {
            status: CheckStatus::ServiceUnavailable,
            valid: false,
            error: ErrorDetails {
                code,
                message: self.to_string(),
            },
        })
        .into_response();
        *response.status_mut() = status;
        response
    }
}

impl From<ValidatorError> for ApiError {
    fn from(error: ValidatorError) -> Self {
        ApiError::ServiceUnavailable(error)
    }
}
