//! Machine-readable API errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use shared_types::ApiErrorBody;

use crate::dispatch::DispatchError;
use crate::limits::AdmissionError;
use crate::run::RunStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    InvalidRequest,
    CrewNotFound,
    RunNotFound,
    RunTerminal,
    RateLimited,
    QuotaExceeded,
    DispatchUnavailable,
    MissionBusUnavailable,
    InternalError,
}

impl ApiErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiErrorCode::InvalidRequest => "INVALID_REQUEST",
            ApiErrorCode::CrewNotFound => "CREW_NOT_FOUND",
            ApiErrorCode::RunNotFound => "RUN_NOT_FOUND",
            ApiErrorCode::RunTerminal => "RUN_TERMINAL",
            ApiErrorCode::RateLimited => "RATE_LIMITED",
            ApiErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ApiErrorCode::DispatchUnavailable => "DISPATCH_UNAVAILABLE",
            ApiErrorCode::MissionBusUnavailable => "MISSION_BUS_UNAVAILABLE",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            ApiErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::CrewNotFound | ApiErrorCode::RunNotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::RunTerminal => StatusCode::CONFLICT,
            ApiErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiErrorCode::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            ApiErrorCode::DispatchUnavailable | ApiErrorCode::MissionBusUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retryable(self) -> bool {
        matches!(
            self,
            ApiErrorCode::RateLimited
                | ApiErrorCode::DispatchUnavailable
                | ApiErrorCode::MissionBusUnavailable
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code.as_str().to_string(),
            message: self.message,
            retryable: self.code.retryable(),
        };
        (self.code.status_code(), Json(body)).into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        let code = match e {
            AdmissionError::RateLimited { .. } => ApiErrorCode::RateLimited,
            AdmissionError::QuotaExceeded { .. } => ApiErrorCode::QuotaExceeded,
        };
        ApiError::new(code, e.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError::new(ApiErrorCode::DispatchUnavailable, e.to_string())
    }
}

impl From<RunStoreError> for ApiError {
    fn from(e: RunStoreError) -> Self {
        tracing::error!(error = %e, "Run store error");
        ApiError::new(ApiErrorCode::InternalError, "run store unavailable")
    }
}
