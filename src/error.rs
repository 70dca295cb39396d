//! Error codes and JSON error responses for the control-plane API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const ERROR_HEADER: &str = "X-Edgeplane-Error";

/// Error codes for API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown route or resource
    NotFound,
    /// Route exists but not for this method
    MethodNotAllowed,
    /// Malformed or invalid request body
    BadRequest,
    /// Request body over the size limit
    PayloadTooLarge,
    /// Another deployment holds the lock
    DeploymentInProgress,
    /// Storage or other internal failure
    InternalError,
}

impl ApiErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiErrorCode::DeploymentInProgress => StatusCode::CONFLICT,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Edgeplane-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ApiErrorCode::BadRequest => "BAD_REQUEST",
            ApiErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ApiErrorCode::DeploymentInProgress => "DEPLOYMENT_IN_PROGRESS",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ApiErrorCode,
    /// Human-readable error message
    pub error: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, error: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            error: error.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","error":"internal error","status":{}}}"#,
                self.code.as_header_value(),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the X-Edgeplane-Error header
pub fn json_error_response(code: ApiErrorCode, error: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, error).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header(ERROR_HEADER, code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ApiErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiErrorCode::DeploymentInProgress.status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiErrorCode::BadRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let json = ErrorResponse::new(ApiErrorCode::NotFound, "No route for GET /nope").to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"error\":\"No route for GET /nope\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ApiErrorCode::DeploymentInProgress, "busy");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(
            response.headers().get(ERROR_HEADER).unwrap(),
            "DEPLOYMENT_IN_PROGRESS"
        );
    }
}
