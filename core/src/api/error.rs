// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! API error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::fmt;

use crate::api::models::ErrorResponse;
use crate::cluster::types::ClusterError;

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP wrapper around [`ClusterError`].
///
/// Every error response carries the stable wire kind and a human message,
/// so clients can distinguish retryable from non-retryable failures by
/// kind alone.
#[derive(Debug, Clone)]
pub struct ApiError(
    /// The underlying cluster error
    pub ClusterError,
);

impl ApiError {
    /// Status code for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            ClusterError::BadRequest(_) | ClusterError::UnsupportedCapability(_) => {
                StatusCode::BAD_REQUEST
            }
            ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::AlreadyTerminal { .. } | ClusterError::AddressConflict(_) => {
                StatusCode::CONFLICT
            }
            ClusterError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            ClusterError::NodeUnreachable(_) | ClusterError::TransportDropped(_) => {
                StatusCode::BAD_GATEWAY
            }
            ClusterError::RpcTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ClusterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0.kind(), self.0)
    }
}

impl std::error::Error for ApiError {}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            kind: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(ClusterError::NotFound("job".to_string())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(ClusterError::QueueFull(10)).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError(ClusterError::AddressConflict("addr".to_string())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(ClusterError::RpcTimeout("execute".to_string())).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_display_carries_kind() {
        let err = ApiError(ClusterError::NotFound("job j-1 not found".to_string()));
        let text = err.to_string();
        assert!(text.starts_with("not-found:"));
        assert!(text.contains("j-1"));
    }
}
