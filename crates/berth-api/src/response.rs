//! The response envelope
//!
//! Every endpoint answers `{ code, msg, data }`: code 0 on success, a
//! business code derived from the error kind otherwise. The HTTP status
//! comes from the error's own mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use berth_core::Error;
use serde::Serialize;
use serde_json::json;

/// Business code for a successful response
pub const CODE_OK: i32 = 0;
/// Business code attached to auth rejections
pub const CODE_FORBIDDEN: i32 = 40300;

/// Map an error kind to its business code
pub fn business_code(error: &Error) -> i32 {
    match error {
        Error::InvalidMemoryFormat(_) => 40001,
        Error::InvalidRequest(_) => 40002,
        Error::NotExistInStore(_) => 40401,
        Error::NotFound(_) => 40402,
        Error::ContainerExisted(_) => 40901,
        Error::NoRollbackRequired(_) => 40902,
        Error::GpuNotEnough { .. } => 42201,
        Error::CpuNotEnough { .. } => 42202,
        Error::PortNotEnough { .. } => 42203,
        Error::Runtime(_) => 50201,
        Error::Store(_) => 50202,
        _ => 50000,
    }
}

/// Successful envelope with payload
pub fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "code": CODE_OK, "msg": "success", "data": data })),
    )
        .into_response()
}

/// Successful envelope without payload
pub fn ok_empty() -> Response {
    (
        StatusCode::OK,
        Json(json!({ "code": CODE_OK, "msg": "success" })),
    )
        .into_response()
}

/// Error wrapper so handlers can use `?` on controller calls
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(json!({ "code": business_code(&self.0), "msg": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Result alias for handler functions
pub type ApiResult = std::result::Result<Response, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_codes() {
        assert_eq!(
            business_code(&Error::GpuNotEnough {
                requested: 2,
                free: 0
            }),
            42201
        );
        assert_eq!(business_code(&Error::ContainerExisted("job".into())), 40901);
        assert_eq!(business_code(&Error::NoRollbackRequired(1)), 40902);
        assert_eq!(
            business_code(&Error::NotExistInStore("containers/job".into())),
            40401
        );
        assert_eq!(business_code(&Error::internal("boom")), 50000);
    }

    #[test]
    fn test_error_response_status() {
        let response = ApiError(Error::NoRollbackRequired(3)).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = ApiError(Error::runtime("create failed")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
