//! Bearer-token authentication
//!
//! Driven by the `APIKEY` environment variable: empty disables the gate;
//! otherwise every request must carry `Authorization: Bearer <APIKEY>`
//! exactly, or it is rejected with 403.

use crate::response::CODE_FORBIDDEN;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The configured API key; an empty key disables authentication
#[derive(Clone)]
pub struct ApiKey(pub String);

impl ApiKey {
    /// Read the key from the `APIKEY` environment variable
    pub fn from_env() -> Self {
        Self(std::env::var("APIKEY").unwrap_or_default())
    }
}

/// Middleware enforcing the bearer-token gate
pub async fn require_bearer(
    State(key): State<ApiKey>,
    request: Request,
    next: Next,
) -> Response {
    if key.0.is_empty() {
        return next.run(request).await;
    }

    let expected = format!("Bearer {}", key.0);
    let presented = request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok());
    if presented != Some(expected.as_str()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "code": CODE_FORBIDDEN, "msg": "forbidden" })),
        )
            .into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn router(key: &str) -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn_with_state(
                ApiKey(key.to_string()),
                require_bearer,
            ))
    }

    #[tokio::test]
    async fn test_disabled_when_key_empty() {
        let response = router("")
            .oneshot(HttpRequest::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_header_is_forbidden() {
        let response = router("secret")
            .oneshot(HttpRequest::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_exact_match_passes() {
        let response = router("secret")
            .oneshot(
                HttpRequest::get("/ping")
                    .header("Authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wrong_token_is_forbidden() {
        let response = router("secret")
            .oneshot(
                HttpRequest::get("/ping")
                    .header("Authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // prefix or case variations are not accepted
        let response = router("secret")
            .oneshot(
                HttpRequest::get("/ping")
                    .header("Authorization", "bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
