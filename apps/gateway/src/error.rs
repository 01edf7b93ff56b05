use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use botgate_core::GatewayError;
use botgate_store::StoreError;
use serde_json::json;

/// Response-side wrapper carrying the HTTP mapping for gateway errors.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self(GatewayError::NotFound(what)),
            other => Self(GatewayError::Internal(anyhow::Error::new(other))),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            GatewayError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, self.0.to_string()),
            GatewayError::PermissionDenied => (StatusCode::FORBIDDEN, self.0.to_string()),
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            GatewayError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            GatewayError::RateLimited { retry_after_secs } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "ok": false, "error": "rate limited" })),
                )
                    .into_response();
                if let Ok(value) = retry_after_secs.to_string().parse() {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return response;
            }
            GatewayError::Internal(err) => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        };
        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_the_contract_statuses() {
        let cases = [
            (
                ApiError(GatewayError::unauthenticated("x")),
                StatusCode::UNAUTHORIZED,
            ),
            (ApiError(GatewayError::PermissionDenied), StatusCode::FORBIDDEN),
            (ApiError(GatewayError::not_found("x")), StatusCode::NOT_FOUND),
            (ApiError(GatewayError::invalid("x")), StatusCode::BAD_REQUEST),
            (
                ApiError(GatewayError::Internal(anyhow::anyhow!("boom"))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = ApiError(GatewayError::RateLimited {
            retry_after_secs: 7,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "7"
        );
    }
}
