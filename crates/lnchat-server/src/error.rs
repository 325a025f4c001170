use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use lnchat_shared::{ChatError, ErrorKind};

/// A [`ChatError`] leaving through HTTP.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ChatError::invalid_argument(rejection.body_text()))
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::InvalidAddress | ErrorKind::InvalidArgument | ErrorKind::DecodeError => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::PermissionError => StatusCode::FORBIDDEN,
        ErrorKind::NetworkError => StatusCode::BAD_GATEWAY,
        ErrorKind::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::InternalError | ErrorKind::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, source = ?std::error::Error::source(&self.0), "request failed");
            "internal server error".to_string()
        } else {
            self.0.description().to_string()
        };

        let body = serde_json::json!({
            "kind": kind.as_str(),
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_not_found_body() {
        let response = ApiError(ChatError::discussion_not_found(7)).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "not_found");
        assert!(body["error"].as_str().unwrap().contains('7'));
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let response = ApiError(ChatError::internal("database exploded")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "internal_error");
        assert_eq!(body["error"], "internal server error");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::DecodeError), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorKind::InsufficientBalance),
            StatusCode::PAYMENT_REQUIRED
        );
    }
}
