use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use idm_completion::CompletionError;
use idm_db::StoreError;

/// Every failure a handler can report. Mapped to a status code and a
/// `{success: false, message}` body; internal details stay in the log.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),

    /// The user's message is stored but no reply was produced.
    #[error("chat turn in conversation {conversation_id} failed: {source}")]
    ChatTurn {
        source: CompletionError,
        conversation_id: i64,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<i64>,
}

fn completion_status(e: &CompletionError) -> (StatusCode, String) {
    match e {
        CompletionError::Upstream { status, body } => {
            warn!("completion upstream error {}: {}", status, body);
            (
                StatusCode::BAD_GATEWAY,
                format!("completion service returned an error (status {})", status),
            )
        }
        CompletionError::Network(msg) => {
            warn!("completion service unreachable: {}", msg);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "completion service unavailable, please retry".to_string(),
            )
        }
        other => {
            error!("completion error: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut retryable = None;
        let mut conversation_id = None;

        let (status, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            ApiError::ChatTurn {
                source,
                conversation_id: id,
            } => {
                retryable = Some(source.is_retryable());
                conversation_id = Some(id);
                completion_status(&source)
            }
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                message,
                retryable,
                conversation_id,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<StoreError>() {
            Some(conflict) => ApiError::Conflict(conflict.to_string()),
            None => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn render(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn internal_details_are_not_leaked() {
        let (status, body) = render(ApiError::Internal("disk I/O error at /var/db".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "internal server error");
    }

    #[tokio::test]
    async fn store_conflict_maps_to_409() {
        let err: ApiError = anyhow::Error::from(StoreError::Conflict { field: "email" }).into();
        let (status, body) = render(err).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "email already exists");
    }

    #[tokio::test]
    async fn failed_chat_turn_is_retryable_only_for_network_errors() {
        let (status, body) = render(ApiError::ChatTurn {
            source: CompletionError::Network("timed out".into()),
            conversation_id: 7,
        })
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retryable"], true);
        assert_eq!(body["conversationId"], 7);

        let (status, body) = render(ApiError::ChatTurn {
            source: CompletionError::Upstream {
                status: 400,
                body: "bad request".into(),
            },
            conversation_id: 7,
        })
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["retryable"], false);
    }
}
