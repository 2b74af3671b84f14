//! Error envelope helpers: every user-visible error is
//! `{error, message?, details?}` with the taxonomy in the `error` field.

use crate::controller::ControllerError;
use crate::status::StatusError;
use crate::store::StoreError;
use ap_protocol::HttpErrorEnvelope;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::fmt::Display;

pub(crate) fn json_error(
    status: StatusCode,
    error: impl Into<String>,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            error: error.into(),
            message: Some(message.into()),
            details: None,
        }),
    )
        .into_response()
}

pub fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, "validation", message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, "not_found", message)
}

pub fn conflict(message: impl Into<String>) -> Response {
    json_error(StatusCode::CONFLICT, "conflict", message)
}

pub fn not_ready(message: impl Into<String>) -> Response {
    json_error(StatusCode::CONFLICT, "not_ready", message)
}

pub fn unauthorized(message: impl Into<String>) -> Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

pub fn queue_saturated(message: impl Into<String>) -> Response {
    json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_saturation", message)
}

pub fn upstream_error(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_GATEWAY, "upstream_error", message)
}

pub fn internal_error(err: impl Display) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

pub fn store_error(err: &StoreError) -> Response {
    match err {
        StoreError::NotFound(message) => not_found(message.clone()),
        StoreError::Validation(message) => bad_request(message.clone()),
        StoreError::Conflict(message) => conflict(message.clone()),
        other => internal_error(other),
    }
}

pub fn controller_error(err: &ControllerError) -> Response {
    match err {
        ControllerError::NotFound(message) => not_found(message.clone()),
        ControllerError::NotReady(message) => not_ready(message.clone()),
        ControllerError::Validation(message) => bad_request(message.clone()),
        ControllerError::Invariant(message) => internal_error(message),
        ControllerError::Store(inner) => store_error(inner),
        ControllerError::Payload(inner) => internal_error(inner),
    }
}

pub fn status_error(err: &StatusError) -> Response {
    match err {
        StatusError::InvalidTransition { .. } => bad_request(err.to_string()),
        StatusError::Store(inner) => store_error(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn assert_error_response(
        response: Response,
        expected_status: StatusCode,
        expected_error: &str,
        expected_message: &str,
    ) {
        assert_eq!(response.status(), expected_status);

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed: HttpErrorEnvelope =
            serde_json::from_slice(&body).expect("response body should be valid error json");

        assert_eq!(parsed.error, expected_error);
        assert_eq!(parsed.message.as_deref(), Some(expected_message));
        assert_eq!(parsed.details, None);
    }

    #[tokio::test]
    async fn bad_request_uses_the_validation_code() {
        assert_error_response(
            bad_request("target is malformed"),
            StatusCode::BAD_REQUEST,
            "validation",
            "target is malformed",
        )
        .await;
    }

    #[tokio::test]
    async fn not_found_uses_the_not_found_code() {
        assert_error_response(
            not_found("execution missing"),
            StatusCode::NOT_FOUND,
            "not_found",
            "execution missing",
        )
        .await;
    }

    #[tokio::test]
    async fn queue_saturated_maps_to_503() {
        assert_error_response(
            queue_saturated("async execution queue is full"),
            StatusCode::SERVICE_UNAVAILABLE,
            "queue_saturation",
            "async execution queue is full",
        )
        .await;
    }

    #[tokio::test]
    async fn store_errors_map_by_kind() {
        assert_error_response(
            store_error(&StoreError::NotFound("execution 'x'".to_owned())),
            StatusCode::NOT_FOUND,
            "not_found",
            "execution 'x'",
        )
        .await;
        assert_error_response(
            store_error(&StoreError::Validation("bad url".to_owned())),
            StatusCode::BAD_REQUEST,
            "validation",
            "bad url",
        )
        .await;
        assert_error_response(
            store_error(&StoreError::Conflict("duplicate".to_owned())),
            StatusCode::CONFLICT,
            "conflict",
            "duplicate",
        )
        .await;
    }

    #[tokio::test]
    async fn controller_not_ready_maps_to_conflict_with_not_ready_code() {
        assert_error_response(
            controller_error(&ControllerError::NotReady(
                "agent node 'n' is not ready".to_owned(),
            )),
            StatusCode::CONFLICT,
            "not_ready",
            "agent node 'n' is not ready",
        )
        .await;
    }
}
