//! Error types for the Beer API server.
//!
//! # Error Types
//!
//! - [`ApiError`] - Failures returned from HTTP handlers, rendered as
//!   JSON:API error documents
//! - [`FieldError`] - One failed input check inside [`ApiError::Validation`]
//! - [`ServerError`] - Top-level startup and runtime errors for the binary
//!
//! Module-specific errors ([`crate::auth::AuthError`],
//! [`crate::store::StoreError`]) convert into [`ApiError`] so handlers can use
//! `?` throughout.
//!
//! # Example
//!
//! ```rust
//! use beerapi_server::error::{ApiError, FieldError};
//! use serde_json::json;
//!
//! let err = ApiError::Validation(vec![FieldError::body(
//!     "username",
//!     json!(""),
//!     "username can't be empty",
//! )]);
//! assert!(err.is_client_error());
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error};
use validator::ValidationErrors;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::store::StoreError;

/// Generic message sent to clients for server-side failures.
const INTERNAL_ERROR_TITLE: &str = "Something broke!";

/// Where a rejected input value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Body,
    Params,
    Query,
}

/// A single failed input check.
///
/// Serializes as `{"value", "msg", "param", "location"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    /// The offending value as received (`null` when absent).
    pub value: Value,
    /// Human-readable explanation.
    pub msg: String,
    /// Name of the field.
    pub param: String,
    /// Part of the request the field was read from.
    pub location: Location,
}

impl FieldError {
    /// Creates a field error for a request body member.
    pub fn body(param: impl Into<String>, value: Value, msg: impl Into<String>) -> Self {
        Self {
            value,
            msg: msg.into(),
            param: param.into(),
            location: Location::Body,
        }
    }

    /// Creates a field error for a path parameter.
    pub fn params(param: impl Into<String>, value: Value, msg: impl Into<String>) -> Self {
        Self {
            value,
            msg: msg.into(),
            param: param.into(),
            location: Location::Params,
        }
    }

    /// Creates a field error for a query string parameter.
    pub fn query(param: impl Into<String>, value: Value, msg: impl Into<String>) -> Self {
        Self {
            value,
            msg: msg.into(),
            param: param.into(),
            location: Location::Query,
        }
    }
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// One or more input checks failed.
    #[error("validation failed ({} field error(s))", .0.len())]
    Validation(Vec<FieldError>),

    /// Missing or invalid credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but not allowed to act on this resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request body is not `application/json`.
    #[error("unsupported media type, expected application/json")]
    UnsupportedMediaType,

    /// Unexpected server-side failure. The detail is logged, never sent.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Creates a validation error with a single field error.
    pub fn field(error: FieldError) -> Self {
        Self::Validation(vec![error])
    }

    /// Converts `validator` failures on a JSON body into field errors.
    ///
    /// `fields` lists `(field, wire name)` pairs in reporting order. Only the
    /// first failure per field is reported, prefixed with the wire name.
    pub fn from_validation(
        errors: &ValidationErrors,
        body: &Map<String, Value>,
        fields: &[(&str, &str)],
    ) -> Self {
        let by_field = errors.field_errors();
        let mut reported = Vec::new();

        for &(field, wire) in fields {
            let Some(first) = by_field
                .get(field)
                .or_else(|| by_field.get(wire))
                .and_then(|errs| errs.first())
            else {
                continue;
            };
            let reason = first.message.as_deref().unwrap_or(&*first.code);
            reported.push(FieldError::body(
                wire,
                body.get(wire).cloned().unwrap_or(Value::Null),
                format!("{wire} {reason}"),
            ));
        }

        Self::Validation(reported)
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status code for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true if this error was caused by the client's request.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Returns true if this error is a server-side failure.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }

    fn title(&self) -> String {
        match self {
            Self::Unauthorized(msg) | Self::Forbidden(msg) | Self::NotFound(msg) => msg.clone(),
            Self::UnsupportedMediaType => "Content-Type must be application/json".to_string(),
            Self::Validation(_) | Self::Internal(_) => INTERNAL_ERROR_TITLE.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            Self::Validation(errors) => {
                debug!(errors = errors.len(), "Request rejected by validation");
                json!({ "errors": errors })
            }
            Self::Internal(detail) => {
                error!(error = %detail, "Request failed with internal error");
                json!({ "errors": [{ "status": status.as_str(), "title": self.title() }] })
            }
            _ => {
                debug!(status = status.as_u16(), error = %self, "Request rejected");
                json!({ "errors": [{ "status": status.as_str(), "title": self.title() }] })
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            StoreError::InvalidId(ref id) => Self::field(FieldError::params(
                "id",
                Value::String(id.clone()),
                "id must be a 24 character hex string",
            )),
            StoreError::AuthorNotFound(_) => Self::Unauthorized("user no longer exists".to_string()),
            StoreError::DuplicateUsername(ref username) => Self::field(FieldError::body(
                "username",
                Value::String(username.clone()),
                "username already in use",
            )),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        if err.is_server_error() {
            Self::Internal(err.to_string())
        } else {
            Self::Unauthorized(err.to_string())
        }
    }
}

/// Top-level error type for the server binary.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Binding or serving the listener failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for HTTP handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn field_error_serializes_with_lowercase_location() {
        let err = FieldError::params("id", json!("616;^"), "id must be alphanumeric");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({
                "value": "616;^",
                "msg": "id must be alphanumeric",
                "param": "id",
                "location": "params"
            })
        );
    }

    #[test]
    fn status_codes_match_variants() {
        assert_eq!(ApiError::Validation(vec![]).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::UnsupportedMediaType.status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(ApiError::internal("x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn client_and_server_classification() {
        assert!(ApiError::Forbidden("x".into()).is_client_error());
        assert!(!ApiError::Forbidden("x".into()).is_server_error());
        assert!(ApiError::internal("x").is_server_error());
        assert!(!ApiError::internal("x").is_client_error());
    }

    #[tokio::test]
    async fn validation_error_renders_field_list() {
        let (status, body) = body_json(ApiError::Validation(vec![
            FieldError::body("name", Value::Null, "name can't be empty"),
            FieldError::query("id", json!("a b"), "id must be alphanumeric"),
        ]))
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
        assert_eq!(body["errors"][0]["param"], "name");
        assert_eq!(body["errors"][0]["location"], "body");
        assert_eq!(body["errors"][1]["location"], "query");
    }

    #[tokio::test]
    async fn forbidden_renders_status_and_title() {
        let (status, body) =
            body_json(ApiError::Forbidden("You can delete only your account!".into())).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(
            body,
            json!({"errors": [{"status": "403", "title": "You can delete only your account!"}]})
        );
    }

    #[tokio::test]
    async fn internal_error_hides_detail() {
        let (status, body) = body_json(ApiError::internal("lock poisoned at store.rs")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["errors"][0]["title"], INTERNAL_ERROR_TITLE);
        assert!(!body.to_string().contains("store.rs"));
    }

    #[test]
    fn store_errors_convert() {
        let not_found: ApiError = StoreError::NotFound {
            collection: "beer",
            id: "0".repeat(24),
        }
        .into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let duplicate: ApiError = StoreError::DuplicateUsername("JoDo".into()).into();
        match duplicate {
            ApiError::Validation(errors) => {
                assert_eq!(errors[0].param, "username");
                assert_eq!(errors[0].msg, "username already in use");
            }
            other => panic!("expected validation error, got {other:?}"),
        }

        let invalid: ApiError = StoreError::InvalidId("nope".into()).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let gone: ApiError = StoreError::AuthorNotFound("a".repeat(24)).into();
        assert_eq!(gone.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn validation_errors_follow_field_order() {
        use std::borrow::Cow;
        use validator::ValidationError;

        let mut errors = ValidationErrors::new();
        let mut blank = ValidationError::new("blank");
        blank.message = Some(Cow::Borrowed("can't be empty"));
        errors.add("picture", blank);
        errors.add("brewery_id", ValidationError::new("object_id"));

        let mut body = Map::new();
        body.insert("breweryId".to_string(), json!("616;^"));

        let err = ApiError::from_validation(
            &errors,
            &body,
            &[("brewery_id", "breweryId"), ("picture", "picture")],
        );
        let ApiError::Validation(reported) = err else {
            panic!("expected validation error");
        };
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].param, "breweryId");
        assert_eq!(reported[0].value, json!("616;^"));
        assert_eq!(reported[0].msg, "breweryId object_id");
        assert_eq!(reported[1].msg, "picture can't be empty");
        assert_eq!(reported[1].value, Value::Null);
    }

    #[test]
    fn auth_errors_convert() {
        let unauthorized: ApiError = AuthError::MissingToken.into();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let internal: ApiError = AuthError::Hashing("out of memory".into()).into();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn config_error_converts_to_server_error() {
        let err: ServerError = ConfigError::MissingEnvVar("BEERAPI_SECRET_KEY".into()).into();
        assert_eq!(
            err.to_string(),
            "configuration error: missing required environment variable: BEERAPI_SECRET_KEY"
        );
    }
}
