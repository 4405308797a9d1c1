//! Error types for Switchyard.

use axum::Json;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::channel::{ChannelType, ChannelUuid};
use crate::server::LifecycleState;

/// Top-level error type for the gateway binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Startup error: {0}")]
    Startup(#[from] StartupError),

    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a persistence backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Channel not found: {channel_type} {uuid}")]
    ChannelNotFound {
        channel_type: ChannelType,
        uuid: ChannelUuid,
    },

    /// Transient failure; the write may succeed if retried later.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend failed to start: {0}")]
    StartFailed(String),

    #[error("Backend failed to stop: {0}")]
    StopFailed(String),

    #[error("Query failed: {0}")]
    Query(String),
}

impl BackendError {
    /// Whether the failed operation is worth retrying through the spool.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Errors raised while registering a channel route.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(Method),

    #[error("Invalid action name: '{0}'")]
    InvalidAction(String),

    #[error("Route already registered: {method} {path}")]
    DuplicateRoute { method: Method, path: String },

    #[error("Routes are frozen once the server has started")]
    RoutesFrozen,
}

/// Errors raised while building the handler registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Channel type {0} is already registered")]
    DuplicateChannelType(ChannelType),
}

/// Errors that abort `Server::start`.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Backend failed to start: {0}")]
    Backend(#[source] BackendError),

    #[error("Handler {channel_type} failed to initialize: {reason}")]
    HandlerInit {
        channel_type: ChannelType,
        reason: String,
    },

    #[error("Server cannot start from state {0}")]
    InvalidState(LifecycleState),
}

/// Errors reported by `Server::stop`. Shutdown always runs to completion.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("Backend failed to stop cleanly: {0}")]
    Backend(#[source] BackendError),
}

/// Errors returned by channel action handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("{0}")]
    Internal(String),

    #[error("Route registration failed: {0}")]
    Route(#[from] RouteError),
}

impl HandlerError {
    fn status(&self) -> StatusCode {
        match self {
            HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HandlerError::Backend(BackendError::ChannelNotFound { .. }) => StatusCode::NOT_FOUND,
            HandlerError::Backend(_) | HandlerError::Internal(_) | HandlerError::Route(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Per-request dispatch errors. Every variant renders as a JSON response.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid channel UUID: '{0}'")]
    InvalidUuid(String),

    #[error("Channel not found: {channel_type} {uuid}")]
    ChannelNotFound {
        channel_type: ChannelType,
        uuid: ChannelUuid,
    },

    #[error("No channel route for {method} {path}")]
    RouteNotFound { method: Method, path: String },

    #[error("Backend error: {0}")]
    Backend(BackendError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl From<BackendError> for RequestError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ChannelNotFound { channel_type, uuid } => {
                RequestError::ChannelNotFound { channel_type, uuid }
            }
            other => RequestError::Backend(other),
        }
    }
}

impl RequestError {
    /// HTTP status written for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::InvalidUuid(_) => StatusCode::BAD_REQUEST,
            RequestError::ChannelNotFound { .. } | RequestError::RouteNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            RequestError::Backend(_) | RequestError::Panicked(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RequestError::Handler(e) => e.status(),
        }
    }

    /// Short machine-readable kind for the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::InvalidUuid(_) => "invalid_uuid",
            RequestError::ChannelNotFound { .. } => "channel_not_found",
            RequestError::RouteNotFound { .. } => "route_not_found",
            RequestError::Backend(_) => "backend_error",
            RequestError::Handler(HandlerError::BadRequest(_)) => "bad_request",
            RequestError::Handler(_) => "handler_error",
            RequestError::Panicked(_) => "internal_error",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Panic payloads and backend internals stay in the logs.
        let message = match &self {
            RequestError::Panicked(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: self.kind(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;
