//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;
use tracing_error::SpanTrace;

use ferry::error::FerryError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug)]
pub struct ServerError {
    kind: ErrorKind,
    context: SpanTrace,
}

/// The kind of an error.
#[derive(Debug, Display)]
pub enum ErrorKind {
    // Generic responses
    /// The URL you requested was not found.
    NotFound,

    /// The server encountered an internal error or misconfiguration.
    InternalServerError,

    // Specialized responses
    /// The requested entity does not exist.
    NoSuchEntity,

    /// The requested tracker does not exist.
    NoSuchTracker,

    /// The requested export does not exist.
    NoSuchExport,

    /// The requested group or project does not exist.
    NoSuchPortable,

    /// The migration job has no configuration.
    NoSuchConfiguration,

    /// Export is batched
    ExportIsBatched,

    /// Batch not found
    BatchNotFound,

    /// Batch file not found
    BatchFileNotFound,

    /// The tracker still has {0} unfinished batches.
    BatchesPending(u64),

    /// Validation failed: {0}
    ValidationError(String),

    /// Cryptographic error: {0}
    CryptoError(AnyError),

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Storage error: {0}
    StorageError(AnyError),

    /// General request error: {0}
    RequestError(AnyError),

    /// {0}
    FerryError(FerryError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        ErrorKind::DatabaseError(AnyError::new(error)).into()
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        ErrorKind::StorageError(AnyError::new(error)).into()
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        ErrorKind::RequestError(AnyError::new(error)).into()
    }

    pub fn crypto_error(error: impl StdError + Send + Sync + 'static) -> Self {
        ErrorKind::CryptoError(AnyError::new(error)).into()
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        ErrorKind::ValidationError(message.into()).into()
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns the span trace captured when the error was created.
    pub fn context(&self) -> &SpanTrace {
        &self.context
    }
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::InternalServerError => "InternalServerError",

            Self::NoSuchEntity => "NoSuchEntity",
            Self::NoSuchTracker => "NoSuchTracker",
            Self::NoSuchExport => "NoSuchExport",
            Self::NoSuchPortable => "NoSuchPortable",
            Self::NoSuchConfiguration => "NoSuchConfiguration",
            Self::ExportIsBatched => "ExportIsBatched",
            Self::BatchNotFound => "BatchNotFound",
            Self::BatchFileNotFound => "BatchFileNotFound",
            Self::BatchesPending(_) => "BatchesPending",
            Self::ValidationError(_) => "ValidationError",
            Self::CryptoError(_) => "CryptoError",
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::RequestError(_) => "RequestError",
            Self::FerryError(e) => e.name(),
        }
    }

    /// Returns a version of this error for clients.
    fn into_clients(self) -> Self {
        match self {
            Self::CryptoError(_) => Self::InternalServerError,
            Self::DatabaseError(_) => Self::InternalServerError,
            Self::StorageError(_) => Self::InternalServerError,

            _ => self,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,

            Self::NoSuchEntity => StatusCode::NOT_FOUND,
            Self::NoSuchTracker => StatusCode::NOT_FOUND,
            Self::NoSuchExport => StatusCode::NOT_FOUND,
            Self::NoSuchPortable => StatusCode::NOT_FOUND,
            Self::NoSuchConfiguration => StatusCode::NOT_FOUND,
            Self::BatchNotFound => StatusCode::NOT_FOUND,
            Self::BatchFileNotFound => StatusCode::NOT_FOUND,
            Self::ExportIsBatched => StatusCode::CONFLICT,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            Self::FerryError(FerryError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            Self::FerryError(_) => StatusCode::BAD_REQUEST,
            Self::BatchesPending(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl StdError for ServerError {}

impl From<ErrorKind> for ServerError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: SpanTrace::capture(),
        }
    }
}

impl From<FerryError> for ServerError {
    fn from(error: FerryError) -> Self {
        ErrorKind::FerryError(error).into()
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self.kind,
            ErrorKind::DatabaseError(_) | ErrorKind::StorageError(_) | ErrorKind::CryptoError(_)
        ) {
            tracing::error!("{:?}", self);
        }

        let sanitized = self.kind.into_clients();

        let status_code = sanitized.http_status_code();
        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: sanitized.to_string(),
            error: sanitized.name().to_string(),
        };

        (status_code, Json(error_response)).into_response()
    }
}
