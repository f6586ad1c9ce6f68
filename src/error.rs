//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **`AppError`**: failures of the HTTP surface (status, health, config endpoints). These are
//!   converted into JSON responses through actix-web's `ResponseError` trait.
//! - **`StreamError`**: failures inside the audio transport itself (ingestion, peer transport,
//!   AI pipeline). These never cross the transport boundary; they are classified, counted by
//!   the error budget, and logged.
//!
//! ## Key Rust Concepts:
//! - **enum**: each variant is one failure category, optionally carrying data
//! - **Display**: how an error reads when logged or sent to a client
//! - **From**: lets the `?` operator convert foreign errors automatically

use actix_web::{HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: the client sent malformed data (400)
/// - **ConfigError**: configuration could not be loaded or merged (500)
/// - **ValidationError**: a value failed validation rules (400)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into JSON HTTP responses of the form
/// `{"error": {"type": ..., "message": ..., "timestamp": ...}}`.
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing failures are almost always the client's fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

/// How bad a stream failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Which stage of the transport failed.
///
/// The kind decides what happens once the retry budget is exhausted:
/// - `AudioProcessing`: the affected frame is dropped and streaming continues
/// - `Connection`: the connection is torn down
/// - `Pipeline`: the circuit breaker trips and degraded mode is engaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    AudioProcessing,
    Connection,
    Pipeline,
}

impl fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamErrorKind::AudioProcessing => "audio processing",
            StreamErrorKind::Connection => "connection",
            StreamErrorKind::Pipeline => "pipeline",
        };
        f.write_str(name)
    }
}

/// A classified failure inside the audio transport.
#[derive(Debug, Clone)]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind,
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }

    /// Frame ingestion or decoding failed.
    pub fn audio(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::AudioProcessing, message, Severity::Low)
    }

    /// The peer transport refused or dropped data.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Connection, message, Severity::Medium)
    }

    /// An AI pipeline stage failed.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Pipeline, message, Severity::High)
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error ({}): {}",
            self.kind,
            self.severity.as_str(),
            self.message
        )
    }
}

impl std::error::Error for StreamError {}
