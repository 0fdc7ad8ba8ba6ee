//! Broker error taxonomy and RFC 7807 problem-report responses.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content type used for all error responses.
pub const PROBLEM_REPORT_CONTENT_TYPE: &str = "application/problem+json";

const ERROR_TYPE_BASE: &str = "https://uri.etsi.org/ngsi-ld/errors/";

/// Result alias used throughout the broker.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors produced by the broker core.
///
/// The first error from a context source aborts the in-progress request;
/// nothing is retried and no error causes a source to be dropped from the
/// registry.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed URL, query parameters, or body. Surfaced as 400.
    #[error("bad request parameter: {0}")]
    BadParameter(String),

    /// No source claims the entity, or the source returned nothing. Surfaced as 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// A source cannot determine the entity type for an ID.
    #[error("provided type could not be determined: {0}")]
    NotProvided(String),

    /// A downstream source returned an error or a non-2xx status. Surfaced as 400
    /// with the downstream reason embedded.
    #[error("context source failure: {0}")]
    SourceFailure(String),

    /// A GeoJSON payload could not be decoded into a known geometry.
    #[error("geojson decode failure: {0}")]
    GeoJsonDecode(String),

    /// Encoding or decoding NGSI-LD JSON failed. Surfaced as 500.
    #[error("serialization failure: {0}")]
    Serialize(String),

    /// Unexpected broker-side failure. Surfaced as 500.
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid broker configuration, reported at startup only.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        BrokerError::BadParameter(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        BrokerError::NotFound(msg.into())
    }

    pub fn source_failure(msg: impl Into<String>) -> Self {
        BrokerError::SourceFailure(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        BrokerError::Internal(msg.into())
    }

    /// HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::BadParameter(_)
            | BrokerError::NotProvided(_)
            | BrokerError::SourceFailure(_) => StatusCode::BAD_REQUEST,
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::GeoJsonDecode(_)
            | BrokerError::Serialize(_)
            | BrokerError::Internal(_)
            | BrokerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// ETSI NGSI-LD error-type URI for the problem report.
    pub fn error_type(&self) -> String {
        let suffix = match self {
            BrokerError::BadParameter(_) => "BadRequestData",
            BrokerError::NotProvided(_) | BrokerError::SourceFailure(_) => "InvalidRequest",
            BrokerError::NotFound(_) => "ResourceNotFound",
            BrokerError::GeoJsonDecode(_)
            | BrokerError::Serialize(_)
            | BrokerError::Internal(_)
            | BrokerError::Config(_) => "InternalError",
        };
        format!("{ERROR_TYPE_BASE}{suffix}")
    }
}

/// RFC 7807 problem report body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&BrokerError> for ProblemDetails {
    fn from(err: &BrokerError) -> Self {
        ProblemDetails {
            problem_type: err.error_type(),
            title: err.to_string(),
            status: err.status_code().as_u16(),
            detail: None,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let problem = ProblemDetails::from(&self);
        let body = serde_json::to_vec(&problem).unwrap_or_default();
        (
            self.status_code(),
            [(header::CONTENT_TYPE, PROBLEM_REPORT_CONTENT_TYPE)],
            body,
        )
            .into_response()
    }
}
