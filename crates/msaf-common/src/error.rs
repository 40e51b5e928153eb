use serde::{Deserialize, Serialize};

/// Machine-readable error codes for the wire protocol.
/// Shared by every interface (M1, M5, management).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    PreconditionFailed,
    UnsupportedMediaType,
    CertificateAuthorityError,
    Internal,
    UpstreamError,
    ServiceUnavailable,
    Timeout,
}

impl ErrorCode {
    /// HTTP status code for this error.
    /// Transport-agnostic (returns u16, not an axum type).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationError => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::UnsupportedMediaType => 415,
            Self::CertificateAuthorityError | Self::Internal => 500,
            Self::UpstreamError => 502,
            Self::ServiceUnavailable => 503,
            Self::Timeout => 504,
        }
    }

    /// Default problem title for this error.
    pub fn title(&self) -> &'static str {
        match self {
            Self::ValidationError => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::Conflict => "Conflict",
            Self::PreconditionFailed => "Precondition Failed",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::CertificateAuthorityError => "Certificate Authority Error",
            Self::Internal => "Internal Server Error",
            Self::UpstreamError => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::Timeout => "Gateway Timeout",
        }
    }
}
