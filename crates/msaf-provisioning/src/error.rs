use msaf_common::{ErrorCode, InvalidParam};

/// Errors raised by provisioning operations.
///
/// Each variant knows its wire-level [`ErrorCode`]; the M1 router turns
/// that into a problem+json response with the right status.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("provisioning session [{0}] does not exist")]
    SessionNotFound(String),

    #[error("{resource} [{id}] does not exist")]
    ResourceNotFound { resource: &'static str, id: String },

    #[error("{detail}")]
    Validation {
        detail: String,
        invalid_params: Vec<InvalidParam>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("entity tag mismatch")]
    PreconditionFailed,

    #[error("unsupported media type: {received}, expected {expected}")]
    UnsupportedMediaType {
        received: String,
        expected: &'static str,
    },

    #[error("certificate manager failed: {0}")]
    CertificateAuthority(String),

    #[error("{0}")]
    Internal(String),
}

impl ProvisioningError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation {
            detail: detail.into(),
            invalid_params: Vec::new(),
        }
    }

    pub fn invalid_param(
        param: impl Into<String>,
        reason: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Validation {
            detail: detail.into(),
            invalid_params: vec![InvalidParam::new(param, reason)],
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SessionNotFound(_) | Self::ResourceNotFound { .. } => ErrorCode::NotFound,
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::PreconditionFailed => ErrorCode::PreconditionFailed,
            Self::UnsupportedMediaType { .. } => ErrorCode::UnsupportedMediaType,
            Self::CertificateAuthority(_) => ErrorCode::CertificateAuthorityError,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn invalid_params(&self) -> &[InvalidParam] {
        match self {
            Self::Validation { invalid_params, .. } => invalid_params,
            _ => &[],
        }
    }
}

impl From<std::io::Error> for ProvisioningError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_map_to_expected_codes() {
        assert_eq!(
            ProvisioningError::SessionNotFound("x".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            ProvisioningError::validation("bad").code(),
            ErrorCode::ValidationError
        );
        assert_eq!(
            ProvisioningError::Conflict("dup".into()).code(),
            ErrorCode::Conflict
        );
        assert_eq!(
            ProvisioningError::PreconditionFailed.code(),
            ErrorCode::PreconditionFailed
        );
        assert_eq!(
            ProvisioningError::CertificateAuthority("ca".into()).code(),
            ErrorCode::CertificateAuthorityError
        );
    }

    #[test]
    fn invalid_param_constructor_carries_param() {
        let e = ProvisioningError::invalid_param("certificateId", "Does not exist", "bad ref");
        assert_eq!(e.invalid_params().len(), 1);
        assert_eq!(e.invalid_params()[0].param, "certificateId");
    }
}
