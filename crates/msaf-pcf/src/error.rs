use msaf_common::ErrorCode;

/// Errors from the policy subsystem (BSF discovery, PCF sessions,
/// delivery boosts).
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy session [{0}] does not exist")]
    SessionNotFound(String),

    #[error("no PCF serves this session")]
    NoPcfAvailable,

    #[error("a delivery boost is already active")]
    BoostAlreadyActive,

    #[error("{0}")]
    Upstream(String),

    #[error("upstream request timed out")]
    Timeout,
}

impl PolicyError {
    pub fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Upstream(e.to_string())
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SessionNotFound(_) => ErrorCode::NotFound,
            Self::NoPcfAvailable | Self::BoostAlreadyActive => ErrorCode::Conflict,
            Self::Upstream(_) => ErrorCode::UpstreamError,
            Self::Timeout => ErrorCode::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_map_to_409_and_upstream_to_502() {
        assert_eq!(PolicyError::BoostAlreadyActive.code().http_status(), 409);
        assert_eq!(PolicyError::NoPcfAvailable.code().http_status(), 409);
        assert_eq!(PolicyError::Upstream("x".into()).code().http_status(), 502);
        assert_eq!(PolicyError::Timeout.code().http_status(), 504);
        assert_eq!(
            PolicyError::SessionNotFound("x".into()).code().http_status(),
            404
        );
    }
}
