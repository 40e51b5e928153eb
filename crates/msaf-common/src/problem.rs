//! RFC 7807 problem details.
//!
//! Every error surfaced on M1, M5, or the management interface is an
//! `application/problem+json` body. `type` names the matched service and
//! API version (`/<serviceName>/<apiVersion>`); `instance` concatenates
//! the matched resource components.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// One invalid request parameter with the reason it was rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidParam {
    pub param: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl InvalidParam {
    pub fn new(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            reason: Some(reason.into()),
        }
    }
}

/// An RFC 7807 problem body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_params: Option<Vec<InvalidParam>>,
    #[serde(skip)]
    pub code: Option<ErrorCode>,
}

impl Problem {
    pub fn new(code: ErrorCode, service: &str, api_version: &str) -> Self {
        Self {
            problem_type: format!("/{service}/{api_version}"),
            title: code.title().to_string(),
            status: code.http_status(),
            detail: None,
            instance: None,
            invalid_params: None,
            code: Some(code),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Sets `instance` from the matched resource components.
    pub fn with_instance<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = components
            .into_iter()
            .map(|c| c.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        self.instance = Some(format!("/{joined}"));
        self
    }

    pub fn with_invalid_param(mut self, param: InvalidParam) -> Self {
        self.invalid_params.get_or_insert_with(Vec::new).push(param);
        self
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_vec(&self).unwrap_or_default();
        (
            status,
            [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_type_names_service_and_version() {
        let p = Problem::new(ErrorCode::NotFound, "3gpp-m1", "v2");
        assert_eq!(p.problem_type, "/3gpp-m1/v2");
        assert_eq!(p.status, 404);
        assert_eq!(p.title, "Not Found");
    }

    #[test]
    fn instance_concatenates_resource_components() {
        let p = Problem::new(ErrorCode::NotFound, "3gpp-m1", "v2")
            .with_instance(["provisioning-sessions", "abc", "certificates"]);
        assert_eq!(
            p.instance.as_deref(),
            Some("/provisioning-sessions/abc/certificates")
        );
    }

    #[test]
    fn invalid_params_serialize_with_reason() {
        let p = Problem::new(ErrorCode::ValidationError, "3gpp-m1", "v2")
            .with_invalid_param(InvalidParam::new("certificateId", "Does not exist"));
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["invalidParams"][0]["param"], "certificateId");
        assert_eq!(json["invalidParams"][0]["reason"], "Does not exist");
    }

    #[test]
    fn detail_and_empty_optionals_are_omitted() {
        let p = Problem::new(ErrorCode::Conflict, "3gpp-m5", "v2");
        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("detail").is_none());
        assert!(json.get("invalidParams").is_none());
    }

    #[tokio::test]
    async fn into_response_sets_problem_content_type() {
        let resp = Problem::new(ErrorCode::PreconditionFailed, "3gpp-m1", "v2")
            .with_detail("entity tag mismatch")
            .into_response();
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            PROBLEM_CONTENT_TYPE
        );
    }
}
