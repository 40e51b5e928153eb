//! Npcf_PolicyAuthorization application session contexts.
//!
//! One context per media session that negotiated policy. The context
//! URI returned at creation is held for later updates (delivery boost)
//! and for deletion when the media session ends.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::PolicyError;

/// Client for one PCF's policy authorization API.
#[derive(Debug, Clone)]
pub struct PcfClient {
    http: reqwest::Client,
}

impl PcfClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Creates an application session context and returns its URI.
    pub async fn create_app_session(
        &self,
        pcf_endpoint: &str,
        ue_address: &str,
        qos_reference: Option<&str>,
    ) -> Result<String, PolicyError> {
        let url = format!(
            "{}/npcf-policyauthorization/v1/app-sessions",
            pcf_endpoint.trim_end_matches('/')
        );
        let body = app_session_body(ue_address, qos_reference);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(PolicyError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(PolicyError::Upstream(format!(
                "PCF app session creation returned {status}"
            )));
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match location {
            Some(uri) if uri.starts_with("http") => Ok(uri),
            Some(path) => Ok(format!("{pcf_endpoint}{path}")),
            None => Err(PolicyError::Upstream(
                "PCF did not return an app session location".into(),
            )),
        }
    }

    /// Re-points the context at a different QoS reference.
    pub async fn update_qos(
        &self,
        app_session_uri: &str,
        qos_reference: &str,
    ) -> Result<(), PolicyError> {
        let body = json!({ "ascReqData": { "qosReference": qos_reference } });
        let response = self
            .http
            .patch(app_session_uri)
            .json(&body)
            .send()
            .await
            .map_err(PolicyError::from_transport)?;
        if !response.status().is_success() {
            return Err(PolicyError::Upstream(format!(
                "PCF app session update returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Ends the context (`POST …/delete` per the Npcf contract).
    pub async fn delete_app_session(&self, app_session_uri: &str) -> Result<(), PolicyError> {
        let response = self
            .http
            .post(format!("{app_session_uri}/delete"))
            .send()
            .await
            .map_err(PolicyError::from_transport)?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND
        {
            return Err(PolicyError::Upstream(format!(
                "PCF app session deletion returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn app_session_body(ue_address: &str, qos_reference: Option<&str>) -> Value {
    let mut asc_req_data = json!({
        "suppFeat": "0",
        "notifUri": "",
    });
    let map = asc_req_data.as_object_mut().expect("object literal");
    if ue_address.contains(':') {
        map.insert("ueIpv6".into(), json!(ue_address));
    } else {
        map.insert("ueIpv4".into(), json!(ue_address));
    }
    if let Some(reference) = qos_reference {
        map.insert("qosReference".into(), json!(reference));
    }
    json!({ "ascReqData": asc_req_data })
}
