//! M5 route handlers.
//!
//! Mounted by the binary crate at `/3gpp-m5/v2/`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::header::{HeaderMap, HeaderValue, ALLOW, CONTENT_TYPE, LOCATION};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use msaf_common::api;
use msaf_common::metadata::if_none_match_satisfied;
use msaf_common::Problem;
use msaf_pcf::{PolicyError, PolicySession};
use msaf_provisioning::ProvisioningError;

use crate::reports::{store_report, ReportFamily};
use crate::M5Core;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Builds the M5 router. The binary crate nests this at `/3gpp-m5/v2`.
pub fn m5_routes(core: Arc<M5Core>) -> Router {
    Router::new()
        .route(
            "/service-access-information/{ps}",
            get(get_service_access_information).options(|| async { allow_response("GET, OPTIONS") }),
        )
        .route(
            "/consumption-reports/{ps}",
            post(post_consumption_report).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .route(
            "/metrics-reports/{ps}/{mrc}",
            post(post_metrics_report).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .route(
            "/dynamic-policies",
            post(create_dynamic_policy).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .route(
            "/dynamic-policies/{id}",
            get(get_dynamic_policy)
                .put(update_dynamic_policy)
                .delete(delete_dynamic_policy)
                .options(|| async { allow_response("GET, PUT, DELETE, OPTIONS") }),
        )
        .route(
            "/network-assistance",
            post(create_network_assistance).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .route(
            "/network-assistance/{id}",
            get(get_network_assistance)
                .delete(delete_network_assistance)
                .options(|| async { allow_response("GET, DELETE, OPTIONS") }),
        )
        .route(
            "/network-assistance/{id}/boost-request",
            post(boost_request).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .with_state(core)
}

// ── Shared helpers ──────────────────────────────────────────────────

fn provisioning_problem(err: &ProvisioningError, components: &[&str]) -> Problem {
    let mut p = Problem::new(err.code(), "3gpp-m5", "v2")
        .with_detail(err.to_string())
        .with_instance(components);
    for param in err.invalid_params() {
        p = p.with_invalid_param(param.clone());
    }
    p
}

fn policy_problem(err: &PolicyError, components: &[&str]) -> Problem {
    Problem::new(err.code(), "3gpp-m5", "v2")
        .with_detail(err.to_string())
        .with_instance(components)
}

fn allow_response(methods: &'static str) -> Response {
    (StatusCode::NO_CONTENT, [(ALLOW, HeaderValue::from_static(methods))]).into_response()
}

fn json_content_type_ok(headers: &HeaderMap) -> bool {
    match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(v) => v
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .eq_ignore_ascii_case(JSON_CONTENT_TYPE),
    }
}

fn unsupported_media_type(headers: &HeaderMap, components: &[&str]) -> Problem {
    let received = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    Problem::new(msaf_common::ErrorCode::UnsupportedMediaType, "3gpp-m5", "v2")
        .with_detail(format!(
            "unsupported media type: {received}, expected {JSON_CONTENT_TYPE}"
        ))
        .with_instance(components)
}

fn location(uri: &OriginalUri, suffix: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let base = uri.path().trim_end_matches('/');
    if let Ok(v) = HeaderValue::from_str(&format!("{base}/{suffix}")) {
        headers.insert(LOCATION, v);
    }
    headers
}

// ── Service access information ──────────────────────────────────────

/// GET /service-access-information/{ps}
async fn get_service_access_information(
    State(core): State<Arc<M5Core>>,
    Path(ps): Path<String>,
    headers: HeaderMap,
) -> Response {
    let components = ["service-access-information", ps.as_str()];
    match core.provisioning.service_access_information(&ps).await {
        Ok(snapshot) => {
            let mut out = HeaderMap::new();
            snapshot
                .metadata
                .apply(&mut out, Some(core.config.sai_cache_max_age));
            if if_none_match_satisfied(&headers, &snapshot.metadata) {
                return (StatusCode::NOT_MODIFIED, out).into_response();
            }
            (StatusCode::OK, out, Json(snapshot.document)).into_response()
        }
        Err(e) => provisioning_problem(&e, &components).into_response(),
    }
}

// ── Report intake ───────────────────────────────────────────────────

/// POST /consumption-reports/{ps}
async fn post_consumption_report(
    State(core): State<Arc<M5Core>>,
    Path(ps): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let components = ["consumption-reports", ps.as_str()];
    if !json_content_type_ok(&headers) {
        return (
            Extension(&api::M5_CONSUMPTION_REPORTING),
            unsupported_media_type(&headers, &components),
        )
            .into_response();
    }
    // the session must have provisioned consumption reporting
    if let Err(e) = core.provisioning.consumption_reporting(&ps).await {
        return (
            Extension(&api::M5_CONSUMPTION_REPORTING),
            provisioning_problem(&e, &components),
        )
            .into_response();
    }
    if serde_json::from_slice::<Value>(&body).is_err() {
        return (
            Extension(&api::M5_CONSUMPTION_REPORTING),
            provisioning_problem(
                &ProvisioningError::validation("consumption report is not valid JSON"),
                &components,
            ),
        )
            .into_response();
    }
    match store_report(
        &core.config.data_collection_dir,
        ReportFamily::Consumption,
        &ps,
        &body,
    )
    .await
    {
        Ok(path) => {
            tracing::debug!(path = %path.display(), "consumption report stored");
            (StatusCode::NO_CONTENT, Extension(&api::M5_CONSUMPTION_REPORTING)).into_response()
        }
        Err(e) => (
            Extension(&api::M5_CONSUMPTION_REPORTING),
            provisioning_problem(&ProvisioningError::Internal(e.to_string()), &components),
        )
            .into_response(),
    }
}

/// POST /metrics-reports/{ps}/{mrc}
async fn post_metrics_report(
    State(core): State<Arc<M5Core>>,
    Path((ps, mrc)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let components = ["metrics-reports", ps.as_str(), mrc.as_str()];
    if !json_content_type_ok(&headers) {
        return (
            Extension(&api::M5_METRICS_REPORTING),
            unsupported_media_type(&headers, &components),
        )
            .into_response();
    }
    if let Err(e) = core.provisioning.metrics_configuration(&ps, &mrc).await {
        return (
            Extension(&api::M5_METRICS_REPORTING),
            provisioning_problem(&e, &components),
        )
            .into_response();
    }
    if serde_json::from_slice::<Value>(&body).is_err() {
        return (
            Extension(&api::M5_METRICS_REPORTING),
            provisioning_problem(
                &ProvisioningError::validation("metrics report is not valid JSON"),
                &components,
            ),
        )
            .into_response();
    }
    match store_report(
        &core.config.data_collection_dir,
        ReportFamily::Metrics,
        &ps,
        &body,
    )
    .await
    {
        Ok(_) => (StatusCode::NO_CONTENT, Extension(&api::M5_METRICS_REPORTING)).into_response(),
        Err(e) => (
            Extension(&api::M5_METRICS_REPORTING),
            provisioning_problem(&ProvisioningError::Internal(e.to_string()), &components),
        )
            .into_response(),
    }
}

// ── Dynamic policies ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DynamicPolicyRequest {
    provisioning_session_id: String,
    policy_template_id: String,
    ue_address: Option<String>,
    service_data_flow_descriptions: Option<Value>,
}

fn dynamic_policy_document(session: &PolicySession, flows: Option<Value>) -> Value {
    let mut doc = json!({
        "dynamicPolicyId": session.id,
        "provisioningSessionId": session.provisioning_session_id,
        "policyTemplateId": session.policy_template_id,
    });
    let map = doc.as_object_mut().expect("object literal");
    if let Some(flows) = flows {
        map.insert("serviceDataFlowDescriptions".into(), flows);
    }
    doc
}

/// POST /dynamic-policies
async fn create_dynamic_policy(
    State(core): State<Arc<M5Core>>,
    uri: OriginalUri,
    body: Bytes,
) -> Response {
    let components = ["dynamic-policies"];
    let request: DynamicPolicyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                Extension(&api::M5_DYNAMIC_POLICIES),
                provisioning_problem(
                    &ProvisioningError::validation(format!("bad dynamic policy: {e}")),
                    &components,
                ),
            )
                .into_response()
        }
    };

    // the referenced template must exist and be approved
    let template = match core
        .provisioning
        .valid_policy_template(&request.provisioning_session_id, &request.policy_template_id)
        .await
    {
        Ok(template) => template,
        Err(e) => {
            return (
                Extension(&api::M5_DYNAMIC_POLICIES),
                provisioning_problem(&e, &components),
            )
                .into_response()
        }
    };

    let ue_address = request.ue_address.unwrap_or_default();
    let result = core
        .policy
        .create_session(
            &request.provisioning_session_id,
            &ue_address,
            Some(request.policy_template_id.clone()),
            template.external_reference.clone(),
        )
        .await;
    match result {
        Ok(session) => {
            core.remember_flows(&session.id, request.service_data_flow_descriptions.clone())
                .await;
            let headers = location(&uri, &session.id);
            let doc = dynamic_policy_document(&session, request.service_data_flow_descriptions);
            (
                StatusCode::CREATED,
                Extension(&api::M5_DYNAMIC_POLICIES),
                headers,
                Json(doc),
            )
                .into_response()
        }
        Err(e) => (
            Extension(&api::M5_DYNAMIC_POLICIES),
            policy_problem(&e, &components),
        )
            .into_response(),
    }
}

/// GET /dynamic-policies/{id}
async fn get_dynamic_policy(
    State(core): State<Arc<M5Core>>,
    Path(id): Path<String>,
) -> Response {
    let components = ["dynamic-policies", id.as_str()];
    match core.policy.session(&id).await {
        Ok(session) => {
            let flows = core.flows(&id).await;
            (
                StatusCode::OK,
                Extension(&api::M5_DYNAMIC_POLICIES),
                Json(dynamic_policy_document(&session, flows)),
            )
                .into_response()
        }
        Err(e) => (
            Extension(&api::M5_DYNAMIC_POLICIES),
            policy_problem(&e, &components),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DynamicPolicyUpdate {
    policy_template_id: String,
    service_data_flow_descriptions: Option<Value>,
}

/// PUT /dynamic-policies/{id}
async fn update_dynamic_policy(
    State(core): State<Arc<M5Core>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let components = ["dynamic-policies", id.as_str()];
    let request: DynamicPolicyUpdate = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                Extension(&api::M5_DYNAMIC_POLICIES),
                provisioning_problem(
                    &ProvisioningError::validation(format!("bad dynamic policy: {e}")),
                    &components,
                ),
            )
                .into_response()
        }
    };

    let session = match core.policy.session(&id).await {
        Ok(session) => session,
        Err(e) => {
            return (
                Extension(&api::M5_DYNAMIC_POLICIES),
                policy_problem(&e, &components),
            )
                .into_response()
        }
    };
    let template = match core
        .provisioning
        .valid_policy_template(&session.provisioning_session_id, &request.policy_template_id)
        .await
    {
        Ok(template) => template,
        Err(e) => {
            return (
                Extension(&api::M5_DYNAMIC_POLICIES),
                provisioning_problem(&e, &components),
            )
                .into_response()
        }
    };

    match core
        .policy
        .update_session_qos(
            &id,
            Some(request.policy_template_id),
            template.external_reference,
        )
        .await
    {
        Ok(session) => {
            core.remember_flows(&id, request.service_data_flow_descriptions.clone())
                .await;
            (
                StatusCode::OK,
                Extension(&api::M5_DYNAMIC_POLICIES),
                Json(dynamic_policy_document(
                    &session,
                    request.service_data_flow_descriptions,
                )),
            )
                .into_response()
        }
        Err(e) => (
            Extension(&api::M5_DYNAMIC_POLICIES),
            policy_problem(&e, &components),
        )
            .into_response(),
    }
}

/// DELETE /dynamic-policies/{id}
async fn delete_dynamic_policy(
    State(core): State<Arc<M5Core>>,
    Path(id): Path<String>,
) -> Response {
    let components = ["dynamic-policies", id.as_str()];
    match core.policy.delete_session(&id).await {
        Ok(()) => {
            core.forget_flows(&id).await;
            (StatusCode::NO_CONTENT, Extension(&api::M5_DYNAMIC_POLICIES)).into_response()
        }
        Err(e) => (
            Extension(&api::M5_DYNAMIC_POLICIES),
            policy_problem(&e, &components),
        )
            .into_response(),
    }
}

// ── Network assistance ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkAssistanceRequest {
    provisioning_session_id: String,
    ue_address: String,
    policy_template_id: Option<String>,
}

fn network_assistance_document(session: &PolicySession) -> Value {
    json!({
        "networkAssistanceSessionId": session.id,
        "provisioningSessionId": session.provisioning_session_id,
        "ueAddress": session.ue_address,
        "boostActive": session.boost_active,
        "recommendedQoSReference": session.qos_reference,
    })
}

/// POST /network-assistance
async fn create_network_assistance(
    State(core): State<Arc<M5Core>>,
    uri: OriginalUri,
    body: Bytes,
) -> Response {
    let components = ["network-assistance"];
    let request: NetworkAssistanceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                Extension(&api::M5_NETWORK_ASSISTANCE),
                provisioning_problem(
                    &ProvisioningError::validation(format!("bad network assistance request: {e}")),
                    &components,
                ),
            )
                .into_response()
        }
    };

    // the provisioning session must exist
    if let Err(e) = core
        .provisioning
        .session_document(&request.provisioning_session_id)
        .await
    {
        return (
            Extension(&api::M5_NETWORK_ASSISTANCE),
            provisioning_problem(&e, &components),
        )
            .into_response();
    }
    let qos_reference = match &request.policy_template_id {
        Some(pt) => {
            match core
                .provisioning
                .valid_policy_template(&request.provisioning_session_id, pt)
                .await
            {
                Ok(template) => template.external_reference,
                Err(e) => {
                    return (
                        Extension(&api::M5_NETWORK_ASSISTANCE),
                        provisioning_problem(&e, &components),
                    )
                        .into_response()
                }
            }
        }
        None => None,
    };

    match core
        .policy
        .create_session(
            &request.provisioning_session_id,
            &request.ue_address,
            request.policy_template_id.clone(),
            qos_reference,
        )
        .await
    {
        Ok(session) => {
            let headers = location(&uri, &session.id);
            (
                StatusCode::CREATED,
                Extension(&api::M5_NETWORK_ASSISTANCE),
                headers,
                Json(network_assistance_document(&session)),
            )
                .into_response()
        }
        Err(e) => (
            Extension(&api::M5_NETWORK_ASSISTANCE),
            policy_problem(&e, &components),
        )
            .into_response(),
    }
}

/// GET /network-assistance/{id}
async fn get_network_assistance(
    State(core): State<Arc<M5Core>>,
    Path(id): Path<String>,
) -> Response {
    let components = ["network-assistance", id.as_str()];
    match core.policy.session(&id).await {
        Ok(session) => (
            StatusCode::OK,
            Extension(&api::M5_NETWORK_ASSISTANCE),
            Json(network_assistance_document(&session)),
        )
            .into_response(),
        Err(e) => (
            Extension(&api::M5_NETWORK_ASSISTANCE),
            policy_problem(&e, &components),
        )
            .into_response(),
    }
}

/// POST /network-assistance/{id}/boost-request
async fn boost_request(State(core): State<Arc<M5Core>>, Path(id): Path<String>) -> Response {
    let components = ["network-assistance", id.as_str(), "boost-request"];
    match core.policy.delivery_boost(&id).await {
        Ok(()) => {
            (StatusCode::NO_CONTENT, Extension(&api::M5_NETWORK_ASSISTANCE)).into_response()
        }
        Err(e) => (
            Extension(&api::M5_NETWORK_ASSISTANCE),
            policy_problem(&e, &components),
        )
            .into_response(),
    }
}

/// DELETE /network-assistance/{id}
async fn delete_network_assistance(
    State(core): State<Arc<M5Core>>,
    Path(id): Path<String>,
) -> Response {
    let components = ["network-assistance", id.as_str()];
    match core.policy.delete_session(&id).await {
        Ok(()) => {
            (StatusCode::NO_CONTENT, Extension(&api::M5_NETWORK_ASSISTANCE)).into_response()
        }
        Err(e) => (
            Extension(&api::M5_NETWORK_ASSISTANCE),
            policy_problem(&e, &components),
        )
            .into_response(),
    }
}
