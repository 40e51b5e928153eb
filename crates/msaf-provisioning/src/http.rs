//! M1 provisioning and management route handlers.
//!
//! Domain-owned routes mounted by the binary crate at `/3gpp-m1/v2/`
//! and `/5gmag-rt-management/v1/`. Handlers delegate to
//! [`ProvisioningCore`] and translate its errors into problem+json.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, RawQuery, State};
use axum::http::header::{HeaderMap, HeaderValue, ALLOW, CONTENT_TYPE, LOCATION};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};

use msaf_common::api;
use msaf_common::metadata::if_none_match_satisfied;
use msaf_common::{ErrorCode, Problem, ResourceMetadata};

use crate::error::ProvisioningError;
use crate::policy::PolicyTemplateState;
use crate::{content_protocols, ProvisioningCore};

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Builds the M1 router. The binary crate nests this at `/3gpp-m1/v2`.
pub fn m1_routes(core: Arc<ProvisioningCore>) -> Router {
    Router::new()
        .route(
            "/provisioning-sessions",
            post(create_session).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}",
            get(get_session)
                .delete(delete_session)
                .options(|| async { allow_response("GET, DELETE, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/content-hosting-configuration",
            post(create_chc)
                .get(get_chc)
                .put(replace_chc)
                .delete(delete_chc)
                .options(|| async { allow_response("POST, GET, PUT, DELETE, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/content-hosting-configuration/purge",
            post(purge_chc).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/certificates",
            post(create_certificate).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/certificates/{cert}",
            get(get_certificate)
                .put(upload_certificate)
                .delete(delete_certificate)
                .options(|| async { allow_response("GET, PUT, DELETE, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/policy-templates",
            post(create_policy_template).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/policy-templates/{pt}",
            get(get_policy_template)
                .put(replace_policy_template)
                .delete(delete_policy_template)
                .options(|| async { allow_response("GET, PUT, DELETE, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/consumption-reporting-configuration",
            post(create_consumption)
                .get(get_consumption)
                .put(replace_consumption)
                .delete(delete_consumption)
                .options(|| async { allow_response("POST, GET, PUT, DELETE, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/metrics-reporting-configurations",
            post(create_metrics).options(|| async { allow_response("POST, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/metrics-reporting-configurations/{mrc}",
            get(get_metrics)
                .put(replace_metrics)
                .delete(delete_metrics)
                .options(|| async { allow_response("GET, PUT, DELETE, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/content-protocols",
            get(get_content_protocols).options(|| async { allow_response("GET, OPTIONS") }),
        )
        .with_state(core)
}

/// Builds the management router, nested at `/5gmag-rt-management/v1`.
pub fn management_routes(core: Arc<ProvisioningCore>) -> Router {
    Router::new()
        .route(
            "/provisioning-sessions",
            get(list_sessions).options(|| async { allow_response("GET, OPTIONS") }),
        )
        .route(
            "/provisioning-sessions/{ps}/policy-templates/{pt}/state",
            axum::routing::put(set_policy_template_state).options(|| async { allow_response("PUT, OPTIONS") }),
        )
        .with_state(core)
}

// ── Shared helpers ──────────────────────────────────────────────────

fn problem(err: &ProvisioningError, components: &[&str]) -> Problem {
    let mut p = Problem::new(err.code(), "3gpp-m1", "v2")
        .with_detail(err.to_string())
        .with_instance(components);
    for param in err.invalid_params() {
        p = p.with_invalid_param(param.clone());
    }
    p
}

fn meta_headers(meta: &ResourceMetadata) -> HeaderMap {
    let mut headers = HeaderMap::new();
    meta.apply(&mut headers, None);
    headers
}

fn location(uri: &OriginalUri, suffix: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let base = uri.path().trim_end_matches('/');
    if let Ok(v) = HeaderValue::from_str(&format!("{base}/{suffix}")) {
        headers.insert(LOCATION, v);
    }
    headers
}

fn allow_response(methods: &'static str) -> Response {
    (StatusCode::NO_CONTENT, [(ALLOW, HeaderValue::from_static(methods))]).into_response()
}

fn content_type_is(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .eq_ignore_ascii_case(expected)
        })
        .unwrap_or(false)
}

// ── Provisioning sessions ───────────────────────────────────────────

/// POST /provisioning-sessions
async fn create_session(
    State(core): State<Arc<ProvisioningCore>>,
    uri: OriginalUri,
    body: Bytes,
) -> Response {
    let request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return problem(
                &ProvisioningError::validation(format!("bad provisioning session: {e}")),
                &["provisioning-sessions"],
            )
            .into_response()
        }
    };
    let (document, meta) = core.create_session(request).await;
    let mut headers = location(&uri, &document.provisioning_session_id);
    meta.apply(&mut headers, None);
    (StatusCode::CREATED, headers, Json(document)).into_response()
}

/// GET /provisioning-sessions/{ps}
async fn get_session(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    headers: HeaderMap,
) -> Response {
    match core.session_document(&ps).await {
        Ok((document, meta)) => {
            if if_none_match_satisfied(&headers, &meta) {
                return (StatusCode::NOT_MODIFIED, meta_headers(&meta)).into_response();
            }
            (StatusCode::OK, meta_headers(&meta), Json(document)).into_response()
        }
        Err(e) => problem(&e, &["provisioning-sessions", &ps]).into_response(),
    }
}

/// DELETE /provisioning-sessions/{ps}
async fn delete_session(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
) -> Response {
    match core.delete_session(&ps).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => problem(&e, &["provisioning-sessions", &ps]).into_response(),
    }
}

// ── Content hosting configuration ───────────────────────────────────

/// POST /provisioning-sessions/{ps}/content-hosting-configuration
async fn create_chc(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    body: Bytes,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "content-hosting-configuration"];
    match core.create_chc(&ps, &body).await {
        Ok((document, meta)) => (
            StatusCode::CREATED,
            Extension(&api::M1_CONTENT_HOSTING),
            meta_headers(&meta),
            Json(document),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// GET /provisioning-sessions/{ps}/content-hosting-configuration
async fn get_chc(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    headers: HeaderMap,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "content-hosting-configuration"];
    match core.chc_document(&ps).await {
        Ok((document, meta)) => {
            if if_none_match_satisfied(&headers, &meta) {
                return (
                    StatusCode::NOT_MODIFIED,
                    Extension(&api::M1_CONTENT_HOSTING),
                    meta_headers(&meta),
                )
                    .into_response();
            }
            (
                StatusCode::OK,
                Extension(&api::M1_CONTENT_HOSTING),
                meta_headers(&meta),
                Json(document),
            )
                .into_response()
        }
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// PUT /provisioning-sessions/{ps}/content-hosting-configuration
async fn replace_chc(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "content-hosting-configuration"];
    let if_match = headers
        .get(axum::http::header::IF_MATCH)
        .and_then(|v| v.to_str().ok());
    match core.replace_chc(&ps, &body, if_match).await {
        Ok((_, meta)) => (
            StatusCode::NO_CONTENT,
            Extension(&api::M1_CONTENT_HOSTING),
            meta_headers(&meta),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// DELETE /provisioning-sessions/{ps}/content-hosting-configuration
async fn delete_chc(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "content-hosting-configuration"];
    match core.delete_chc(&ps).await {
        Ok(()) => (
            StatusCode::NO_CONTENT,
            Extension(&api::M1_CONTENT_HOSTING),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// POST /provisioning-sessions/{ps}/content-hosting-configuration/purge
///
/// The response is deferred until every assigned application server has
/// completed or dropped its purge entry.
async fn purge_chc(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let components = [
        "provisioning-sessions",
        ps.as_str(),
        "content-hosting-configuration",
        "purge",
    ];
    if !body.is_empty()
        && headers.contains_key(CONTENT_TYPE)
        && !content_type_is(&headers, FORM_CONTENT_TYPE)
    {
        let received = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        return problem(
            &ProvisioningError::UnsupportedMediaType {
                received,
                expected: FORM_CONTENT_TYPE,
            },
            &components,
        )
        .into_response();
    }
    let pattern = if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body).into_owned())
    };

    let tracker = match core.purge_chc(&ps, pattern).await {
        Ok(tracker) => tracker,
        Err(e) => return problem(&e, &components).into_response(),
    };
    let outcome = tracker.wait().await;
    if outcome.failures > 0 {
        return Problem::new(ErrorCode::UpstreamError, "3gpp-m1", "v2")
            .with_detail("one or more application servers failed the purge")
            .with_instance(components)
            .into_response();
    }
    if outcome.purged == 0 {
        return (StatusCode::NO_CONTENT, Extension(&api::M1_CONTENT_HOSTING)).into_response();
    }
    (
        StatusCode::OK,
        Extension(&api::M1_CONTENT_HOSTING),
        Json(serde_json::json!({ "purged": outcome.purged })),
    )
        .into_response()
}

// ── Server certificates ─────────────────────────────────────────────

/// POST /provisioning-sessions/{ps}/certificates[?csr]
async fn create_certificate(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    uri: OriginalUri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "certificates"];
    let csr = query
        .as_deref()
        .map(|q| q.split('&').any(|p| p == "csr" || p.starts_with("csr=")))
        .unwrap_or(false);

    // The optional body is a JSON array of extra domain names for the
    // certificate's subject alternative names.
    let extra_domains: Vec<String> = if body.is_empty() {
        Vec::new()
    } else {
        match serde_json::from_slice::<Vec<String>>(&body) {
            Ok(domains) => domains,
            Err(_) => {
                return problem(
                    &ProvisioningError::validation(
                        "body does not contain a valid JSON array of domain names",
                    ),
                    &components,
                )
                .into_response()
            }
        }
    };

    match core.create_certificate(&ps, csr, extra_domains).await {
        Ok(created) => {
            let mut headers = location(&uri, &created.certificate_id);
            created.metadata.apply(&mut headers, None);
            if let Some(csr_pem) = created.csr_pem {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(PEM_CONTENT_TYPE));
                return (
                    StatusCode::OK,
                    Extension(&api::M1_SERVER_CERTIFICATES),
                    headers,
                    csr_pem,
                )
                    .into_response();
            }
            (
                StatusCode::CREATED,
                Extension(&api::M1_SERVER_CERTIFICATES),
                headers,
            )
                .into_response()
        }
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// GET /provisioning-sessions/{ps}/certificates/{cert}
async fn get_certificate(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, cert)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "certificates", cert.as_str()];
    match core.certificate_pem(&ps, &cert).await {
        Ok((pem, meta)) => {
            if if_none_match_satisfied(&headers, &meta) {
                return (
                    StatusCode::NOT_MODIFIED,
                    Extension(&api::M1_SERVER_CERTIFICATES),
                    meta_headers(&meta),
                )
                    .into_response();
            }
            let mut out = meta_headers(&meta);
            out.insert(CONTENT_TYPE, HeaderValue::from_static(PEM_CONTENT_TYPE));
            (
                StatusCode::OK,
                Extension(&api::M1_SERVER_CERTIFICATES),
                out,
                pem,
            )
                .into_response()
        }
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// PUT /provisioning-sessions/{ps}/certificates/{cert}
async fn upload_certificate(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, cert)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "certificates", cert.as_str()];
    if !content_type_is(&headers, PEM_CONTENT_TYPE) {
        let received = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        return problem(
            &ProvisioningError::UnsupportedMediaType {
                received,
                expected: PEM_CONTENT_TYPE,
            },
            &components,
        )
        .into_response();
    }
    let pem = String::from_utf8_lossy(&body).into_owned();
    match core.upload_certificate_pem(&ps, &cert, &pem).await {
        Ok(()) => (
            StatusCode::NO_CONTENT,
            Extension(&api::M1_SERVER_CERTIFICATES),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// DELETE /provisioning-sessions/{ps}/certificates/{cert}
async fn delete_certificate(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, cert)): Path<(String, String)>,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "certificates", cert.as_str()];
    match core.delete_certificate(&ps, &cert).await {
        Ok(()) => (
            StatusCode::NO_CONTENT,
            Extension(&api::M1_SERVER_CERTIFICATES),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

// ── Policy templates ────────────────────────────────────────────────

/// POST /provisioning-sessions/{ps}/policy-templates
async fn create_policy_template(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    uri: OriginalUri,
    body: Bytes,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "policy-templates"];
    match core.create_policy_template(&ps, &body).await {
        Ok((document, id, meta)) => {
            let mut headers = location(&uri, &id);
            meta.apply(&mut headers, None);
            (
                StatusCode::CREATED,
                Extension(&api::M1_POLICY_TEMPLATES),
                headers,
                Json(document),
            )
                .into_response()
        }
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// GET /provisioning-sessions/{ps}/policy-templates/{pt}
async fn get_policy_template(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, pt)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "policy-templates", pt.as_str()];
    match core.policy_template(&ps, &pt).await {
        Ok((document, meta)) => {
            if if_none_match_satisfied(&headers, &meta) {
                return (
                    StatusCode::NOT_MODIFIED,
                    Extension(&api::M1_POLICY_TEMPLATES),
                    meta_headers(&meta),
                )
                    .into_response();
            }
            (
                StatusCode::OK,
                Extension(&api::M1_POLICY_TEMPLATES),
                meta_headers(&meta),
                Json(document),
            )
                .into_response()
        }
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// PUT /provisioning-sessions/{ps}/policy-templates/{pt}
async fn replace_policy_template(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, pt)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "policy-templates", pt.as_str()];
    match core.replace_policy_template(&ps, &pt, &body).await {
        Ok((document, meta)) => (
            StatusCode::OK,
            Extension(&api::M1_POLICY_TEMPLATES),
            meta_headers(&meta),
            Json(document),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// DELETE /provisioning-sessions/{ps}/policy-templates/{pt}
async fn delete_policy_template(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, pt)): Path<(String, String)>,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "policy-templates", pt.as_str()];
    match core.delete_policy_template(&ps, &pt).await {
        Ok(()) => (
            StatusCode::NO_CONTENT,
            Extension(&api::M1_POLICY_TEMPLATES),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

// ── Reporting configurations ────────────────────────────────────────

/// POST /provisioning-sessions/{ps}/consumption-reporting-configuration
async fn create_consumption(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    body: Bytes,
) -> Response {
    let components = [
        "provisioning-sessions",
        ps.as_str(),
        "consumption-reporting-configuration",
    ];
    match core.create_consumption_reporting(&ps, &body).await {
        Ok((config, meta)) => (
            StatusCode::CREATED,
            Extension(&api::M1_CONSUMPTION_REPORTING),
            meta_headers(&meta),
            Json(config),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// GET /provisioning-sessions/{ps}/consumption-reporting-configuration
async fn get_consumption(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    headers: HeaderMap,
) -> Response {
    let components = [
        "provisioning-sessions",
        ps.as_str(),
        "consumption-reporting-configuration",
    ];
    match core.consumption_reporting(&ps).await {
        Ok((config, meta)) => {
            if if_none_match_satisfied(&headers, &meta) {
                return (
                    StatusCode::NOT_MODIFIED,
                    Extension(&api::M1_CONSUMPTION_REPORTING),
                    meta_headers(&meta),
                )
                    .into_response();
            }
            (
                StatusCode::OK,
                Extension(&api::M1_CONSUMPTION_REPORTING),
                meta_headers(&meta),
                Json(config),
            )
                .into_response()
        }
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// PUT /provisioning-sessions/{ps}/consumption-reporting-configuration
async fn replace_consumption(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    body: Bytes,
) -> Response {
    let components = [
        "provisioning-sessions",
        ps.as_str(),
        "consumption-reporting-configuration",
    ];
    match core.replace_consumption_reporting(&ps, &body).await {
        Ok((config, meta)) => (
            StatusCode::OK,
            Extension(&api::M1_CONSUMPTION_REPORTING),
            meta_headers(&meta),
            Json(config),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// DELETE /provisioning-sessions/{ps}/consumption-reporting-configuration
async fn delete_consumption(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
) -> Response {
    let components = [
        "provisioning-sessions",
        ps.as_str(),
        "consumption-reporting-configuration",
    ];
    match core.delete_consumption_reporting(&ps).await {
        Ok(()) => (
            StatusCode::NO_CONTENT,
            Extension(&api::M1_CONSUMPTION_REPORTING),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// POST /provisioning-sessions/{ps}/metrics-reporting-configurations
async fn create_metrics(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    uri: OriginalUri,
    body: Bytes,
) -> Response {
    let components = [
        "provisioning-sessions",
        ps.as_str(),
        "metrics-reporting-configurations",
    ];
    match core.create_metrics_configuration(&ps, &body).await {
        Ok((config, id, meta)) => {
            let mut headers = location(&uri, &id);
            meta.apply(&mut headers, None);
            (
                StatusCode::CREATED,
                Extension(&api::M1_METRICS_REPORTING),
                headers,
                Json(config),
            )
                .into_response()
        }
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// GET /provisioning-sessions/{ps}/metrics-reporting-configurations/{mrc}
async fn get_metrics(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, mrc)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let components = [
        "provisioning-sessions",
        ps.as_str(),
        "metrics-reporting-configurations",
        mrc.as_str(),
    ];
    match core.metrics_configuration(&ps, &mrc).await {
        Ok((config, meta)) => {
            if if_none_match_satisfied(&headers, &meta) {
                return (
                    StatusCode::NOT_MODIFIED,
                    Extension(&api::M1_METRICS_REPORTING),
                    meta_headers(&meta),
                )
                    .into_response();
            }
            (
                StatusCode::OK,
                Extension(&api::M1_METRICS_REPORTING),
                meta_headers(&meta),
                Json(config),
            )
                .into_response()
        }
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// PUT /provisioning-sessions/{ps}/metrics-reporting-configurations/{mrc}
async fn replace_metrics(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, mrc)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let components = [
        "provisioning-sessions",
        ps.as_str(),
        "metrics-reporting-configurations",
        mrc.as_str(),
    ];
    match core.replace_metrics_configuration(&ps, &mrc, &body).await {
        Ok((config, meta)) => (
            StatusCode::OK,
            Extension(&api::M1_METRICS_REPORTING),
            meta_headers(&meta),
            Json(config),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

/// DELETE /provisioning-sessions/{ps}/metrics-reporting-configurations/{mrc}
async fn delete_metrics(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, mrc)): Path<(String, String)>,
) -> Response {
    let components = [
        "provisioning-sessions",
        ps.as_str(),
        "metrics-reporting-configurations",
        mrc.as_str(),
    ];
    match core.delete_metrics_configuration(&ps, &mrc).await {
        Ok(()) => (
            StatusCode::NO_CONTENT,
            Extension(&api::M1_METRICS_REPORTING),
        )
            .into_response(),
        Err(e) => problem(&e, &components).into_response(),
    }
}

// ── Content protocols ───────────────────────────────────────────────

/// GET /provisioning-sessions/{ps}/content-protocols
async fn get_content_protocols(
    State(core): State<Arc<ProvisioningCore>>,
    Path(ps): Path<String>,
    headers: HeaderMap,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "content-protocols"];
    if let Err(e) = core.session_document(&ps).await {
        return problem(&e, &components).into_response();
    }
    let meta = content_protocols::metadata();
    if if_none_match_satisfied(&headers, meta) {
        return (
            StatusCode::NOT_MODIFIED,
            Extension(&api::M1_CONTENT_PROTOCOLS),
            meta_headers(meta),
        )
            .into_response();
    }
    let mut out = meta_headers(meta);
    out.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    (
        StatusCode::OK,
        Extension(&api::M1_CONTENT_PROTOCOLS),
        out,
        content_protocols::CONTENT_PROTOCOLS_JSON,
    )
        .into_response()
}

// ── Management ──────────────────────────────────────────────────────

/// GET /provisioning-sessions (management): enumerates live session ids.
async fn list_sessions(State(core): State<Arc<ProvisioningCore>>) -> Response {
    let ids = core.session_ids().await;
    (StatusCode::OK, Extension(&api::MANAGEMENT), Json(ids)).into_response()
}

#[derive(serde::Deserialize)]
struct PolicyStateRequest {
    state: PolicyTemplateState,
    #[serde(default)]
    reason: Option<serde_json::Value>,
}

/// PUT /provisioning-sessions/{ps}/policy-templates/{pt}/state
///
/// Operator approval or rejection of a pending policy template.
async fn set_policy_template_state(
    State(core): State<Arc<ProvisioningCore>>,
    Path((ps, pt)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let components = ["provisioning-sessions", ps.as_str(), "policy-templates", pt.as_str(), "state"];
    let request: PolicyStateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return management_problem(
                &ProvisioningError::validation(format!("bad state request: {e}")),
                &components,
            )
            .into_response()
        }
    };
    match core
        .set_policy_template_state(&ps, &pt, request.state, request.reason)
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Extension(&api::MANAGEMENT),
            Json(serde_json::json!({ "state": request.state })),
        )
            .into_response(),
        Err(e) => management_problem(&e, &components).into_response(),
    }
}

fn management_problem(err: &ProvisioningError, components: &[&str]) -> Problem {
    let mut p = Problem::new(err.code(), "5gmag-rt-management", "v1")
        .with_detail(err.to_string())
        .with_instance(components);
    for param in err.invalid_params() {
        p = p.with_invalid_param(param.clone());
    }
    p
}
