//! Runtime assembly.
//!
//! Builds the domain cores from the configuration, mounts their routers
//! onto per-role apps, binds every configured endpoint, and runs the
//! accept loops until shutdown. All cross-domain plumbing (the
//! reconciliation channel, shared cores) happens here; the domain
//! crates never construct each other.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use msaf_common::api::{self, ServerIdentity};
use msaf_common::server::{self, HttpBackend, ServerHeader, Watchdog};
use msaf_common::{ErrorCode, Problem};
use msaf_m3::{AsRegistry, ReconcilerOptions};
use msaf_m5::{M5Config, M5Core};
use msaf_pcf::{PcfConfig, PolicyCore};
use msaf_provisioning::sai::SaiContext;
use msaf_provisioning::{sync, ProvisioningConfig, ProvisioningCore};

use crate::config::{AfConfig, EndpointRole};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("could not bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("server failure: {0}")]
    Server(std::io::Error),
}

/// The assembled cores plus the routers each endpoint role serves.
pub struct Runtime {
    pub provisioning: Arc<ProvisioningCore>,
    pub policy: Arc<PolicyCore>,
    pub m1_app: Router,
    pub m5_app: Router,
    pub registry: AsRegistry,
}

/// Builds every core and router from the configuration.
pub fn assemble(config: &AfConfig, cancel: &CancellationToken) -> Runtime {
    let (sync_tx, sync_rx) = sync::channel();

    let provisioning = ProvisioningCore::new(
        ProvisioningConfig {
            application_servers: config.application_servers.clone(),
            certificate_manager: config.certificate_manager.clone(),
            certificate_dir: config.certificate_dir.clone(),
            sai: SaiContext {
                m5_server_addresses: config.m5_server_addresses(),
                network_assistance: config.network_assistance.is_some(),
            },
        },
        sync_tx,
    );

    let registry = AsRegistry::spawn(
        &config.application_servers,
        Arc::clone(&provisioning),
        sync_rx,
        ReconcilerOptions {
            request_timeout: config.request_timeout(),
            ..ReconcilerOptions::default()
        },
        cancel.clone(),
    );

    let na = config.network_assistance.as_ref();
    let policy = PolicyCore::new(PcfConfig {
        bsf_endpoint: config.bsf.as_ref().map(|b| b.endpoint.clone()),
        bsf_cache_ttl: config
            .bsf
            .as_ref()
            .map(|b| Duration::from_secs(b.cache_ttl_seconds))
            .unwrap_or(Duration::from_secs(300)),
        bsf_negative_cache_ttl: config
            .bsf
            .as_ref()
            .map(|b| Duration::from_secs(b.negative_cache_ttl_seconds))
            .unwrap_or(Duration::from_secs(30)),
        static_pcf_endpoint: config.pcf.as_ref().map(|p| p.endpoint.clone()),
        request_timeout: config.request_timeout(),
        delivery_boost_duration: na
            .map(|n| Duration::from_secs(n.delivery_boost_seconds))
            .unwrap_or(Duration::from_secs(20)),
        boost_qos_reference: na
            .map(|n| n.boost_qos_reference.clone())
            .unwrap_or_else(|| "QOS_PREMIUM".into()),
    });

    let m5_core = M5Core::new(
        Arc::clone(&provisioning),
        Arc::clone(&policy),
        M5Config {
            data_collection_dir: config.data_collection_dir.clone(),
            sai_cache_max_age: config.sai_cache_control_max_age,
        },
    );

    let identity = ServerIdentity {
        server_name: config.server_name.clone(),
        api_release: config.api_release.clone(),
    };

    let m1_app = Router::new()
        .nest(
            "/3gpp-m1/v2",
            msaf_provisioning::http::m1_routes(Arc::clone(&provisioning)),
        )
        .nest(
            "/5gmag-rt-management/v1",
            msaf_provisioning::http::management_routes(Arc::clone(&provisioning)),
        )
        .fallback(m1_fallback)
        .layer(from_fn_with_state(
            Watchdog {
                timeout: config.request_timeout(),
                service: "3gpp-m1",
                api_version: "v2",
            },
            server::request_watchdog,
        ))
        .layer(from_fn_with_state(
            ServerHeader {
                identity: identity.clone(),
                default_api: &api::M1_PROVISIONING_SESSIONS,
            },
            server::server_header,
        ));

    let m5_app = Router::new()
        .nest("/3gpp-m5/v2", msaf_m5::http::m5_routes(m5_core))
        .fallback(m5_fallback)
        .layer(from_fn_with_state(
            Watchdog {
                timeout: config.request_timeout(),
                service: "3gpp-m5",
                api_version: "v2",
            },
            server::request_watchdog,
        ))
        .layer(from_fn_with_state(
            ServerHeader {
                identity,
                default_api: &api::M5_SERVICE_ACCESS_INFORMATION,
            },
            server::server_header,
        ))
        .layer(CorsLayer::permissive());

    Runtime {
        provisioning,
        policy,
        m1_app,
        m5_app,
        registry,
    }
}

/// A request under `/3gpp-m1/` with the wrong version gets a version
/// problem; everything else is plain 404.
async fn m1_fallback(uri: axum::http::Uri) -> axum::response::Response {
    version_fallback(uri, "/3gpp-m1/", "3gpp-m1", "v2")
}

async fn m5_fallback(uri: axum::http::Uri) -> axum::response::Response {
    version_fallback(uri, "/3gpp-m5/", "3gpp-m5", "v2")
}

fn version_fallback(
    uri: axum::http::Uri,
    prefix: &str,
    service: &str,
    supported: &str,
) -> axum::response::Response {
    let path = uri.path();
    if let Some(rest) = path.strip_prefix(prefix) {
        let version = rest.split('/').next().unwrap_or_default();
        if !version.is_empty() && version != supported {
            return Problem::new(ErrorCode::ValidationError, service, supported)
                .with_detail(format!("version [{version}] not supported"))
                .into_response();
        }
    }
    Problem::new(ErrorCode::NotFound, service, supported)
        .with_detail(format!("no resource at [{path}]"))
        .into_response()
}

/// Binds one endpoint and serves its app until cancellation.
pub async fn serve_endpoint(
    endpoint: &crate::config::Endpoint,
    app: Router,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, RunError> {
    let address = format!("{}:{}", endpoint.address, endpoint.port);
    if endpoint.tls {
        return serve_tls(endpoint, app, &address, cancel).await;
    }

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|source| RunError::Bind {
            address: address.clone(),
            source,
        })?;
    let backend: HttpBackend = endpoint.http.into();
    tracing::info!(%address, ?backend, role = ?endpoint.name, "endpoint listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = server::serve(listener, app, backend, cancel).await {
            tracing::error!(error = %e, "endpoint accept loop failed");
        }
    }))
}

async fn serve_tls(
    endpoint: &crate::config::Endpoint,
    app: Router,
    address: &str,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, RunError> {
    use axum_server::tls_rustls::RustlsConfig;

    let certificate = endpoint.certificate_path.clone().expect("validated");
    let private_key = endpoint.private_key_path.clone().expect("validated");
    let tls = RustlsConfig::from_pem_file(certificate, private_key)
        .await
        .map_err(|source| RunError::Bind {
            address: address.to_string(),
            source,
        })?;
    let socket_address: std::net::SocketAddr =
        address.parse().map_err(|e: std::net::AddrParseError| {
            RunError::Bind {
                address: address.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            }
        })?;

    // ALPN on the TLS endpoint negotiates HTTP/1.1 or HTTP/2; the
    // configured backend choice applies to plaintext endpoints.
    tracing::info!(%address, role = ?endpoint.name, "TLS endpoint listening");
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(2)));
    });
    Ok(tokio::spawn(async move {
        if let Err(e) = axum_server::bind_rustls(socket_address, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
        {
            tracing::error!(error = %e, "TLS endpoint failed");
        }
    }))
}

/// Binds every configured endpoint and blocks until shutdown.
pub async fn run(config: AfConfig, cancel: CancellationToken) -> Result<(), RunError> {
    let runtime = assemble(&config, &cancel);
    tracing::info!(
        application_servers = runtime.registry.nodes().len(),
        endpoints = config.listen.len(),
        "application function assembled"
    );
    let mut tasks = Vec::new();
    for endpoint in &config.listen {
        let app = match endpoint.name {
            EndpointRole::M1 => runtime.m1_app.clone(),
            EndpointRole::M5 => runtime.m5_app.clone(),
        };
        tasks.push(serve_endpoint(endpoint, app, cancel.clone()).await?);
    }

    cancel.cancelled().await;
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_config(dir: &std::path::Path) -> AfConfig {
        serde_yaml::from_str(&format!(
            r#"
serverName: af.test
listen:
  - name: m1
    port: 7777
    http: h2
  - name: m5
    port: 7778
certificateManager: /bin/false
certificateDir: {certs}
dataCollectionDir: {reports}
networkAssistance:
  deliveryBoostSeconds: 20
"#,
            certs = dir.join("certs").display(),
            reports = dir.join("reports").display(),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn m1_app_serves_provisioning_and_management() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let runtime = assemble(&test_config(dir.path()), &cancel);

        let resp = runtime
            .m1_app
            .clone()
            .oneshot(
                Request::post("/3gpp-m1/v2/provisioning-sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"provisioningSessionType":"DOWNLINK","appId":"app1"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let server = resp.headers().get("server").unwrap().to_str().unwrap();
        assert!(server.starts_with("5GMSdAF-af.test/2 "));
        assert_eq!(runtime.provisioning.session_ids().await.len(), 1);
        assert!(runtime.policy.session("nope").await.is_err());

        let resp = runtime
            .m1_app
            .clone()
            .oneshot(
                Request::get("/5gmag-rt-management/v1/provisioning-sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unsupported_m1_version_gets_a_400_problem() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let runtime = assemble(&test_config(dir.path()), &cancel);
        let resp = runtime
            .m1_app
            .clone()
            .oneshot(
                Request::get("/3gpp-m1/v9/provisioning-sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        cancel.cancel();
    }

    #[tokio::test]
    async fn m5_app_serves_service_access_information() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let runtime = assemble(&test_config(dir.path()), &cancel);
        let resp = runtime
            .m5_app
            .clone()
            .oneshot(
                Request::get("/3gpp-m5/v2/service-access-information/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let server = resp.headers().get("server").unwrap().to_str().unwrap();
        assert!(server.contains("M5_ServiceAccessInformation"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn endpoints_bind_and_answer_over_their_backend() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut config = test_config(dir.path());
        // pick free ports
        let l1 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let l2 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        config.listen[0].address = "127.0.0.1".into();
        config.listen[0].port = l1.local_addr().unwrap().port();
        config.listen[1].address = "127.0.0.1".into();
        config.listen[1].port = l2.local_addr().unwrap().port();
        drop((l1, l2));

        let m1_port = config.listen[0].port;
        let m5_port = config.listen[1].port;
        let run_cancel = cancel.clone();
        let server = tokio::spawn(async move { run(config, run_cancel).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        // the m1 endpoint is h2: a prior-knowledge HTTP/2 client works
        let h2 = reqwest::Client::builder()
            .http2_prior_knowledge()
            .build()
            .unwrap();
        let resp = h2
            .get(format!(
                "http://127.0.0.1:{m1_port}/5gmag-rt-management/v1/provisioning-sessions"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.version(), reqwest::Version::HTTP_2);

        // the m5 endpoint is h1
        let h1 = reqwest::Client::new();
        let resp = h1
            .get(format!(
                "http://127.0.0.1:{m5_port}/3gpp-m5/v2/service-access-information/ghost"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.version(), reqwest::Version::HTTP_11);

        cancel.cancel();
        let _ = server.await;
    }

    #[tokio::test]
    async fn binding_an_occupied_port_fails_with_bind_error() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut config = test_config(dir.path());
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        config.listen.truncate(1);
        config.listen[0].address = "127.0.0.1".into();
        config.listen[0].port = holder.local_addr().unwrap().port();

        let err = run(config, cancel).await.unwrap_err();
        assert!(matches!(err, RunError::Bind { .. }));
    }
}
