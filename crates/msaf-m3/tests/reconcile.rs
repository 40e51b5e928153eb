//! Reconciliation driven against stub application servers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::response::IntoResponse;
use axum::Router;
use tokio_util::sync::CancellationToken;

use msaf_m3::{AsRegistry, ReconcilerOptions};
use msaf_provisioning::chc::ApplicationServerInfo;
use msaf_provisioning::sai::SaiContext;
use msaf_provisioning::session::{ProvisioningSessionRequest, ProvisioningSessionType};
use msaf_provisioning::{sync, ProvisioningConfig, ProvisioningCore};

type RequestLog = Arc<Mutex<Vec<(String, String, String)>>>;

/// Catch-all stub for the `/3gpp-m3/v1` surface: records every request
/// and answers like a compliant application server.
async fn stub_handler(State(log): State<RequestLog>, request: Request) -> axum::response::Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    log.lock()
        .unwrap()
        .push((method.clone(), path.clone(), String::from_utf8_lossy(&body).into_owned()));

    if method == "GET" {
        return axum::Json(Vec::<String>::new()).into_response();
    }
    if path.ends_with("/purge") {
        return "3".into_response();
    }
    axum::http::StatusCode::NO_CONTENT.into_response()
}

async fn spawn_stub(log: RequestLog) -> u16 {
    let app = Router::new().fallback(stub_handler).with_state(log);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    port
}

fn stub_certmgr(dir: &Path) -> PathBuf {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("certmgr");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(
        f,
        "#!/bin/sh\nprintf -- '-----BEGIN CERTIFICATE-----\\ncanned\\n-----END CERTIFICATE-----\\n'\n"
    )
    .unwrap();
    drop(f);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn fast_options() -> ReconcilerOptions {
    ReconcilerOptions {
        request_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
    }
}

fn server(port: u16) -> ApplicationServerInfo {
    ApplicationServerInfo {
        canonical_hostname: "127.0.0.1".into(),
        url_path_prefix_format: "/m4d/provisioning-session-{provisioningSessionId}/".into(),
        m3_port: port,
    }
}

fn core_with(
    dir: &Path,
    servers: Vec<ApplicationServerInfo>,
) -> (Arc<ProvisioningCore>, sync::SyncReceiver) {
    let (tx, rx) = sync::channel();
    let core = ProvisioningCore::new(
        ProvisioningConfig {
            application_servers: servers,
            certificate_manager: stub_certmgr(dir),
            certificate_dir: dir.join("certs"),
            sai: SaiContext {
                m5_server_addresses: vec!["https://af.example.com:7778".into()],
                network_assistance: false,
            },
        },
        tx,
    );
    (core, rx)
}

fn request() -> ProvisioningSessionRequest {
    ProvisioningSessionRequest {
        provisioning_session_type: ProvisioningSessionType::Downlink,
        app_id: "app1".into(),
        external_application_id: None,
        asp_id: Some("asp1".into()),
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn pushes_certificate_then_configuration_after_probes() {
    let dir = tempfile::tempdir().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let port = spawn_stub(Arc::clone(&log)).await;
    let (core, rx) = core_with(dir.path(), vec![server(port)]);

    let cancel = CancellationToken::new();
    let _registry = AsRegistry::spawn(
        core.application_servers(),
        Arc::clone(&core),
        rx,
        fast_options(),
        cancel.clone(),
    );

    let (doc, _) = core.create_session(request()).await;
    let ps = doc.provisioning_session_id.clone();
    let cert = core.create_certificate(&ps, false, vec![]).await.unwrap();
    let chc = format!(
        r#"{{"name":"demo","distributionConfigurations":[{{"entryPoint":{{"relativePath":"m.mpd","contentType":"application/dash+xml"}},"certificateId":"{}"}}]}}"#,
        cert.certificate_id
    );
    core.create_chc(&ps, chc.as_bytes()).await.unwrap();

    let expected_cert_path = format!("/3gpp-m3/v1/certificates/{}", cert.af_unique_id);
    let expected_chc_path = format!("/3gpp-m3/v1/content-hosting-configurations/{ps}");
    {
        let log = Arc::clone(&log);
        wait_for("certificate and configuration push", move || {
            let log = log.lock().unwrap();
            log.iter().any(|(m, p, _)| m == "POST" && p == &expected_chc_path)
        })
        .await;
    }

    let log = log.lock().unwrap();
    let paths: Vec<(String, String)> =
        log.iter().map(|(m, p, _)| (m.clone(), p.clone())).collect();
    assert_eq!(
        paths[0],
        ("GET".to_string(), "/3gpp-m3/v1/certificates".to_string())
    );
    assert_eq!(
        paths[1],
        (
            "GET".to_string(),
            "/3gpp-m3/v1/content-hosting-configurations".to_string()
        )
    );
    assert_eq!(
        paths[2],
        ("POST".to_string(), expected_cert_path.clone())
    );

    // certificate body is the PEM the certificate manager emitted
    let cert_push = log
        .iter()
        .find(|(m, p, _)| m == "POST" && p == &expected_cert_path)
        .unwrap();
    assert!(cert_push.2.contains("BEGIN CERTIFICATE"));

    // the shipped configuration carries the AF-unique certificate id
    let chc_push = log
        .iter()
        .find(|(m, p, _)| m == "POST" && p.contains("/content-hosting-configurations/"))
        .unwrap();
    assert!(chc_push.2.contains(&cert.af_unique_id));

    cancel.cancel();
}

#[tokio::test]
async fn deleting_a_session_withdraws_its_mirrors_and_frees_it() {
    let dir = tempfile::tempdir().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let port = spawn_stub(Arc::clone(&log)).await;
    let (core, rx) = core_with(dir.path(), vec![server(port)]);

    let cancel = CancellationToken::new();
    let _registry = AsRegistry::spawn(
        core.application_servers(),
        Arc::clone(&core),
        rx,
        fast_options(),
        cancel.clone(),
    );

    let (doc, _) = core.create_session(request()).await;
    let ps = doc.provisioning_session_id.clone();
    let cert = core.create_certificate(&ps, false, vec![]).await.unwrap();
    let chc = format!(
        r#"{{"name":"demo","distributionConfigurations":[{{"certificateId":"{}"}}]}}"#,
        cert.certificate_id
    );
    core.create_chc(&ps, chc.as_bytes()).await.unwrap();

    let chc_path = format!("/3gpp-m3/v1/content-hosting-configurations/{ps}");
    {
        let log = Arc::clone(&log);
        let chc_path = chc_path.clone();
        wait_for("initial push", move || {
            log.lock().unwrap().iter().any(|(m, p, _)| m == "POST" && p == &chc_path)
        })
        .await;
    }

    core.delete_session(&ps).await.unwrap();
    {
        let log = Arc::clone(&log);
        let chc_path = chc_path.clone();
        wait_for("withdrawal", move || {
            log.lock()
                .unwrap()
                .iter()
                .any(|(m, p, _)| m == "DELETE" && p == &chc_path)
        })
        .await;
    }
    {
        let cert_path = format!("/3gpp-m3/v1/certificates/{}", cert.af_unique_id);
        let log = Arc::clone(&log);
        wait_for("certificate withdrawal", move || {
            log.lock()
                .unwrap()
                .iter()
                .any(|(m, p, _)| m == "DELETE" && p == &cert_path)
        })
        .await;
    }

    // once every mirror is withdrawn the record is freed
    let mut freed = false;
    for _ in 0..200 {
        if core.rewritten_chc(&ps).await.is_none() {
            freed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(freed, "session record was not freed after withdrawal");
    cancel.cancel();
}

#[tokio::test]
async fn briefly_unreachable_server_catches_up_after_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let log_a: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let port_a = spawn_stub(Arc::clone(&log_a)).await;

    // reserve a port for the second server, then leave it closed
    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_b = reserved.local_addr().unwrap().port();
    drop(reserved);

    let (core, rx) = core_with(dir.path(), vec![server(port_a), server(port_b)]);
    let cancel = CancellationToken::new();
    let _registry = AsRegistry::spawn(
        core.application_servers(),
        Arc::clone(&core),
        rx,
        fast_options(),
        cancel.clone(),
    );

    let (doc, _) = core.create_session(request()).await;
    let ps = doc.provisioning_session_id.clone();
    let chc = br#"{"name":"demo","distributionConfigurations":[{"entryPoint":{"relativePath":"m.mpd","contentType":"application/dash+xml"}}]}"#;
    core.create_chc(&ps, chc).await.unwrap();

    let chc_path = format!("/3gpp-m3/v1/content-hosting-configurations/{ps}");
    {
        let log = Arc::clone(&log_a);
        let chc_path = chc_path.clone();
        wait_for("reachable server push", move || {
            log.lock().unwrap().iter().any(|(m, p, _)| m == "POST" && p == &chc_path)
        })
        .await;
    }

    // bring the second server up on the reserved port; the backed-off
    // node must deliver the same configuration with no loss
    let log_b: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .fallback(stub_handler)
        .with_state(Arc::clone(&log_b));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port_b))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    {
        let log = Arc::clone(&log_b);
        wait_for("late server push", move || {
            log.lock().unwrap().iter().any(|(m, p, _)| m == "POST" && p == &chc_path)
        })
        .await;
    }
    cancel.cancel();
}
