//! Server certificates and the external certificate manager.
//!
//! Certificate key material never lives in this process: a helper
//! executable is invoked per operation and hands PEM back on stdout.
//! The AF stores the PEM under the certificate directory and pushes it
//! to application servers under the AF-unique identifier
//! `<provisioningSessionId>:<certificateId>`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use msaf_common::{ids, ResourceMetadata};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::ProvisioningError;

/// Lifecycle of one server certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateState {
    /// Id allocated (CSR flow), no public certificate yet.
    Reserved,
    /// PEM on disk, propagation to application servers queued or done.
    Uploaded,
}

#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub certificate_id: String,
    pub af_unique_id: String,
    pub state: CertificateState,
    pub metadata: ResourceMetadata,
    pub pem_path: Option<PathBuf>,
}

impl CertificateRecord {
    pub fn reserved(provisioning_session_id: &str, certificate_id: &str) -> Self {
        Self {
            certificate_id: certificate_id.to_string(),
            af_unique_id: ids::af_unique_certificate_id(provisioning_session_id, certificate_id),
            state: CertificateState::Reserved,
            metadata: ResourceMetadata {
                etag: String::new(),
                last_modified: Utc::now(),
            },
            pem_path: None,
        }
    }
}

/// PEM filename for an AF-unique certificate id. The `:` separator is
/// not portable in filenames, so the on-disk form uses `_`.
pub fn certificate_filename(
    cert_dir: &Path,
    provisioning_session_id: &str,
    certificate_id: &str,
) -> PathBuf {
    cert_dir.join(format!("{provisioning_session_id}_{certificate_id}.pem"))
}

// ── Certificate manager subprocess ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertmgrVerb {
    NewCert,
    NewCsr,
    RenewCert,
    Revoke,
}

impl CertmgrVerb {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NewCert => "newcert",
            Self::NewCsr => "newcsr",
            Self::RenewCert => "renewcert",
            Self::Revoke => "revoke",
        }
    }
}

/// Handle on the external certificate manager executable.
#[derive(Debug, Clone)]
pub struct CertmgrClient {
    executable: PathBuf,
    timeout: Duration,
}

impl CertmgrClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs `certmgr <verb> <afUniqueId> [extraDomain…]` and returns its
    /// stdout (PEM for the issuing verbs, empty for revoke).
    ///
    /// Exit code 2 is a naming error and surfaces as a validation
    /// failure; any other non-zero exit, spawn failure, or timeout is a
    /// certificate authority error.
    pub async fn invoke(
        &self,
        verb: CertmgrVerb,
        af_unique_id: &str,
        extra_domains: &[String],
    ) -> Result<String, ProvisioningError> {
        let mut command = Command::new(&self.executable);
        command
            .arg(verb.as_str())
            .arg(af_unique_id)
            .args(extra_domains)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ProvisioningError::CertificateAuthority(format!(
                "could not start {}: {e}",
                self.executable.display()
            ))
        })?;

        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let run = async {
            let mut out = String::new();
            let mut err = String::new();
            let (read_out, read_err) = tokio::join!(
                stdout.read_to_string(&mut out),
                stderr.read_to_string(&mut err),
            );
            read_out?;
            read_err?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let (status, out, err) = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                return Err(ProvisioningError::CertificateAuthority(format!(
                    "certificate manager i/o failure: {e}"
                )));
            }
            Err(_) => {
                return Err(ProvisioningError::CertificateAuthority(format!(
                    "certificate manager timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if !err.is_empty() {
            tracing::warn!(
                verb = verb.as_str(),
                id = af_unique_id,
                stderr = err.trim(),
                "certificate manager wrote to stderr"
            );
        }

        match status.code() {
            Some(0) => Ok(out),
            Some(2) => Err(ProvisioningError::invalid_param(
                "certificateId",
                "Naming error",
                format!("certificate manager rejected the name [{af_unique_id}]"),
            )),
            Some(code) => Err(ProvisioningError::CertificateAuthority(format!(
                "certificate manager exited with status {code}"
            ))),
            None => Err(ProvisioningError::CertificateAuthority(
                "certificate manager terminated by signal".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_deterministic_and_portable() {
        let path = certificate_filename(Path::new("/var/cache/msaf"), "ps1", "cert1");
        assert_eq!(path, PathBuf::from("/var/cache/msaf/ps1_cert1.pem"));
    }

    #[test]
    fn reserved_record_has_af_unique_id() {
        let record = CertificateRecord::reserved("ps1", "cert1");
        assert_eq!(record.af_unique_id, "ps1:cert1");
        assert_eq!(record.state, CertificateState::Reserved);
        assert!(record.pem_path.is_none());
    }

    fn stub_certmgr(dir: &Path, body: &str, exit: i32) -> PathBuf {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("certmgr");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "printf '%s' '{body}'").unwrap();
        writeln!(f, "echo 'noise' >&2").unwrap();
        writeln!(f, "exit {exit}").unwrap();
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn invoke_captures_stdout_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let exe = stub_certmgr(dir.path(), "-----BEGIN CERTIFICATE-----", 0);
        let client = CertmgrClient::new(exe);
        let pem = client
            .invoke(CertmgrVerb::NewCert, "ps1:cert1", &[])
            .await
            .unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn invoke_maps_exit_one_to_ca_error() {
        let dir = tempfile::tempdir().unwrap();
        let exe = stub_certmgr(dir.path(), "", 1);
        let client = CertmgrClient::new(exe);
        let err = client
            .invoke(CertmgrVerb::NewCert, "ps1:cert1", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::CertificateAuthority(_)));
    }

    #[tokio::test]
    async fn invoke_maps_exit_two_to_naming_error() {
        let dir = tempfile::tempdir().unwrap();
        let exe = stub_certmgr(dir.path(), "", 2);
        let client = CertmgrClient::new(exe);
        let err = client
            .invoke(CertmgrVerb::NewCert, "ps1:bad name", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Validation { .. }));
    }

    #[tokio::test]
    async fn invoke_times_out_on_hung_manager() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certmgr");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\nsleep 60").unwrap();
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let client = CertmgrClient::new(path).with_timeout(Duration::from_millis(100));
        let err = client
            .invoke(CertmgrVerb::NewCert, "ps1:cert1", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::CertificateAuthority(_)));
    }

    #[tokio::test]
    async fn invoke_reports_missing_executable() {
        let client = CertmgrClient::new(PathBuf::from("/nonexistent/certmgr"));
        let err = client
            .invoke(CertmgrVerb::Revoke, "ps1:cert1", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::CertificateAuthority(_)));
    }
}
