//! Provisioning session store and the M1 provisioning API.
//!
//! The store is the authoritative in-memory record of every
//! provisioning session and its derived projections. Mutations are
//! linearised behind one async mutex; each mutation invalidates the
//! session's service access information and, where application servers
//! are affected, emits reconciliation events for the M3 engine. The
//! store never blocks on an application server: M1 writes return once
//! validated and enqueued.

pub mod certificates;
pub mod chc;
pub mod content_protocols;
pub mod error;
pub mod http;
pub mod policy;
pub mod reporting;
pub mod sai;
pub mod session;
pub mod sync;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use msaf_common::{ids, metadata, ResourceMetadata};
use serde_json::Value;

use certificates::{
    certificate_filename, CertificateRecord, CertificateState, CertmgrClient, CertmgrVerb,
};
use chc::{ApplicationServerInfo, ChcRecord};
pub use error::ProvisioningError;
use policy::{PolicyTemplate, PolicyTemplateNode, PolicyTemplateState};
use reporting::{ConsumptionReportingConfiguration, MetricsReportingConfiguration};
use sai::{SaiContext, SaiSnapshot};
use session::{ProvisioningSession, ProvisioningSessionDocument, ProvisioningSessionRequest};
use sync::{PurgeTracker, SyncEvent, SyncSender};

/// Deployment facts the store needs at construction time.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub application_servers: Vec<ApplicationServerInfo>,
    pub certificate_manager: PathBuf,
    pub certificate_dir: PathBuf,
    pub sai: SaiContext,
}

// ── Internal shared state ───────────────────────────────────────────

/// All provisioning sessions, keyed by id. Only core methods touch it.
pub(crate) struct ProvisioningState {
    sessions: HashMap<String, ProvisioningSession>,
}

/// Result of a certificate creation on M1.
#[derive(Debug)]
pub struct CertificateCreated {
    pub certificate_id: String,
    pub af_unique_id: String,
    /// Present for the CSR flow: the signing request PEM to return to
    /// the provider.
    pub csr_pem: Option<String>,
    pub metadata: ResourceMetadata,
}

// ── ProvisioningCore: domain facade ─────────────────────────────────

/// The main provisioning facade.
///
/// The M1/M5 routers and the reconciliation engine all go through this
/// type; it owns the store, the certificate manager handle, and the
/// event channel towards the application servers.
pub struct ProvisioningCore {
    state: tokio::sync::Mutex<ProvisioningState>,
    config: ProvisioningConfig,
    certmgr: CertmgrClient,
    sync: SyncSender,
}

impl ProvisioningCore {
    pub fn new(config: ProvisioningConfig, sync: SyncSender) -> Arc<Self> {
        let certmgr = CertmgrClient::new(config.certificate_manager.clone());
        Arc::new(Self {
            state: tokio::sync::Mutex::new(ProvisioningState {
                sessions: HashMap::new(),
            }),
            config,
            certmgr,
            sync,
        })
    }

    pub fn application_servers(&self) -> &[ApplicationServerInfo] {
        &self.config.application_servers
    }

    fn emit(&self, event: SyncEvent) {
        // The receiver only disappears during shutdown.
        if self.sync.send(event).is_err() {
            tracing::debug!("reconciliation channel closed; event dropped");
        }
    }

    // ── Provisioning sessions ───────────────────────────────────────

    pub async fn create_session(
        &self,
        request: ProvisioningSessionRequest,
    ) -> (ProvisioningSessionDocument, ResourceMetadata) {
        let id = ids::mint_id();
        let session = ProvisioningSession::new(id.clone(), request);
        let document = session.document();
        let meta = session.metadata.clone();
        let mut state = self.state.lock().await;
        state.sessions.insert(id.clone(), session);
        tracing::info!(provisioning_session_id = %id, "provisioning session created");
        (document, meta)
    }

    pub async fn session_document(
        &self,
        id: &str,
    ) -> Result<(ProvisioningSessionDocument, ResourceMetadata), ProvisioningError> {
        let state = self.state.lock().await;
        let session = live_session(&state, id)?;
        Ok((session.document(), session.metadata.clone()))
    }

    /// Live session ids, for the management interface.
    pub async fn session_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .sessions
            .values()
            .filter(|s| !s.deleting)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Deletes a session in two phases: mark it deleting and enqueue
    /// withdrawal of every mirror, then free the record once all
    /// assigned hosts have confirmed through [`Self::confirm_withdrawal`].
    pub async fn delete_session(&self, id: &str) -> Result<(), ProvisioningError> {
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, id)?;
        session.deleting = true;
        let hosts: Vec<String> = session.assigned_hosts.iter().cloned().collect();
        let certificate_ids: Vec<String> = session
            .certificates
            .values()
            .filter(|c| c.state == CertificateState::Uploaded)
            .map(|c| c.af_unique_id.clone())
            .collect();

        if hosts.is_empty() {
            let session = state.sessions.remove(id).expect("present");
            drop(state);
            self.remove_certificate_files(&session);
            tracing::info!(provisioning_session_id = %id, "provisioning session freed");
            return Ok(());
        }

        session.withdrawal_pending = hosts.iter().cloned().collect();
        drop(state);
        self.emit(SyncEvent::WithdrawSession {
            hosts,
            provisioning_session_id: id.to_string(),
            certificate_ids,
        });
        tracing::info!(provisioning_session_id = %id, "provisioning session deleting");
        Ok(())
    }

    /// Called by the reconciliation engine when a host's queues hold
    /// nothing further for a deleting session.
    pub async fn confirm_withdrawal(&self, id: &str, host: &str) {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(id) else {
            return;
        };
        if !session.deleting {
            return;
        }
        session.withdrawal_pending.remove(host);
        if session.withdrawal_pending.is_empty() {
            let session = state.sessions.remove(id).expect("present");
            drop(state);
            self.remove_certificate_files(&session);
            tracing::info!(provisioning_session_id = %id, "provisioning session freed");
        }
    }

    fn remove_certificate_files(&self, session: &ProvisioningSession) {
        for record in session.certificates.values() {
            if let Some(path) = &record.pem_path {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::debug!(path = %path.display(), error = %e, "could not remove PEM");
                }
            }
        }
    }

    // ── Server certificates ─────────────────────────────────────────

    /// Creates a certificate. The plain flow invokes `newcert` and
    /// stores the resulting PEM; the CSR flow (`csr` true) invokes
    /// `newcsr`, leaves the record reserved, and returns the signing
    /// request for the provider to get signed externally.
    pub async fn create_certificate(
        &self,
        session_id: &str,
        csr: bool,
        extra_domains: Vec<String>,
    ) -> Result<CertificateCreated, ProvisioningError> {
        let certificate_id = ids::mint_id();
        let af_unique_id;
        {
            let mut state = self.state.lock().await;
            let session = live_session_mut(&mut state, session_id)?;
            let record = CertificateRecord::reserved(session_id, &certificate_id);
            af_unique_id = record.af_unique_id.clone();
            session.certificates.insert(certificate_id.clone(), record);
        }

        let verb = if csr {
            CertmgrVerb::NewCsr
        } else {
            CertmgrVerb::NewCert
        };
        let pem = match self.certmgr.invoke(verb, &af_unique_id, &extra_domains).await {
            Ok(pem) => pem,
            Err(e) => {
                let mut state = self.state.lock().await;
                if let Some(session) = state.sessions.get_mut(session_id) {
                    session.certificates.remove(&certificate_id);
                }
                return Err(e);
            }
        };

        if csr {
            let meta = ResourceMetadata::for_body(pem.as_bytes());
            let mut state = self.state.lock().await;
            let session = live_session_mut(&mut state, session_id)?;
            if let Some(record) = session.certificates.get_mut(&certificate_id) {
                record.metadata = meta.clone();
            }
            session.touch();
            return Ok(CertificateCreated {
                certificate_id,
                af_unique_id,
                csr_pem: Some(pem),
                metadata: meta,
            });
        }

        self.store_certificate_pem(session_id, &certificate_id, &af_unique_id, &pem)
            .await
    }

    /// Accepts the public certificate PEM for a reserved id (M1 PUT).
    pub async fn upload_certificate_pem(
        &self,
        session_id: &str,
        certificate_id: &str,
        pem: &str,
    ) -> Result<(), ProvisioningError> {
        {
            let state = self.state.lock().await;
            let session = live_session(&state, session_id)?;
            if !session.certificates.contains_key(certificate_id) {
                return Err(ProvisioningError::ResourceNotFound {
                    resource: "certificate",
                    id: certificate_id.to_string(),
                });
            }
        }
        let af_unique_id = ids::af_unique_certificate_id(session_id, certificate_id);
        self.store_certificate_pem(session_id, certificate_id, &af_unique_id, pem)
            .await
            .map(|_| ())
    }

    async fn store_certificate_pem(
        &self,
        session_id: &str,
        certificate_id: &str,
        af_unique_id: &str,
        pem: &str,
    ) -> Result<CertificateCreated, ProvisioningError> {
        let path = certificate_filename(&self.config.certificate_dir, session_id, certificate_id);
        std::fs::create_dir_all(&self.config.certificate_dir)?;
        std::fs::write(&path, pem)?;
        let meta = ResourceMetadata::for_body(pem.as_bytes());

        let hosts;
        {
            let mut state = self.state.lock().await;
            let session = live_session_mut(&mut state, session_id)?;
            let record = session
                .certificates
                .get_mut(certificate_id)
                .ok_or_else(|| ProvisioningError::ResourceNotFound {
                    resource: "certificate",
                    id: certificate_id.to_string(),
                })?;
            record.state = CertificateState::Uploaded;
            record.metadata = meta.clone();
            record.pem_path = Some(path);
            hosts = session.assigned_hosts.iter().cloned().collect::<Vec<_>>();
            session.touch();
        }

        if !hosts.is_empty() {
            self.emit(SyncEvent::UploadCertificate {
                hosts,
                af_unique_id: af_unique_id.to_string(),
            });
        }
        Ok(CertificateCreated {
            certificate_id: certificate_id.to_string(),
            af_unique_id: af_unique_id.to_string(),
            csr_pem: None,
            metadata: meta,
        })
    }

    /// Stored PEM for an M1 read. A reserved id without an uploaded
    /// certificate reads as absent.
    pub async fn certificate_pem(
        &self,
        session_id: &str,
        certificate_id: &str,
    ) -> Result<(String, ResourceMetadata), ProvisioningError> {
        let path;
        let meta;
        {
            let state = self.state.lock().await;
            let session = live_session(&state, session_id)?;
            let record = session.certificates.get(certificate_id).ok_or_else(|| {
                ProvisioningError::ResourceNotFound {
                    resource: "certificate",
                    id: certificate_id.to_string(),
                }
            })?;
            path = record
                .pem_path
                .clone()
                .ok_or_else(|| ProvisioningError::ResourceNotFound {
                    resource: "certificate",
                    id: certificate_id.to_string(),
                })?;
            meta = record.metadata.clone();
        }
        let pem = std::fs::read_to_string(&path)?;
        Ok((pem, meta))
    }

    pub async fn delete_certificate(
        &self,
        session_id: &str,
        certificate_id: &str,
    ) -> Result<(), ProvisioningError> {
        let af_unique_id;
        let pem_path;
        let hosts;
        let was_uploaded;
        {
            let mut state = self.state.lock().await;
            let session = live_session_mut(&mut state, session_id)?;
            if let Some(chc) = &session.chc {
                let referenced = chc
                    .document
                    .distribution_configurations
                    .iter()
                    .any(|d| d.certificate_id.as_deref() == Some(certificate_id));
                if referenced {
                    return Err(ProvisioningError::Conflict(format!(
                        "certificate [{certificate_id}] is referenced by the content hosting configuration"
                    )));
                }
            }
            let record = session.certificates.remove(certificate_id).ok_or_else(|| {
                ProvisioningError::ResourceNotFound {
                    resource: "certificate",
                    id: certificate_id.to_string(),
                }
            })?;
            af_unique_id = record.af_unique_id;
            pem_path = record.pem_path;
            was_uploaded = record.state == CertificateState::Uploaded;
            hosts = session.assigned_hosts.iter().cloned().collect::<Vec<_>>();
            session.touch();
        }

        if let Err(e) = self
            .certmgr
            .invoke(CertmgrVerb::Revoke, &af_unique_id, &[])
            .await
        {
            tracing::warn!(id = %af_unique_id, error = %e, "certificate revocation failed");
        }
        if let Some(path) = pem_path {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "could not remove PEM");
            }
        }
        if was_uploaded && !hosts.is_empty() {
            self.emit(SyncEvent::DeleteCertificate {
                hosts,
                af_unique_id,
            });
        }
        Ok(())
    }

    // ── Content hosting configuration ───────────────────────────────

    pub async fn create_chc(
        &self,
        session_id: &str,
        body: &[u8],
    ) -> Result<(Value, ResourceMetadata), ProvisioningError> {
        self.put_chc(session_id, body, false, None).await
    }

    pub async fn replace_chc(
        &self,
        session_id: &str,
        body: &[u8],
        if_match: Option<&str>,
    ) -> Result<(Value, ResourceMetadata), ProvisioningError> {
        self.put_chc(session_id, body, true, if_match).await
    }

    async fn put_chc(
        &self,
        session_id: &str,
        body: &[u8],
        replace: bool,
        if_match: Option<&str>,
    ) -> Result<(Value, ResourceMetadata), ProvisioningError> {
        let first_as = self.config.application_servers.first().cloned();
        let all_hosts: Vec<String> = self
            .config
            .application_servers
            .iter()
            .map(|a| a.canonical_hostname.clone())
            .collect();

        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;

        match (&session.chc, replace) {
            (Some(_), false) => {
                return Err(ProvisioningError::Conflict(
                    "a content hosting configuration already exists".into(),
                ))
            }
            (None, true) => {
                return Err(ProvisioningError::ResourceNotFound {
                    resource: "content hosting configuration",
                    id: session_id.to_string(),
                })
            }
            _ => {}
        }
        if let (Some(existing), Some(tags)) = (&session.chc, if_match) {
            let satisfied = tags.trim() == "*"
                || tags
                    .split(',')
                    .any(|tag| metadata::etag_weak_eq(tag, &existing.metadata.etag));
            if !satisfied {
                return Err(ProvisioningError::PreconditionFailed);
            }
        }

        let known: std::collections::BTreeSet<String> =
            session.certificates.keys().cloned().collect();
        let mut document = chc::parse_and_validate(body, &known)?;
        if let Some(as_info) = &first_as {
            chc::derive_distribution_urls(&mut document, session_id, as_info);
        }

        let canonical_hash = ChcRecord::canonical_hash_of(&document);
        if let Some(existing) = &session.chc {
            // An identical replacement enqueues no reconciliation work.
            if existing.canonical_hash == canonical_hash {
                let json = serde_json::to_value(&existing.document).unwrap_or(Value::Null);
                return Ok((json, existing.metadata.clone()));
            }
        }

        let rewritten = chc::with_af_unique_certificate_ids(&document, session_id);
        let json = serde_json::to_value(&document).unwrap_or(Value::Null);
        let meta = ResourceMetadata::for_body(&serde_json::to_vec(&document).unwrap_or_default());
        session.chc = Some(ChcRecord {
            document,
            rewritten,
            metadata: meta.clone(),
            canonical_hash,
        });

        let newly_assigned = session.assigned_hosts.is_empty() && !all_hosts.is_empty();
        if newly_assigned {
            session.assigned_hosts = all_hosts.iter().cloned().collect();
        }
        let uploaded_certs: Vec<String> = session
            .certificates
            .values()
            .filter(|c| c.state == CertificateState::Uploaded)
            .map(|c| c.af_unique_id.clone())
            .collect();
        session.touch();
        drop(state);

        if !all_hosts.is_empty() {
            if newly_assigned {
                for af_unique_id in uploaded_certs {
                    self.emit(SyncEvent::UploadCertificate {
                        hosts: all_hosts.clone(),
                        af_unique_id,
                    });
                }
            }
            self.emit(SyncEvent::UploadContentHosting {
                hosts: all_hosts,
                provisioning_session_id: session_id.to_string(),
            });
        }
        Ok((json, meta))
    }

    pub async fn chc_document(
        &self,
        session_id: &str,
    ) -> Result<(Value, ResourceMetadata), ProvisioningError> {
        let state = self.state.lock().await;
        let session = live_session(&state, session_id)?;
        let chc = session
            .chc
            .as_ref()
            .ok_or_else(|| ProvisioningError::ResourceNotFound {
                resource: "content hosting configuration",
                id: session_id.to_string(),
            })?;
        Ok((
            serde_json::to_value(&chc.document).unwrap_or(Value::Null),
            chc.metadata.clone(),
        ))
    }

    pub async fn delete_chc(&self, session_id: &str) -> Result<(), ProvisioningError> {
        let hosts;
        {
            let mut state = self.state.lock().await;
            let session = live_session_mut(&mut state, session_id)?;
            if session.chc.take().is_none() {
                return Err(ProvisioningError::ResourceNotFound {
                    resource: "content hosting configuration",
                    id: session_id.to_string(),
                });
            }
            hosts = session.assigned_hosts.iter().cloned().collect::<Vec<_>>();
            session.touch();
        }
        if !hosts.is_empty() {
            self.emit(SyncEvent::DeleteContentHosting {
                hosts,
                provisioning_session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Starts a cache purge on every assigned host. The returned tracker
    /// resolves once all hosts have reported.
    pub async fn purge_chc(
        &self,
        session_id: &str,
        pattern: Option<String>,
    ) -> Result<Arc<PurgeTracker>, ProvisioningError> {
        let hosts;
        {
            let state = self.state.lock().await;
            let session = live_session(&state, session_id)?;
            if session.chc.is_none() {
                return Err(ProvisioningError::ResourceNotFound {
                    resource: "content hosting configuration",
                    id: session_id.to_string(),
                });
            }
            hosts = session.assigned_hosts.iter().cloned().collect::<Vec<_>>();
        }
        let tracker = PurgeTracker::new(hosts.len());
        if !hosts.is_empty() {
            self.emit(SyncEvent::PurgeContentHostingCache {
                hosts,
                provisioning_session_id: session_id.to_string(),
                pattern,
                tracker: Arc::clone(&tracker),
            });
        }
        Ok(tracker)
    }

    // ── Policy templates ────────────────────────────────────────────

    pub async fn create_policy_template(
        &self,
        session_id: &str,
        body: &[u8],
    ) -> Result<(PolicyTemplate, String, ResourceMetadata), ProvisioningError> {
        let template = policy::parse_template(body)?;
        let id = ids::mint_id();
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        let node = PolicyTemplateNode::new(template, id.clone());
        let document = node.document();
        let meta = node.metadata.clone();
        session.policy_templates.insert(id.clone(), node);
        session.touch();
        Ok((document, id, meta))
    }

    pub async fn policy_template(
        &self,
        session_id: &str,
        template_id: &str,
    ) -> Result<(PolicyTemplate, ResourceMetadata), ProvisioningError> {
        let state = self.state.lock().await;
        let session = live_session(&state, session_id)?;
        let node = session.policy_templates.get(template_id).ok_or_else(|| {
            ProvisioningError::ResourceNotFound {
                resource: "policy template",
                id: template_id.to_string(),
            }
        })?;
        Ok((node.document(), node.metadata.clone()))
    }

    pub async fn replace_policy_template(
        &self,
        session_id: &str,
        template_id: &str,
        body: &[u8],
    ) -> Result<(PolicyTemplate, ResourceMetadata), ProvisioningError> {
        let template = policy::parse_template(body)?;
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        let node = session
            .policy_templates
            .get_mut(template_id)
            .ok_or_else(|| ProvisioningError::ResourceNotFound {
                resource: "policy template",
                id: template_id.to_string(),
            })?;
        node.replace(template);
        let document = node.document();
        let meta = node.metadata.clone();
        session.touch();
        Ok((document, meta))
    }

    pub async fn delete_policy_template(
        &self,
        session_id: &str,
        template_id: &str,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        if session.policy_templates.remove(template_id).is_none() {
            return Err(ProvisioningError::ResourceNotFound {
                resource: "policy template",
                id: template_id.to_string(),
            });
        }
        session.touch();
        Ok(())
    }

    /// Operator decision on a pending template (management interface).
    pub async fn set_policy_template_state(
        &self,
        session_id: &str,
        template_id: &str,
        new_state: PolicyTemplateState,
        reason: Option<Value>,
    ) -> Result<bool, ProvisioningError> {
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        let node = session
            .policy_templates
            .get_mut(template_id)
            .ok_or_else(|| ProvisioningError::ResourceNotFound {
                resource: "policy template",
                id: template_id.to_string(),
            })?;
        let changed = node.set_state(new_state, reason)?;
        if changed {
            session.touch();
        }
        Ok(changed)
    }

    /// Template lookup for dynamic policy instantiation on M5: the
    /// template must exist and be in `VALID` state.
    pub async fn valid_policy_template(
        &self,
        session_id: &str,
        template_id: &str,
    ) -> Result<PolicyTemplate, ProvisioningError> {
        let state = self.state.lock().await;
        let session = live_session(&state, session_id)?;
        let node = session.policy_templates.get(template_id).ok_or_else(|| {
            ProvisioningError::ResourceNotFound {
                resource: "policy template",
                id: template_id.to_string(),
            }
        })?;
        if node.state != PolicyTemplateState::Valid {
            return Err(ProvisioningError::invalid_param(
                "policyTemplateId",
                "Not in VALID state",
                format!("policy template [{template_id}] has not been approved"),
            ));
        }
        Ok(node.document())
    }

    // ── Reporting configurations ────────────────────────────────────

    pub async fn create_consumption_reporting(
        &self,
        session_id: &str,
        body: &[u8],
    ) -> Result<(ConsumptionReportingConfiguration, ResourceMetadata), ProvisioningError> {
        let config = reporting::parse_consumption_configuration(body)?;
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        if session.consumption_reporting.is_some() {
            return Err(ProvisioningError::Conflict(
                "a consumption reporting configuration already exists".into(),
            ));
        }
        let meta = ResourceMetadata::for_body(&serde_json::to_vec(&config).unwrap_or_default());
        session.consumption_reporting = Some((config.clone(), meta.clone()));
        session.touch();
        Ok((config, meta))
    }

    pub async fn consumption_reporting(
        &self,
        session_id: &str,
    ) -> Result<(ConsumptionReportingConfiguration, ResourceMetadata), ProvisioningError> {
        let state = self.state.lock().await;
        let session = live_session(&state, session_id)?;
        session
            .consumption_reporting
            .clone()
            .ok_or_else(|| ProvisioningError::ResourceNotFound {
                resource: "consumption reporting configuration",
                id: session_id.to_string(),
            })
    }

    pub async fn replace_consumption_reporting(
        &self,
        session_id: &str,
        body: &[u8],
    ) -> Result<(ConsumptionReportingConfiguration, ResourceMetadata), ProvisioningError> {
        let config = reporting::parse_consumption_configuration(body)?;
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        if session.consumption_reporting.is_none() {
            return Err(ProvisioningError::ResourceNotFound {
                resource: "consumption reporting configuration",
                id: session_id.to_string(),
            });
        }
        let meta = ResourceMetadata::for_body(&serde_json::to_vec(&config).unwrap_or_default());
        session.consumption_reporting = Some((config.clone(), meta.clone()));
        session.touch();
        Ok((config, meta))
    }

    pub async fn delete_consumption_reporting(
        &self,
        session_id: &str,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        if session.consumption_reporting.take().is_none() {
            return Err(ProvisioningError::ResourceNotFound {
                resource: "consumption reporting configuration",
                id: session_id.to_string(),
            });
        }
        session.touch();
        Ok(())
    }

    pub async fn create_metrics_configuration(
        &self,
        session_id: &str,
        body: &[u8],
    ) -> Result<(MetricsReportingConfiguration, String, ResourceMetadata), ProvisioningError> {
        let mut config = reporting::parse_metrics_configuration(body)?;
        let id = ids::mint_id();
        config.metrics_reporting_configuration_id = Some(id.clone());
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        let meta = ResourceMetadata::for_body(&serde_json::to_vec(&config).unwrap_or_default());
        session
            .metrics_reporting
            .insert(id.clone(), (config.clone(), meta.clone()));
        session.touch();
        Ok((config, id, meta))
    }

    pub async fn metrics_configuration(
        &self,
        session_id: &str,
        configuration_id: &str,
    ) -> Result<(MetricsReportingConfiguration, ResourceMetadata), ProvisioningError> {
        let state = self.state.lock().await;
        let session = live_session(&state, session_id)?;
        session
            .metrics_reporting
            .get(configuration_id)
            .cloned()
            .ok_or_else(|| ProvisioningError::ResourceNotFound {
                resource: "metrics reporting configuration",
                id: configuration_id.to_string(),
            })
    }

    pub async fn replace_metrics_configuration(
        &self,
        session_id: &str,
        configuration_id: &str,
        body: &[u8],
    ) -> Result<(MetricsReportingConfiguration, ResourceMetadata), ProvisioningError> {
        let mut config = reporting::parse_metrics_configuration(body)?;
        config.metrics_reporting_configuration_id = Some(configuration_id.to_string());
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        if !session.metrics_reporting.contains_key(configuration_id) {
            return Err(ProvisioningError::ResourceNotFound {
                resource: "metrics reporting configuration",
                id: configuration_id.to_string(),
            });
        }
        let meta = ResourceMetadata::for_body(&serde_json::to_vec(&config).unwrap_or_default());
        session
            .metrics_reporting
            .insert(configuration_id.to_string(), (config.clone(), meta.clone()));
        session.touch();
        Ok((config, meta))
    }

    pub async fn delete_metrics_configuration(
        &self,
        session_id: &str,
        configuration_id: &str,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        if session.metrics_reporting.remove(configuration_id).is_none() {
            return Err(ProvisioningError::ResourceNotFound {
                resource: "metrics reporting configuration",
                id: configuration_id.to_string(),
            });
        }
        session.touch();
        Ok(())
    }

    // ── Service access information ──────────────────────────────────

    /// Returns the memoised service access information, rebuilding it if
    /// any contributing entity changed since the last read.
    pub async fn service_access_information(
        &self,
        session_id: &str,
    ) -> Result<SaiSnapshot, ProvisioningError> {
        let mut state = self.state.lock().await;
        let session = live_session_mut(&mut state, session_id)?;
        if let Some(snapshot) = &session.sai {
            if snapshot.generation == session.sai_generation {
                return Ok(snapshot.clone());
            }
        }
        let snapshot = sai::build(session, &self.config.sai);
        session.sai = Some(snapshot.clone());
        Ok(snapshot)
    }

    // ── Reconciliation engine reads ─────────────────────────────────

    /// Serialized projection shipped on M3 for a session's content
    /// hosting configuration.
    pub async fn rewritten_chc(&self, session_id: &str) -> Option<Value> {
        let state = self.state.lock().await;
        let session = state.sessions.get(session_id)?;
        let chc = session.chc.as_ref()?;
        serde_json::to_value(&chc.rewritten).ok()
    }

    /// PEM payload for an M3 certificate push, by AF-unique id.
    pub async fn certificate_pem_by_af_id(&self, af_unique_id: &str) -> Option<String> {
        let (session_id, certificate_id) = ids::split_af_unique_certificate_id(af_unique_id)?;
        let path = {
            let state = self.state.lock().await;
            let session = state.sessions.get(session_id)?;
            session
                .certificates
                .get(certificate_id)?
                .pem_path
                .clone()?
        };
        std::fs::read_to_string(path).ok()
    }
}

/// Read access to a live (not deleting) session.
fn live_session<'a>(
    state: &'a ProvisioningState,
    id: &str,
) -> Result<&'a ProvisioningSession, ProvisioningError> {
    state
        .sessions
        .get(id)
        .filter(|s| !s.deleting)
        .ok_or_else(|| ProvisioningError::SessionNotFound(id.to_string()))
}

fn live_session_mut<'a>(
    state: &'a mut ProvisioningState,
    id: &str,
) -> Result<&'a mut ProvisioningSession, ProvisioningError> {
    state
        .sessions
        .get_mut(id)
        .filter(|s| !s.deleting)
        .ok_or_else(|| ProvisioningError::SessionNotFound(id.to_string()))
}
