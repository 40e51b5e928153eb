//! Provisioning session entities.
//!
//! A provisioning session is the root record grouping everything a
//! content provider configures for one media delivery session: the
//! content hosting configuration, server certificates, policy templates,
//! and reporting configurations. All cross-references between a session
//! and the application servers mirroring it are by id, never by pointer;
//! lookups go through the central store maps.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use msaf_common::ResourceMetadata;
use serde::{Deserialize, Serialize};

use crate::certificates::CertificateRecord;
use crate::chc::ChcRecord;
use crate::policy::PolicyTemplateNode;
use crate::reporting::{ConsumptionReportingConfiguration, MetricsReportingConfiguration};
use crate::sai::SaiSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningSessionType {
    Downlink,
    Uplink,
}

/// The document a provider POSTs to create a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProvisioningSessionRequest {
    pub provisioning_session_type: ProvisioningSessionType,
    pub app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_application_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asp_id: Option<String>,
}

/// The document returned on M1 reads of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningSessionDocument {
    pub provisioning_session_id: String,
    pub provisioning_session_type: ProvisioningSessionType,
    pub app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_application_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asp_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub server_certificate_ids: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub policy_template_ids: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub metrics_reporting_configuration_ids: BTreeSet<String>,
}

/// One provisioning session held by the store.
#[derive(Debug)]
pub struct ProvisioningSession {
    pub id: String,
    pub session_type: ProvisioningSessionType,
    pub app_id: String,
    pub external_application_id: Option<String>,
    pub asp_id: Option<String>,
    pub created: DateTime<Utc>,
    pub metadata: ResourceMetadata,

    pub chc: Option<ChcRecord>,
    pub certificates: BTreeMap<String, CertificateRecord>,
    pub policy_templates: BTreeMap<String, PolicyTemplateNode>,
    pub consumption_reporting: Option<(ConsumptionReportingConfiguration, ResourceMetadata)>,
    pub metrics_reporting:
        BTreeMap<String, (MetricsReportingConfiguration, ResourceMetadata)>,

    /// Canonical hostnames of the application servers mirroring this
    /// session. Populated when a content hosting configuration is first
    /// activated.
    pub assigned_hosts: BTreeSet<String>,

    /// Memoised service access information; cleared by any mutation of a
    /// contributing entity.
    pub sai: Option<SaiSnapshot>,
    pub sai_generation: u64,

    /// Set during the first phase of deletion. A deleting session is
    /// invisible to M1 and M5 reads; the record is freed once every
    /// assigned host confirms its mirrors are withdrawn.
    pub deleting: bool,
    pub withdrawal_pending: BTreeSet<String>,
}

impl ProvisioningSession {
    pub fn new(id: String, request: ProvisioningSessionRequest) -> Self {
        let created = Utc::now();
        let mut session = Self {
            id,
            session_type: request.provisioning_session_type,
            app_id: request.app_id,
            external_application_id: request.external_application_id,
            asp_id: request.asp_id,
            created,
            metadata: ResourceMetadata {
                etag: String::new(),
                last_modified: created,
            },
            chc: None,
            certificates: BTreeMap::new(),
            policy_templates: BTreeMap::new(),
            consumption_reporting: None,
            metrics_reporting: BTreeMap::new(),
            assigned_hosts: BTreeSet::new(),
            sai: None,
            sai_generation: 0,
            deleting: false,
            withdrawal_pending: BTreeSet::new(),
        };
        session.refresh_metadata();
        session
    }

    /// The M1 representation of this session.
    pub fn document(&self) -> ProvisioningSessionDocument {
        ProvisioningSessionDocument {
            provisioning_session_id: self.id.clone(),
            provisioning_session_type: self.session_type,
            app_id: self.app_id.clone(),
            external_application_id: self.external_application_id.clone(),
            asp_id: self.asp_id.clone(),
            server_certificate_ids: self.certificates.keys().cloned().collect(),
            policy_template_ids: self.policy_templates.keys().cloned().collect(),
            metrics_reporting_configuration_ids: self.metrics_reporting.keys().cloned().collect(),
        }
    }

    /// Recomputes the session document's entity tag after a mutation.
    pub fn refresh_metadata(&mut self) {
        let body = serde_json::to_vec(&self.document()).unwrap_or_default();
        self.metadata = ResourceMetadata::for_body(&body);
    }

    /// Invalidates the memoised service access information.
    pub fn touch(&mut self) {
        self.sai = None;
        self.sai_generation += 1;
        self.refresh_metadata();
    }

    /// The latest modification time across contributing entities, used
    /// as the service access information Last-Modified.
    pub fn latest_modification(&self) -> DateTime<Utc> {
        let mut latest = self.metadata.last_modified;
        if let Some(chc) = &self.chc {
            latest = latest.max(chc.metadata.last_modified);
        }
        for cert in self.certificates.values() {
            latest = latest.max(cert.metadata.last_modified);
        }
        for node in self.policy_templates.values() {
            latest = latest.max(node.metadata.last_modified);
        }
        if let Some((_, meta)) = &self.consumption_reporting {
            latest = latest.max(meta.last_modified);
        }
        for (_, meta) in self.metrics_reporting.values() {
            latest = latest.max(meta.last_modified);
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProvisioningSessionRequest {
        ProvisioningSessionRequest {
            provisioning_session_type: ProvisioningSessionType::Downlink,
            app_id: "app1".into(),
            external_application_id: None,
            asp_id: Some("asp1".into()),
        }
    }

    #[test]
    fn session_type_uses_screaming_case_on_the_wire() {
        assert_eq!(
            serde_json::to_value(ProvisioningSessionType::Downlink).unwrap(),
            "DOWNLINK"
        );
        let parsed: ProvisioningSessionType = serde_json::from_value("UPLINK".into()).unwrap();
        assert_eq!(parsed, ProvisioningSessionType::Uplink);
    }

    #[test]
    fn request_rejects_unknown_fields() {
        let err = serde_json::from_str::<ProvisioningSessionRequest>(
            r#"{"provisioningSessionType":"DOWNLINK","appId":"a","bogus":1}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn new_session_has_metadata_and_empty_projections() {
        let s = ProvisioningSession::new("ps1".into(), request());
        assert!(!s.metadata.etag.is_empty());
        assert!(s.chc.is_none());
        assert!(s.certificates.is_empty());
        assert!(!s.deleting);
    }

    #[test]
    fn touch_invalidates_sai_and_changes_generation() {
        let mut s = ProvisioningSession::new("ps1".into(), request());
        let before = s.sai_generation;
        s.touch();
        assert_eq!(s.sai_generation, before + 1);
        assert!(s.sai.is_none());
    }

    #[test]
    fn touch_changes_etag_when_content_changes() {
        let mut s = ProvisioningSession::new("ps1".into(), request());
        let etag = s.metadata.etag.clone();
        s.app_id = "app2".into();
        s.touch();
        assert_ne!(s.metadata.etag, etag);
    }

    #[test]
    fn document_lists_certificate_ids() {
        let mut s = ProvisioningSession::new("ps1".into(), request());
        s.certificates.insert(
            "cert1".into(),
            crate::certificates::CertificateRecord::reserved("ps1", "cert1"),
        );
        let doc = s.document();
        assert!(doc.server_certificate_ids.contains("cert1"));
    }
}
