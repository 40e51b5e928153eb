//! Content hosting configurations.
//!
//! The provider-supplied document is stored verbatim. A rewritten
//! projection, in which every certificate reference is replaced by its
//! AF-unique identifier and distribution base URLs are derived from the
//! application server path template, is what actually ships to the
//! application servers.

use msaf_common::{ids, metadata::sha256_hex, ResourceMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProvisioningError;

/// Application server facts needed to derive distribution URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationServerInfo {
    pub canonical_hostname: String,
    pub url_path_prefix_format: String,
    pub m3_port: u16,
}

impl ApplicationServerInfo {
    /// Substitutes the session id into the path template. The template
    /// uses `{provisioningSessionId}` as its only macro.
    pub fn url_path_prefix(&self, provisioning_session_id: &str) -> String {
        let mut path = self
            .url_path_prefix_format
            .replace("{provisioningSessionId}", provisioning_session_id);
        if !path.ends_with('/') {
            path.push('/');
        }
        path
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    pub relative_path: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_preparation_template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_name_alias: Option<String>,
    #[serde(rename = "baseURL", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<EntryPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentHostingConfiguration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_configuration: Option<Value>,
    pub distribution_configurations: Vec<DistributionConfiguration>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Stored form: verbatim document plus the projection shipped on M3.
#[derive(Debug, Clone)]
pub struct ChcRecord {
    pub document: ContentHostingConfiguration,
    pub rewritten: ContentHostingConfiguration,
    pub metadata: ResourceMetadata,
    /// Hash of the canonical supplied document. An idempotent re-PUT is
    /// detected by comparing this, so unchanged documents enqueue no
    /// reconciliation work.
    pub canonical_hash: String,
}

impl ChcRecord {
    pub fn canonical_hash_of(document: &ContentHostingConfiguration) -> String {
        sha256_hex(&serde_json::to_vec(document).unwrap_or_default())
    }
}

/// Parses and validates a supplied content hosting configuration.
///
/// `known_certificates` is the set of certificate ids owned by the same
/// provisioning session; foreign references are rejected.
pub fn parse_and_validate(
    body: &[u8],
    known_certificates: &std::collections::BTreeSet<String>,
) -> Result<ContentHostingConfiguration, ProvisioningError> {
    let document: ContentHostingConfiguration = serde_json::from_slice(body).map_err(|e| {
        ProvisioningError::validation(format!(
            "content hosting configuration is not valid JSON: {e}"
        ))
    })?;

    if document.name.is_empty() {
        return Err(ProvisioningError::invalid_param(
            "name",
            "Must not be empty",
            "content hosting configuration requires a name",
        ));
    }
    if document.distribution_configurations.is_empty() {
        return Err(ProvisioningError::invalid_param(
            "distributionConfigurations",
            "Must not be empty",
            "content hosting configuration requires at least one distribution configuration",
        ));
    }

    for dist in &document.distribution_configurations {
        if let Some(cert_id) = &dist.certificate_id {
            if !known_certificates.contains(cert_id) {
                return Err(ProvisioningError::invalid_param(
                    "certificateId",
                    "Does not exist",
                    format!("certificate [{cert_id}] is not provisioned in this session"),
                ));
            }
        }
        if let Some(entry) = &dist.entry_point {
            validate_relative_path(&entry.relative_path)?;
        }
    }

    Ok(document)
}

/// Entry point paths are relative to the distribution base URL and must
/// stay inside it: no absolute paths, no parent traversal.
fn validate_relative_path(path: &str) -> Result<(), ProvisioningError> {
    let reject = |reason: &str| {
        Err(ProvisioningError::invalid_param(
            "entryPoint.relativePath",
            reason,
            format!("entry point path [{path}] is not a safe relative path"),
        ))
    };
    if path.is_empty() {
        return reject("Must not be empty");
    }
    if path.starts_with('/') {
        return reject("Must be relative");
    }
    if path.split('/').any(|segment| segment == "..") {
        return reject("Must not traverse upwards");
    }
    Ok(())
}

/// Fills in the distribution URLs the provider left to the AF: the
/// canonical domain name and the base URL derived from the application
/// server path template. TLS distributions (those naming a certificate)
/// get an https base, the rest plain http. Applied to the stored
/// document at creation and replacement time.
pub fn derive_distribution_urls(
    document: &mut ContentHostingConfiguration,
    provisioning_session_id: &str,
    application_server: &ApplicationServerInfo,
) {
    let prefix = application_server.url_path_prefix(provisioning_session_id);
    for dist in &mut document.distribution_configurations {
        let scheme = if dist.certificate_id.is_some() {
            "https"
        } else {
            "http"
        };
        dist.base_url.get_or_insert_with(|| {
            format!(
                "{scheme}://{}{prefix}",
                application_server.canonical_hostname
            )
        });
        dist.canonical_domain_name
            .get_or_insert_with(|| application_server.canonical_hostname.clone());
    }
}

/// The projection shipped over M3: certificate references replaced by
/// their AF-unique ids, so the application server sees a flat
/// certificate namespace.
pub fn with_af_unique_certificate_ids(
    document: &ContentHostingConfiguration,
    provisioning_session_id: &str,
) -> ContentHostingConfiguration {
    let mut rewritten = document.clone();
    for dist in &mut rewritten.distribution_configurations {
        if let Some(cert_id) = &dist.certificate_id {
            dist.certificate_id = Some(ids::af_unique_certificate_id(
                provisioning_session_id,
                cert_id,
            ));
        }
    }
    rewritten
}
