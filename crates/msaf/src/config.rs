//! CLI and configuration.
//!
//! One YAML document describes the whole AF: its identity, the
//! endpoints it binds (each picking an HTTP backend), the application
//! servers it drives over M3, the certificate manager helper, and the
//! 5G core endpoints it consumes. Unknown keys are rejected so typos
//! fail at startup instead of silently.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use msaf_common::server::HttpBackend;
use msaf_provisioning::chc::ApplicationServerInfo;

#[derive(Parser, Debug)]
#[command(name = "msaf", version, about = "5G Media Streaming Application Function")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "MSAF_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which API family an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Provisioning plus the management interface.
    M1,
    /// Service access.
    M5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HttpChoice {
    #[serde(rename = "h1")]
    H1,
    #[serde(rename = "h2")]
    H2,
}

impl From<HttpChoice> for HttpBackend {
    fn from(choice: HttpChoice) -> Self {
        match choice {
            HttpChoice::H1 => HttpBackend::Http1,
            HttpChoice::H2 => HttpBackend::Http2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Endpoint {
    pub name: EndpointRole,
    #[serde(default = "default_address")]
    pub address: String,
    pub port: u16,
    #[serde(default = "default_http")]
    pub http: HttpChoice,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkAssistanceConfig {
    #[serde(default = "default_boost_seconds")]
    pub delivery_boost_seconds: u64,
    #[serde(default = "default_boost_reference")]
    pub boost_qos_reference: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BsfConfig {
    pub endpoint: String,
    #[serde(default = "default_bsf_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_bsf_negative_ttl")]
    pub negative_cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PcfEndpointConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NrfConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AfConfig {
    pub server_name: String,
    #[serde(default = "default_api_release")]
    pub api_release: String,
    pub listen: Vec<Endpoint>,
    #[serde(default)]
    pub application_servers: Vec<ApplicationServerInfo>,
    pub certificate_manager: PathBuf,
    #[serde(default = "default_certificate_dir")]
    pub certificate_dir: PathBuf,
    pub data_collection_dir: PathBuf,
    #[serde(default = "default_sai_max_age")]
    pub sai_cache_control_max_age: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub network_assistance: Option<NetworkAssistanceConfig>,
    #[serde(default)]
    pub bsf: Option<BsfConfig>,
    #[serde(default)]
    pub pcf: Option<PcfEndpointConfig>,
    /// Accepted for deployments that route discovery through an NRF;
    /// this build talks to the configured BSF and PCF directly.
    #[serde(default)]
    pub nrf: Option<NrfConfig>,
}

fn default_address() -> String {
    "0.0.0.0".into()
}
fn default_http() -> HttpChoice {
    HttpChoice::H1
}
fn default_api_release() -> String {
    "2".into()
}
fn default_certificate_dir() -> PathBuf {
    PathBuf::from("/var/cache/msaf/certs")
}
fn default_sai_max_age() -> u32 {
    60
}
fn default_request_timeout() -> u64 {
    30
}
fn default_boost_seconds() -> u64 {
    20
}
fn default_boost_reference() -> String {
    "QOS_PREMIUM".into()
}
fn default_bsf_ttl() -> u64 {
    300
}
fn default_bsf_negative_ttl() -> u64 {
    30
}

impl AfConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AfConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one listen endpoint is required".into(),
            ));
        }
        for endpoint in &self.listen {
            if endpoint.port == 0 {
                return Err(ConfigError::Invalid("listen port must not be zero".into()));
            }
            if endpoint.tls
                && (endpoint.certificate_path.is_none() || endpoint.private_key_path.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TLS endpoint on port {} needs certificatePath and privateKeyPath",
                    endpoint.port
                )));
            }
        }
        for application_server in &self.application_servers {
            if application_server.canonical_hostname.is_empty() {
                return Err(ConfigError::Invalid(
                    "application server canonicalHostname must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Public base URLs of the M5 endpoints, advertised inside service
    /// access information.
    pub fn m5_server_addresses(&self) -> Vec<String> {
        self.listen
            .iter()
            .filter(|e| e.name == EndpointRole::M5)
            .map(|e| {
                let scheme = if e.tls { "https" } else { "http" };
                format!("{scheme}://{}:{}", self.server_name, e.port)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
serverName: af.example.com
apiRelease: "2"
listen:
  - name: m1
    address: 0.0.0.0
    port: 7777
    http: h2
  - name: m5
    port: 7778
    http: h1
applicationServers:
  - canonicalHostname: as.example.com
    urlPathPrefixFormat: "/m4d/provisioning-session-{provisioningSessionId}/"
    m3Port: 7777
certificateManager: /usr/lib/msaf/certmgr
certificateDir: /tmp/msaf-certs
dataCollectionDir: /tmp/msaf-reports
saiCacheControlMaxAge: 120
requestTimeoutSeconds: 10
networkAssistance:
  deliveryBoostSeconds: 20
bsf:
  endpoint: http://bsf.example.com:8090
  cacheTtlSeconds: 600
pcf:
  endpoint: http://pcf.example.com:8091
nrf:
  endpoint: http://nrf.example.com:8092
"#;

    #[test]
    fn full_document_parses() {
        let config: AfConfig = serde_yaml::from_str(FULL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server_name, "af.example.com");
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].http, HttpChoice::H2);
        assert_eq!(config.listen[1].http, HttpChoice::H1);
        assert_eq!(config.application_servers[0].m3_port, 7777);
        assert_eq!(config.sai_cache_control_max_age, 120);
        assert_eq!(config.bsf.as_ref().unwrap().cache_ttl_seconds, 600);
        assert_eq!(
            config.bsf.as_ref().unwrap().negative_cache_ttl_seconds,
            30
        );
        assert!(config.nrf.is_some());
    }

    #[test]
    fn minimal_document_gets_defaults() {
        let config: AfConfig = serde_yaml::from_str(
            r#"
serverName: af
listen:
  - name: m1
    port: 7777
certificateManager: /bin/certmgr
dataCollectionDir: /tmp/reports
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.api_release, "2");
        assert_eq!(config.listen[0].http, HttpChoice::H1);
        assert_eq!(config.request_timeout_seconds, 30);
        assert!(config.network_assistance.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<AfConfig>(
            r#"
serverName: af
listen: []
certificateManager: /bin/certmgr
dataCollectionDir: /tmp
surpriseOption: true
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn empty_listen_list_is_invalid() {
        let config: AfConfig = serde_yaml::from_str(
            r#"
serverName: af
listen: []
certificateManager: /bin/certmgr
dataCollectionDir: /tmp
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn tls_endpoint_requires_key_material() {
        let config: AfConfig = serde_yaml::from_str(
            r#"
serverName: af
listen:
  - name: m1
    port: 443
    tls: true
certificateManager: /bin/certmgr
dataCollectionDir: /tmp
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn m5_addresses_use_server_name_and_scheme() {
        let config: AfConfig = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(
            config.m5_server_addresses(),
            vec!["http://af.example.com:7778".to_string()]
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = AfConfig::load(Path::new("/nonexistent/msaf.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
