//! Binding Support Function discovery.
//!
//! Maps a UE address to the PCF serving it. Lookups are cached: hits
//! for the configured TTL, misses for a shorter negative TTL so an
//! absent binding does not turn every request into a BSF round trip.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::error::PolicyError;

/// One cached binding: the PCF endpoint, or `None` for a cached miss.
#[derive(Debug, Clone)]
struct BsfEntry {
    pcf_endpoint: Option<String>,
    expires: Instant,
}

/// UE address → PCF endpoint cache.
#[derive(Debug)]
pub struct BsfCache {
    entries: HashMap<String, BsfEntry>,
    ttl: Duration,
    negative_ttl: Duration,
}

/// Cache lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BsfLookup {
    /// No usable entry; ask the BSF.
    Miss,
    /// Cached binding.
    Hit(String),
    /// Cached "no PCF serves this UE".
    NegativeHit,
}

impl BsfCache {
    pub fn new(ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            negative_ttl,
        }
    }

    pub fn lookup(&mut self, ue_address: &str) -> BsfLookup {
        match self.entries.get(ue_address) {
            Some(entry) if entry.expires > Instant::now() => match &entry.pcf_endpoint {
                Some(endpoint) => BsfLookup::Hit(endpoint.clone()),
                None => BsfLookup::NegativeHit,
            },
            Some(_) => {
                self.entries.remove(ue_address);
                BsfLookup::Miss
            }
            None => BsfLookup::Miss,
        }
    }

    pub fn insert(&mut self, ue_address: &str, pcf_endpoint: Option<String>) {
        let ttl = if pcf_endpoint.is_some() {
            self.ttl
        } else {
            self.negative_ttl
        };
        self.entries.insert(
            ue_address.to_string(),
            BsfEntry {
                pcf_endpoint,
                expires: Instant::now() + ttl,
            },
        );
    }
}

// ── Nbsf_Management client ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PcfBinding {
    pcf_fqdn: Option<String>,
    #[serde(default)]
    pcf_ip_end_points: Vec<IpEndPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpEndPoint {
    ipv4_address: Option<String>,
    ipv6_address: Option<String>,
    port: Option<u16>,
}

/// Client for `Nbsf_Management` PCF binding discovery.
#[derive(Debug, Clone)]
pub struct BsfClient {
    http: reqwest::Client,
    endpoint: String,
}

impl BsfClient {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http, endpoint }
    }

    /// Asks the BSF which PCF serves the UE address. `Ok(None)` is a
    /// definitive "no binding" answer, cached negatively by the caller.
    pub async fn discover(&self, ue_address: &str) -> Result<Option<String>, PolicyError> {
        let param = if ue_address.contains(':') {
            "ipv6Prefix"
        } else {
            "ipv4Addr"
        };
        let url = format!(
            "{}/nbsf-management/v1/pcfBindings?{param}={ue_address}",
            self.endpoint.trim_end_matches('/')
        );
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(PolicyError::from_transport)?;
        match response.status() {
            status if status.is_success() => {
                let binding: PcfBinding = response
                    .json()
                    .await
                    .map_err(|e| PolicyError::Upstream(format!("bad BSF response: {e}")))?;
                Ok(binding_endpoint(&binding))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(PolicyError::Upstream(format!(
                "BSF returned status {status}"
            ))),
        }
    }
}

fn binding_endpoint(binding: &PcfBinding) -> Option<String> {
    if let Some(fqdn) = &binding.pcf_fqdn {
        return Some(format!("http://{fqdn}"));
    }
    binding.pcf_ip_end_points.iter().find_map(|ep| {
        let host = ep
            .ipv4_address
            .clone()
            .or_else(|| ep.ipv6_address.as_ref().map(|v6| format!("[{v6}]")))?;
        let port = ep.port.unwrap_or(80);
        Some(format!("http://{host}:{port}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn positive_entries_expire_after_ttl() {
        let mut cache = BsfCache::new(Duration::from_secs(300), Duration::from_secs(30));
        cache.insert("10.0.0.1", Some("http://pcf".into()));
        assert_eq!(cache.lookup("10.0.0.1"), BsfLookup::Hit("http://pcf".into()));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.lookup("10.0.0.1"), BsfLookup::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_entries_expire_sooner() {
        let mut cache = BsfCache::new(Duration::from_secs(300), Duration::from_secs(30));
        cache.insert("10.0.0.2", None);
        assert_eq!(cache.lookup("10.0.0.2"), BsfLookup::NegativeHit);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.lookup("10.0.0.2"), BsfLookup::Miss);
    }

    #[tokio::test]
    async fn unknown_address_is_a_miss() {
        let mut cache = BsfCache::new(Duration::from_secs(300), Duration::from_secs(30));
        assert_eq!(cache.lookup("10.9.9.9"), BsfLookup::Miss);
    }

    #[test]
    fn binding_prefers_fqdn() {
        let binding = PcfBinding {
            pcf_fqdn: Some("pcf.example.com:8091".into()),
            pcf_ip_end_points: vec![IpEndPoint {
                ipv4_address: Some("192.0.2.1".into()),
                ipv6_address: None,
                port: Some(80),
            }],
        };
        assert_eq!(
            binding_endpoint(&binding),
            Some("http://pcf.example.com:8091".into())
        );
    }

    #[test]
    fn binding_falls_back_to_ip_endpoint() {
        let binding = PcfBinding {
            pcf_fqdn: None,
            pcf_ip_end_points: vec![IpEndPoint {
                ipv4_address: Some("192.0.2.1".into()),
                ipv6_address: None,
                port: Some(8091),
            }],
        };
        assert_eq!(
            binding_endpoint(&binding),
            Some("http://192.0.2.1:8091".into())
        );
    }

    #[test]
    fn binding_without_addresses_is_none() {
        let binding = PcfBinding {
            pcf_fqdn: None,
            pcf_ip_end_points: vec![],
        };
        assert_eq!(binding_endpoint(&binding), None);
    }
}
