//! Policy subsystem: BSF discovery, PCF application sessions, and the
//! delivery boost lifecycle.
//!
//! For each media session that negotiated policy, one record holds the
//! located PCF, the application session context URI, and at most one
//! active delivery boost. Boosts re-point the context at a premium QoS
//! reference and revert automatically when the boost timer fires.

pub mod bsf;
pub mod error;
pub mod pcf;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use bsf::{BsfCache, BsfClient, BsfLookup};
pub use error::PolicyError;
use pcf::PcfClient;

/// Policy subsystem configuration.
#[derive(Debug, Clone)]
pub struct PcfConfig {
    pub bsf_endpoint: Option<String>,
    pub bsf_cache_ttl: Duration,
    pub bsf_negative_cache_ttl: Duration,
    /// Static PCF used when BSF discovery is unavailable or negative.
    pub static_pcf_endpoint: Option<String>,
    pub request_timeout: Duration,
    pub delivery_boost_duration: Duration,
    /// QoS reference patched into the app session while a boost runs.
    pub boost_qos_reference: String,
}

impl Default for PcfConfig {
    fn default() -> Self {
        Self {
            bsf_endpoint: None,
            bsf_cache_ttl: Duration::from_secs(300),
            bsf_negative_cache_ttl: Duration::from_secs(30),
            static_pcf_endpoint: None,
            request_timeout: Duration::from_secs(30),
            delivery_boost_duration: Duration::from_secs(20),
            boost_qos_reference: "QOS_PREMIUM".into(),
        }
    }
}

/// Wire-facing view of one policy session.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySession {
    pub id: String,
    pub provisioning_session_id: String,
    pub ue_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos_reference: Option<String>,
    pub boost_active: bool,
}

struct SessionRecord {
    view: PolicySession,
    app_session_uri: Option<String>,
    boost: Option<CancellationToken>,
}

/// Facade over the policy subsystem. Shared by the M5 network
/// assistance and dynamic policy handlers.
pub struct PolicyCore {
    config: PcfConfig,
    bsf_client: Option<BsfClient>,
    bsf_cache: tokio::sync::Mutex<BsfCache>,
    pcf_client: PcfClient,
    sessions: tokio::sync::Mutex<HashMap<String, SessionRecord>>,
}

impl PolicyCore {
    pub fn new(config: PcfConfig) -> Arc<Self> {
        let bsf_client = config
            .bsf_endpoint
            .clone()
            .map(|endpoint| BsfClient::new(endpoint, config.request_timeout));
        let bsf_cache = BsfCache::new(config.bsf_cache_ttl, config.bsf_negative_cache_ttl);
        let pcf_client = PcfClient::new(config.request_timeout);
        Arc::new(Self {
            config,
            bsf_client,
            bsf_cache: tokio::sync::Mutex::new(bsf_cache),
            pcf_client,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Finds the PCF serving a UE: cache, then BSF discovery, then the
    /// static fallback.
    pub async fn locate_pcf(&self, ue_address: &str) -> Result<Option<String>, PolicyError> {
        if let Some(client) = &self.bsf_client {
            let cached = { self.bsf_cache.lock().await.lookup(ue_address) };
            match cached {
                BsfLookup::Hit(endpoint) => return Ok(Some(endpoint)),
                BsfLookup::NegativeHit => {
                    return Ok(self.config.static_pcf_endpoint.clone());
                }
                BsfLookup::Miss => {
                    let discovered = client.discover(ue_address).await?;
                    self.bsf_cache
                        .lock()
                        .await
                        .insert(ue_address, discovered.clone());
                    if let Some(endpoint) = discovered {
                        return Ok(Some(endpoint));
                    }
                    return Ok(self.config.static_pcf_endpoint.clone());
                }
            }
        }
        Ok(self.config.static_pcf_endpoint.clone())
    }

    /// Creates a policy session. When a PCF is reachable an application
    /// session context is established with the template's QoS reference;
    /// without one the session still exists but cannot be boosted.
    pub async fn create_session(
        &self,
        provisioning_session_id: &str,
        ue_address: &str,
        policy_template_id: Option<String>,
        qos_reference: Option<String>,
    ) -> Result<PolicySession, PolicyError> {
        let pcf_endpoint = self.locate_pcf(ue_address).await?;
        let app_session_uri = match &pcf_endpoint {
            Some(endpoint) => Some(
                self.pcf_client
                    .create_app_session(endpoint, ue_address, qos_reference.as_deref())
                    .await?,
            ),
            None => None,
        };

        let id = msaf_common::ids::mint_id();
        let view = PolicySession {
            id: id.clone(),
            provisioning_session_id: provisioning_session_id.to_string(),
            ue_address: ue_address.to_string(),
            policy_template_id,
            qos_reference,
            boost_active: false,
        };
        let record = SessionRecord {
            view: view.clone(),
            app_session_uri,
            boost: None,
        };
        self.sessions.lock().await.insert(id.clone(), record);
        tracing::info!(session = %id, provisioning_session_id, "policy session created");
        Ok(view)
    }

    pub async fn session(&self, id: &str) -> Result<PolicySession, PolicyError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(id)
            .map(|record| record.view.clone())
            .ok_or_else(|| PolicyError::SessionNotFound(id.to_string()))
    }

    /// Re-points an existing session at a different QoS reference
    /// (dynamic policy update).
    pub async fn update_session_qos(
        &self,
        id: &str,
        policy_template_id: Option<String>,
        qos_reference: Option<String>,
    ) -> Result<PolicySession, PolicyError> {
        let uri = {
            let mut sessions = self.sessions.lock().await;
            let record = sessions
                .get_mut(id)
                .ok_or_else(|| PolicyError::SessionNotFound(id.to_string()))?;
            record.view.policy_template_id = policy_template_id;
            record.view.qos_reference = qos_reference.clone();
            record.app_session_uri.clone()
        };
        if let (Some(uri), Some(reference)) = (uri, qos_reference.as_deref()) {
            self.pcf_client.update_qos(&uri, reference).await?;
        }
        self.session(id).await
    }

    /// Ends a session: cancels any running boost and deletes the
    /// application session context.
    pub async fn delete_session(&self, id: &str) -> Result<(), PolicyError> {
        let record = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .remove(id)
                .ok_or_else(|| PolicyError::SessionNotFound(id.to_string()))?
        };
        if let Some(token) = &record.boost {
            token.cancel();
        }
        if let Some(uri) = &record.app_session_uri {
            if let Err(e) = self.pcf_client.delete_app_session(uri).await {
                tracing::warn!(session = %id, error = %e, "app session deletion failed");
            }
        }
        Ok(())
    }

    /// Starts a delivery boost. At most one boost per session runs at a
    /// time; a second request conflicts until the timer reverts the
    /// session to its original QoS.
    pub async fn delivery_boost(self: &Arc<Self>, id: &str) -> Result<(), PolicyError> {
        let token = CancellationToken::new();
        let uri = {
            let mut sessions = self.sessions.lock().await;
            let record = sessions
                .get_mut(id)
                .ok_or_else(|| PolicyError::SessionNotFound(id.to_string()))?;
            if record.boost.is_some() {
                return Err(PolicyError::BoostAlreadyActive);
            }
            let uri = record
                .app_session_uri
                .clone()
                .ok_or(PolicyError::NoPcfAvailable)?;
            // claim the boost slot before suspending on the PCF call so
            // a concurrent request conflicts instead of double-patching
            record.boost = Some(token.clone());
            record.view.boost_active = true;
            uri
        };

        if let Err(e) = self
            .pcf_client
            .update_qos(&uri, &self.config.boost_qos_reference)
            .await
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(record) = sessions.get_mut(id) {
                record.boost = None;
                record.view.boost_active = false;
            }
            return Err(e);
        }

        let core = Arc::clone(self);
        let session_id = id.to_string();
        let duration = self.config.delivery_boost_duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    core.revert_boost(&session_id).await;
                }
            }
        });
        tracing::info!(session = %id, "delivery boost started");
        Ok(())
    }

    async fn revert_boost(&self, id: &str) {
        let reverted = {
            let mut sessions = self.sessions.lock().await;
            let Some(record) = sessions.get_mut(id) else {
                return;
            };
            record.boost = None;
            record.view.boost_active = false;
            record
                .app_session_uri
                .clone()
                .zip(record.view.qos_reference.clone())
        };
        if let Some((uri, original)) = reverted {
            if let Err(e) = self.pcf_client.update_qos(&uri, &original).await {
                tracing::warn!(session = %id, error = %e, "boost revert failed");
            }
        }
        tracing::info!(session = %id, "delivery boost expired");
    }
}
