//! Service access API (M5).
//!
//! The media client's side of the AF: service access information
//! retrieval, consumption and metrics report intake, dynamic policy
//! instantiation, and network assistance. Reads go against the
//! provisioning store; policy operations go through the policy
//! subsystem.

pub mod http;
pub mod reports;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use msaf_pcf::PolicyCore;
use msaf_provisioning::ProvisioningCore;

/// M5 deployment facts.
#[derive(Debug, Clone)]
pub struct M5Config {
    pub data_collection_dir: PathBuf,
    /// `Cache-Control: max-age` for service access information.
    pub sai_cache_max_age: u32,
}

/// Shared state behind the M5 routes.
pub struct M5Core {
    pub provisioning: Arc<ProvisioningCore>,
    pub policy: Arc<PolicyCore>,
    pub config: M5Config,
    /// Client-supplied service data flow descriptions, kept per dynamic
    /// policy so reads echo what was provisioned.
    flow_descriptions: tokio::sync::Mutex<HashMap<String, Value>>,
}

impl M5Core {
    pub fn new(
        provisioning: Arc<ProvisioningCore>,
        policy: Arc<PolicyCore>,
        config: M5Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            provisioning,
            policy,
            config,
            flow_descriptions: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub(crate) async fn remember_flows(&self, id: &str, flows: Option<Value>) {
        let mut map = self.flow_descriptions.lock().await;
        match flows {
            Some(flows) => {
                map.insert(id.to_string(), flows);
            }
            None => {
                map.remove(id);
            }
        }
    }

    pub(crate) async fn flows(&self, id: &str) -> Option<Value> {
        self.flow_descriptions.lock().await.get(id).cloned()
    }

    pub(crate) async fn forget_flows(&self, id: &str) {
        self.flow_descriptions.lock().await.remove(id);
    }
}
