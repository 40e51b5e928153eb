//! Per-interface API descriptors.
//!
//! Every response carries a `Server` header naming the AF, the API
//! release, and the OpenAPI info block of the resource family that
//! handled the request.

/// Info block for one resource family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiInfo {
    pub title: &'static str,
    pub version: &'static str,
}

pub static M1_PROVISIONING_SESSIONS: ApiInfo = ApiInfo {
    title: "M1_ProvisioningSessions",
    version: "2.1.0",
};
pub static M1_CONTENT_HOSTING: ApiInfo = ApiInfo {
    title: "M1_ContentHostingProvisioning",
    version: "2.1.0",
};
pub static M1_SERVER_CERTIFICATES: ApiInfo = ApiInfo {
    title: "M1_ServerCertificatesProvisioning",
    version: "2.1.0",
};
pub static M1_POLICY_TEMPLATES: ApiInfo = ApiInfo {
    title: "M1_PolicyTemplatesProvisioning",
    version: "2.1.0",
};
pub static M1_CONSUMPTION_REPORTING: ApiInfo = ApiInfo {
    title: "M1_ConsumptionReportingProvisioning",
    version: "2.1.0",
};
pub static M1_METRICS_REPORTING: ApiInfo = ApiInfo {
    title: "M1_MetricsReportingProvisioning",
    version: "2.1.0",
};
pub static M1_CONTENT_PROTOCOLS: ApiInfo = ApiInfo {
    title: "M1_ContentProtocolsDiscovery",
    version: "2.1.0",
};
pub static M5_SERVICE_ACCESS_INFORMATION: ApiInfo = ApiInfo {
    title: "M5_ServiceAccessInformation",
    version: "2.1.0",
};
pub static M5_CONSUMPTION_REPORTING: ApiInfo = ApiInfo {
    title: "M5_ConsumptionReporting",
    version: "2.1.0",
};
pub static M5_METRICS_REPORTING: ApiInfo = ApiInfo {
    title: "M5_MetricsReporting",
    version: "2.1.0",
};
pub static M5_DYNAMIC_POLICIES: ApiInfo = ApiInfo {
    title: "M5_DynamicPolicies",
    version: "2.1.0",
};
pub static M5_NETWORK_ASSISTANCE: ApiInfo = ApiInfo {
    title: "M5_NetworkAssistance",
    version: "2.1.0",
};
pub static MANAGEMENT: ApiInfo = ApiInfo {
    title: "MAF_Management",
    version: "1.0.0",
};

/// Identity of this AF instance, shared by every listener.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub server_name: String,
    pub api_release: String,
}

impl ServerIdentity {
    /// `Server` header value for a given resource family.
    pub fn banner(&self, api: &ApiInfo) -> String {
        format!(
            "5GMSdAF-{}/{} (info.title={}; info.version={}) msaf/{}",
            self.server_name,
            self.api_release,
            api.title,
            api.version,
            env!("CARGO_PKG_VERSION"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_names_host_release_and_api() {
        let identity = ServerIdentity {
            server_name: "af.example.com".into(),
            api_release: "2".into(),
        };
        let banner = identity.banner(&M1_PROVISIONING_SESSIONS);
        assert!(banner.starts_with("5GMSdAF-af.example.com/2 "));
        assert!(banner.contains("info.title=M1_ProvisioningSessions"));
        assert!(banner.contains("info.version=2.1.0"));
    }
}
