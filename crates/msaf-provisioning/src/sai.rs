//! Service access information.
//!
//! The document a media client fetches on M5 to learn how to consume a
//! session. It is derived entirely from the provisioning session: entry
//! points from the content hosting configuration, reporting blocks from
//! the reporting configurations, policy ids from the templates in
//! `VALID` state. The assembled document is memoised per session and
//! invalidated whenever any contributing entity mutates.

use msaf_common::ResourceMetadata;
use serde_json::{json, Value};

use crate::policy::PolicyTemplateState;
use crate::session::ProvisioningSession;

/// Deployment facts folded into every service access information
/// document.
#[derive(Debug, Clone)]
pub struct SaiContext {
    /// Public base URLs of the M5 endpoints, e.g. `https://af:7778`.
    pub m5_server_addresses: Vec<String>,
    /// Whether the network assistance feature is configured.
    pub network_assistance: bool,
}

/// Memoised service access information for one session.
#[derive(Debug, Clone)]
pub struct SaiSnapshot {
    pub document: Value,
    pub metadata: ResourceMetadata,
    pub generation: u64,
}

/// Assembles the service access information for a session.
pub fn build(session: &ProvisioningSession, ctx: &SaiContext) -> SaiSnapshot {
    let mut document = json!({
        "provisioningSessionId": session.id,
        "provisioningSessionType": session.session_type,
    });
    let map = document.as_object_mut().expect("object literal");

    if let Some(chc) = &session.chc {
        if let Some(entry) = media_player_entry(&chc.document) {
            map.insert(
                "streamingAccess".into(),
                json!({ "mediaPlayerEntry": entry }),
            );
        }
    }

    if let Some((config, _)) = &session.consumption_reporting {
        let mut block = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
        block.as_object_mut().expect("object").insert(
            "serverAddresses".into(),
            json!(ctx.m5_server_addresses),
        );
        map.insert("clientConsumptionReportingConfiguration".into(), block);
    }

    let metrics: Vec<Value> = session
        .metrics_reporting
        .values()
        .map(|(config, _)| {
            let mut block = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
            block.as_object_mut().expect("object").insert(
                "serverAddresses".into(),
                json!(ctx.m5_server_addresses),
            );
            block
        })
        .collect();
    if !metrics.is_empty() {
        map.insert("clientMetricsReportingConfigurations".into(), json!(metrics));
    }

    let valid_templates: Vec<&String> = session
        .policy_templates
        .iter()
        .filter(|(_, node)| node.state == PolicyTemplateState::Valid)
        .map(|(id, _)| id)
        .collect();
    if !valid_templates.is_empty() {
        map.insert(
            "dynamicPolicyInvocationConfiguration".into(),
            json!({
                "dynamicPolicyServerAddresses": ctx.m5_server_addresses,
                "validPolicyTemplateIds": valid_templates,
            }),
        );
    }

    if ctx.network_assistance {
        map.insert(
            "networkAssistanceConfiguration".into(),
            json!({ "networkAssistanceServerAddresses": ctx.m5_server_addresses }),
        );
    }

    let body = serde_json::to_vec(&document).unwrap_or_default();
    SaiSnapshot {
        metadata: ResourceMetadata::with_time(&body, session.latest_modification()),
        document,
        generation: session.sai_generation,
    }
}

/// First resolvable media player entry: distribution base URL joined
/// with the entry point's relative path.
fn media_player_entry(chc: &crate::chc::ContentHostingConfiguration) -> Option<String> {
    chc.distribution_configurations.iter().find_map(|dist| {
        let base = dist.base_url.as_deref()?;
        let entry = dist.entry_point.as_ref()?;
        Some(format!(
            "{}{}",
            base,
            entry.relative_path.trim_start_matches('/')
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chc::{parse_and_validate, ChcRecord};
    use crate::policy::{parse_template, PolicyTemplateNode};
    use crate::session::{ProvisioningSession, ProvisioningSessionRequest, ProvisioningSessionType};
    use std::collections::BTreeSet;

    fn ctx() -> SaiContext {
        SaiContext {
            m5_server_addresses: vec!["https://af.example.com:7778".into()],
            network_assistance: true,
        }
    }

    fn session_with_chc() -> ProvisioningSession {
        let mut session = ProvisioningSession::new(
            "ps1".into(),
            ProvisioningSessionRequest {
                provisioning_session_type: ProvisioningSessionType::Downlink,
                app_id: "app1".into(),
                external_application_id: None,
                asp_id: None,
            },
        );
        let body = br#"{
            "name":"demo",
            "distributionConfigurations":[{
                "baseURL":"https://as.example.com/m4d/provisioning-session-ps1/",
                "entryPoint":{"relativePath":"media/manifest.mpd","contentType":"application/dash+xml"}
            }]
        }"#;
        let document = parse_and_validate(body, &BTreeSet::new()).unwrap();
        let rewritten = document.clone();
        let canonical_hash = ChcRecord::canonical_hash_of(&document);
        session.chc = Some(ChcRecord {
            document,
            rewritten,
            metadata: msaf_common::ResourceMetadata::for_body(body),
            canonical_hash,
        });
        session
    }

    #[test]
    fn media_player_entry_joins_base_and_relative_path() {
        let session = session_with_chc();
        let snapshot = build(&session, &ctx());
        assert_eq!(
            snapshot.document["streamingAccess"]["mediaPlayerEntry"],
            "https://as.example.com/m4d/provisioning-session-ps1/media/manifest.mpd"
        );
    }

    #[test]
    fn network_assistance_block_tracks_context_flag() {
        let session = session_with_chc();
        let with = build(&session, &ctx());
        assert!(with.document.get("networkAssistanceConfiguration").is_some());

        let without = build(
            &session,
            &SaiContext {
                m5_server_addresses: vec![],
                network_assistance: false,
            },
        );
        assert!(without
            .document
            .get("networkAssistanceConfiguration")
            .is_none());
    }

    #[test]
    fn only_valid_policy_templates_are_listed() {
        let mut session = session_with_chc();
        let pending = PolicyTemplateNode::new(
            parse_template(br#"{"externalReference":"a"}"#).unwrap(),
            "pt-pending".into(),
        );
        let mut valid = PolicyTemplateNode::new(
            parse_template(br#"{"externalReference":"b"}"#).unwrap(),
            "pt-valid".into(),
        );
        valid
            .set_state(PolicyTemplateState::Valid, None)
            .unwrap();
        session.policy_templates.insert("pt-pending".into(), pending);
        session.policy_templates.insert("pt-valid".into(), valid);

        let snapshot = build(&session, &ctx());
        let ids = &snapshot.document["dynamicPolicyInvocationConfiguration"]
            ["validPolicyTemplateIds"];
        assert_eq!(ids.as_array().unwrap().len(), 1);
        assert_eq!(ids[0], "pt-valid");
    }

    #[test]
    fn consumption_block_carries_server_addresses() {
        let mut session = session_with_chc();
        session.consumption_reporting = Some((
            crate::reporting::parse_consumption_configuration(
                br#"{"reportingInterval":30}"#,
            )
            .unwrap(),
            msaf_common::ResourceMetadata::for_body(b"x"),
        ));
        let snapshot = build(&session, &ctx());
        assert_eq!(
            snapshot.document["clientConsumptionReportingConfiguration"]["serverAddresses"][0],
            "https://af.example.com:7778"
        );
    }

    #[test]
    fn etag_changes_when_contributing_entity_changes() {
        let mut session = session_with_chc();
        let first = build(&session, &ctx());
        session.consumption_reporting = Some((
            crate::reporting::parse_consumption_configuration(br#"{"reportingInterval":5}"#)
                .unwrap(),
            msaf_common::ResourceMetadata::for_body(b"x"),
        ));
        session.touch();
        let second = build(&session, &ctx());
        assert_ne!(first.metadata.etag, second.metadata.etag);
        assert_ne!(first.generation, second.generation);
    }

    #[test]
    fn identical_inputs_produce_identical_etag() {
        let session = session_with_chc();
        let a = build(&session, &ctx());
        let b = build(&session, &ctx());
        assert_eq!(a.metadata.etag, b.metadata.etag);
    }
}
