//! Policy templates.
//!
//! A template is created in `PENDING` state, moves to `VALID` when the
//! operator approves it (management interface) or `INVALID` when it is
//! rejected. Only `VALID` templates are visible in the derived service
//! access information and eligible for dynamic policy instantiation.

use chrono::{DateTime, Utc};
use msaf_common::ResourceMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProvisioningError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyTemplateState {
    Pending,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PolicyTemplateState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_session_context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qo_s_specification: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_specification: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PolicyTemplate {
    /// `state` and `stateReason` are read-only on M1; a client-supplied
    /// value is discarded rather than rejected.
    pub fn strip_read_only(&mut self) {
        self.state = None;
        self.state_reason = None;
    }
}

#[derive(Debug, Clone)]
pub struct PolicyTemplateNode {
    pub template: PolicyTemplate,
    pub state: PolicyTemplateState,
    pub created: DateTime<Utc>,
    pub metadata: ResourceMetadata,
}

impl PolicyTemplateNode {
    pub fn new(mut template: PolicyTemplate, policy_template_id: String) -> Self {
        template.strip_read_only();
        template.policy_template_id = Some(policy_template_id);
        let mut node = Self {
            template,
            state: PolicyTemplateState::Pending,
            created: Utc::now(),
            metadata: ResourceMetadata {
                etag: String::new(),
                last_modified: Utc::now(),
            },
        };
        node.refresh_metadata();
        node
    }

    /// The wire representation, with the live state folded in.
    pub fn document(&self) -> PolicyTemplate {
        let mut doc = self.template.clone();
        doc.state = Some(self.state);
        doc
    }

    pub fn refresh_metadata(&mut self) {
        let body = serde_json::to_vec(&self.document()).unwrap_or_default();
        self.metadata = ResourceMetadata::for_body(&body);
    }

    /// Applies an operator state decision.
    ///
    /// `PENDING` is not an operator target; only approval (`VALID`) and
    /// rejection (`INVALID`) are accepted. Re-stating the current state
    /// is a no-op.
    pub fn set_state(
        &mut self,
        new_state: PolicyTemplateState,
        reason: Option<Value>,
    ) -> Result<bool, ProvisioningError> {
        if new_state == PolicyTemplateState::Pending {
            return Err(ProvisioningError::invalid_param(
                "state",
                "Not an operator decision",
                "a policy template can only be approved or rejected",
            ));
        }
        if new_state == self.state {
            return Ok(false);
        }
        self.state = new_state;
        self.template.state_reason = reason;
        self.refresh_metadata();
        Ok(true)
    }

    /// Replaces the template body (M1 PUT). Read-only fields supplied by
    /// the client are dropped and the review cycle restarts in `PENDING`.
    pub fn replace(&mut self, mut template: PolicyTemplate) {
        let id = self.template.policy_template_id.clone();
        template.strip_read_only();
        template.policy_template_id = id;
        self.template = template;
        self.state = PolicyTemplateState::Pending;
        self.refresh_metadata();
    }
}

/// Parses a client-supplied policy template.
pub fn parse_template(body: &[u8]) -> Result<PolicyTemplate, ProvisioningError> {
    let template: PolicyTemplate = serde_json::from_slice(body).map_err(|e| {
        ProvisioningError::validation(format!("policy template is not valid JSON: {e}"))
    })?;
    if template.external_reference.as_deref() == Some("") {
        return Err(ProvisioningError::invalid_param(
            "externalReference",
            "Must not be empty",
            "policy template external reference must not be empty",
        ));
    }
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> PolicyTemplate {
        serde_json::from_value(serde_json::json!({
            "externalReference": "gold-tier",
            "qoSSpecification": {"maxBtrDl": "20 Mbps"}
        }))
        .unwrap()
    }

    #[test]
    fn states_serialize_screaming() {
        assert_eq!(
            serde_json::to_value(PolicyTemplateState::Pending).unwrap(),
            "PENDING"
        );
    }

    #[test]
    fn new_node_starts_pending_with_minted_id() {
        let node = PolicyTemplateNode::new(template(), "pt1".into());
        assert_eq!(node.state, PolicyTemplateState::Pending);
        assert_eq!(node.template.policy_template_id.as_deref(), Some("pt1"));
        assert_eq!(node.document().state, Some(PolicyTemplateState::Pending));
    }

    #[test]
    fn client_supplied_state_is_stripped() {
        let mut t = template();
        t.state = Some(PolicyTemplateState::Valid);
        let node = PolicyTemplateNode::new(t, "pt1".into());
        assert_eq!(node.state, PolicyTemplateState::Pending);
    }

    #[test]
    fn approval_moves_to_valid_and_changes_etag() {
        let mut node = PolicyTemplateNode::new(template(), "pt1".into());
        let etag = node.metadata.etag.clone();
        let changed = node.set_state(PolicyTemplateState::Valid, None).unwrap();
        assert!(changed);
        assert_eq!(node.state, PolicyTemplateState::Valid);
        assert_ne!(node.metadata.etag, etag);
    }

    #[test]
    fn re_stating_current_state_is_a_noop() {
        let mut node = PolicyTemplateNode::new(template(), "pt1".into());
        node.set_state(PolicyTemplateState::Valid, None).unwrap();
        let changed = node.set_state(PolicyTemplateState::Valid, None).unwrap();
        assert!(!changed);
    }

    #[test]
    fn pending_is_not_an_operator_target() {
        let mut node = PolicyTemplateNode::new(template(), "pt1".into());
        assert!(node.set_state(PolicyTemplateState::Pending, None).is_err());
    }

    #[test]
    fn rejection_records_reason() {
        let mut node = PolicyTemplateNode::new(template(), "pt1".into());
        let reason = serde_json::json!({"title": "quota exceeded"});
        node.set_state(PolicyTemplateState::Invalid, Some(reason.clone()))
            .unwrap();
        assert_eq!(node.template.state_reason, Some(reason));
    }

    #[test]
    fn replace_resets_review_cycle() {
        let mut node = PolicyTemplateNode::new(template(), "pt1".into());
        node.set_state(PolicyTemplateState::Valid, None).unwrap();
        let mut update = template();
        update.state = Some(PolicyTemplateState::Valid);
        node.replace(update);
        assert_eq!(node.state, PolicyTemplateState::Pending);
        assert_eq!(node.template.policy_template_id.as_deref(), Some("pt1"));
    }

    #[test]
    fn parse_rejects_empty_external_reference() {
        let err = parse_template(br#"{"externalReference":""}"#).unwrap_err();
        assert_eq!(err.invalid_params()[0].param, "externalReference");
    }
}
