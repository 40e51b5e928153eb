//! Application server reconciliation.
//!
//! Each configured application server gets one state node and one
//! worker task. The node holds the server's last known inventory and
//! four work queues plus a purge queue; the worker drives exactly one
//! M3 request at a time, chosen by strict priority, so requests from a
//! given queue complete in submission order. Uploads run before deletes
//! so references into newly pushed certificates resolve before old ones
//! disappear.

pub mod client;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use msaf_provisioning::chc::ApplicationServerInfo;
use msaf_provisioning::sync::{PurgeTracker, SyncEvent, SyncReceiver};
use msaf_provisioning::ProvisioningCore;

use client::{M3Client, M3Error};

/// Tunables for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// One queued purge with its completion tracker.
#[derive(Debug, Clone)]
pub struct PurgeJob {
    pub provisioning_session_id: String,
    pub pattern: Option<String>,
    pub tracker: Arc<PurgeTracker>,
}

/// What the reconciler should do next for one application server.
#[derive(Debug, Clone, PartialEq)]
enum NextAction {
    ProbeCertificates,
    ProbeContentHosting,
    UploadCertificate { af_unique_id: String, exists: bool },
    UploadContentHosting { provisioning_session_id: String, exists: bool },
    DeleteContentHosting { provisioning_session_id: String },
    DeleteCertificate { af_unique_id: String },
    Purge(PurgeJob),
    Idle,
}

impl PartialEq for PurgeJob {
    fn eq(&self, other: &Self) -> bool {
        self.provisioning_session_id == other.provisioning_session_id
            && self.pattern == other.pattern
    }
}

/// Mutable reconciliation state for one application server.
#[derive(Debug, Default)]
struct AsState {
    current_certificates: Option<Vec<String>>,
    current_content_hosting: Option<Vec<String>>,
    upload_certificates: VecDeque<String>,
    upload_content_hosting: VecDeque<String>,
    delete_certificates: VecDeque<String>,
    delete_content_hosting: VecDeque<String>,
    purges: VecDeque<PurgeJob>,
    /// Sessions whose mirrors are being withdrawn; confirmed back to the
    /// store once no queue entry references them.
    withdrawing: HashSet<String>,
    backoff: Option<Duration>,
}

impl AsState {
    /// Strict-priority choice of the next M3 request.
    fn decide(&self) -> NextAction {
        if self.current_certificates.is_none() {
            return NextAction::ProbeCertificates;
        }
        if self.current_content_hosting.is_none() {
            return NextAction::ProbeContentHosting;
        }
        if let Some(id) = self.upload_certificates.front() {
            let exists = self
                .current_certificates
                .as_ref()
                .is_some_and(|list| list.iter().any(|c| c == id));
            return NextAction::UploadCertificate {
                af_unique_id: id.clone(),
                exists,
            };
        }
        if let Some(ps) = self.upload_content_hosting.front() {
            let exists = self
                .current_content_hosting
                .as_ref()
                .is_some_and(|list| list.iter().any(|c| c == ps));
            return NextAction::UploadContentHosting {
                provisioning_session_id: ps.clone(),
                exists,
            };
        }
        if let Some(ps) = self.delete_content_hosting.front() {
            return NextAction::DeleteContentHosting {
                provisioning_session_id: ps.clone(),
            };
        }
        if let Some(id) = self.delete_certificates.front() {
            return NextAction::DeleteCertificate {
                af_unique_id: id.clone(),
            };
        }
        if let Some(job) = self.purges.front() {
            return NextAction::Purge(job.clone());
        }
        NextAction::Idle
    }

    /// Applies a completed request: pop the driving entry and fold the
    /// result into the cached inventory. Success resets the backoff.
    fn apply_success(&mut self, action: &NextAction, list: Option<Vec<String>>, purged: u32) {
        match action {
            NextAction::ProbeCertificates => {
                self.current_certificates = Some(list.unwrap_or_default());
            }
            NextAction::ProbeContentHosting => {
                self.current_content_hosting = Some(list.unwrap_or_default());
            }
            NextAction::UploadCertificate { af_unique_id, .. } => {
                self.upload_certificates.pop_front();
                if let Some(current) = &mut self.current_certificates {
                    if !current.iter().any(|c| c == af_unique_id) {
                        current.push(af_unique_id.clone());
                    }
                }
            }
            NextAction::UploadContentHosting {
                provisioning_session_id,
                ..
            } => {
                self.upload_content_hosting.pop_front();
                if let Some(current) = &mut self.current_content_hosting {
                    if !current.iter().any(|c| c == provisioning_session_id) {
                        current.push(provisioning_session_id.clone());
                    }
                }
            }
            NextAction::DeleteContentHosting {
                provisioning_session_id,
            } => {
                self.delete_content_hosting.pop_front();
                if let Some(current) = &mut self.current_content_hosting {
                    current.retain(|c| c != provisioning_session_id);
                }
            }
            NextAction::DeleteCertificate { af_unique_id } => {
                self.delete_certificates.pop_front();
                if let Some(current) = &mut self.current_certificates {
                    current.retain(|c| c != af_unique_id);
                }
            }
            NextAction::Purge(job) => {
                self.purges.pop_front();
                job.tracker.complete(Some(purged));
            }
            NextAction::Idle => {}
        }
        self.backoff = None;
    }

    /// Drops the head entry after a non-retriable failure.
    fn drop_entry(&mut self, action: &NextAction) {
        match action {
            NextAction::UploadCertificate { .. } => {
                self.upload_certificates.pop_front();
            }
            NextAction::UploadContentHosting { .. } => {
                self.upload_content_hosting.pop_front();
            }
            NextAction::DeleteContentHosting { .. } => {
                self.delete_content_hosting.pop_front();
            }
            NextAction::DeleteCertificate { .. } => {
                self.delete_certificates.pop_front();
            }
            NextAction::Purge(job) => {
                self.purges.pop_front();
                job.tracker.complete(None);
            }
            // probes have no queue entry to drop; retry on next pass
            NextAction::ProbeCertificates | NextAction::ProbeContentHosting => {}
            NextAction::Idle => {}
        }
    }

    /// Doubles the retry delay up to the cap and returns it.
    fn bump_backoff(&mut self, opts: &ReconcilerOptions) -> Duration {
        let next = match self.backoff {
            None => opts.initial_backoff,
            Some(current) => (current * 2).min(opts.max_backoff),
        };
        self.backoff = Some(next);
        next
    }

    /// True when no queue entry references the session.
    fn holds_nothing_for(&self, ps: &str) -> bool {
        let cert_prefix = format!("{ps}:");
        !self.upload_content_hosting.iter().any(|p| p == ps)
            && !self.delete_content_hosting.iter().any(|p| p == ps)
            && !self
                .upload_certificates
                .iter()
                .any(|c| c.starts_with(&cert_prefix))
            && !self
                .delete_certificates
                .iter()
                .any(|c| c.starts_with(&cert_prefix))
            && !self
                .purges
                .iter()
                .any(|j| j.provisioning_session_id == ps)
    }

    /// Withdrawals with nothing left in the queues.
    fn completed_withdrawals(&mut self) -> Vec<String> {
        let done: Vec<String> = self
            .withdrawing
            .iter()
            .filter(|ps| self.holds_nothing_for(ps))
            .cloned()
            .collect();
        for ps in &done {
            self.withdrawing.remove(ps);
        }
        done
    }
}

// ── Nodes and registry ──────────────────────────────────────────────

/// State node plus wakeup handle for one application server.
pub struct AsNode {
    pub config: ApplicationServerInfo,
    state: tokio::sync::Mutex<AsState>,
    kick: Notify,
}

impl AsNode {
    fn new(config: ApplicationServerInfo) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: tokio::sync::Mutex::new(AsState::default()),
            kick: Notify::new(),
        })
    }
}

/// All application server nodes plus their worker tasks.
pub struct AsRegistry {
    nodes: Vec<Arc<AsNode>>,
}

impl AsRegistry {
    /// Builds a node and worker per configured server, plus the
    /// dispatcher that fans provisioning events out to them. Workers
    /// stop when the cancellation token fires.
    pub fn spawn(
        servers: &[ApplicationServerInfo],
        core: Arc<ProvisioningCore>,
        events: SyncReceiver,
        opts: ReconcilerOptions,
        cancel: CancellationToken,
    ) -> Self {
        let nodes: Vec<Arc<AsNode>> = servers
            .iter()
            .map(|config| AsNode::new(config.clone()))
            .collect();

        for node in &nodes {
            let client = M3Client::new(
                &node.config.canonical_hostname,
                node.config.m3_port,
                opts.request_timeout,
            );
            tokio::spawn(run_node(
                Arc::clone(node),
                Arc::clone(&core),
                client,
                opts.clone(),
                cancel.clone(),
            ));
        }

        tokio::spawn(dispatch(nodes.clone(), events, cancel));
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Arc<AsNode>] {
        &self.nodes
    }
}

/// Routes provisioning events to the state nodes of the named hosts.
async fn dispatch(nodes: Vec<Arc<AsNode>>, mut events: SyncReceiver, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let hosts = match &event {
            SyncEvent::UploadCertificate { hosts, .. }
            | SyncEvent::UploadContentHosting { hosts, .. }
            | SyncEvent::DeleteCertificate { hosts, .. }
            | SyncEvent::DeleteContentHosting { hosts, .. }
            | SyncEvent::PurgeContentHostingCache { hosts, .. }
            | SyncEvent::WithdrawSession { hosts, .. } => hosts.clone(),
        };
        for node in nodes
            .iter()
            .filter(|n| hosts.iter().any(|h| h == &n.config.canonical_hostname))
        {
            enqueue(node, &event).await;
            node.kick.notify_one();
        }
    }
}

async fn enqueue(node: &AsNode, event: &SyncEvent) {
    let mut state = node.state.lock().await;
    match event {
        SyncEvent::UploadCertificate { af_unique_id, .. } => {
            state.upload_certificates.push_back(af_unique_id.clone());
        }
        SyncEvent::UploadContentHosting {
            provisioning_session_id,
            ..
        } => {
            state
                .upload_content_hosting
                .push_back(provisioning_session_id.clone());
        }
        SyncEvent::DeleteCertificate { af_unique_id, .. } => {
            state.delete_certificates.push_back(af_unique_id.clone());
        }
        SyncEvent::DeleteContentHosting {
            provisioning_session_id,
            ..
        } => {
            state
                .delete_content_hosting
                .push_back(provisioning_session_id.clone());
        }
        SyncEvent::PurgeContentHostingCache {
            provisioning_session_id,
            pattern,
            tracker,
            ..
        } => {
            state.purges.push_back(PurgeJob {
                provisioning_session_id: provisioning_session_id.clone(),
                pattern: pattern.clone(),
                tracker: Arc::clone(tracker),
            });
        }
        SyncEvent::WithdrawSession {
            provisioning_session_id,
            certificate_ids,
            ..
        } => {
            // Pending uploads for a dying session are pointless; drop
            // them before queueing the removals.
            let cert_prefix = format!("{provisioning_session_id}:");
            state
                .upload_content_hosting
                .retain(|p| p != provisioning_session_id);
            state
                .upload_certificates
                .retain(|c| !c.starts_with(&cert_prefix));
            state
                .delete_content_hosting
                .push_back(provisioning_session_id.clone());
            for id in certificate_ids {
                state.delete_certificates.push_back(id.clone());
            }
            state.withdrawing.insert(provisioning_session_id.clone());
        }
    }
}

/// Worker loop for one application server: decide, perform, apply.
async fn run_node(
    node: Arc<AsNode>,
    core: Arc<ProvisioningCore>,
    client: M3Client,
    opts: ReconcilerOptions,
    cancel: CancellationToken,
) {
    let host = node.config.canonical_hostname.clone();
    loop {
        let action = { node.state.lock().await.decide() };

        if action == NextAction::Idle {
            let done = { node.state.lock().await.completed_withdrawals() };
            for ps in done {
                core.confirm_withdrawal(&ps, &host).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = node.kick.notified() => continue,
            }
        }

        let outcome = perform(&client, &core, &action).await;
        let retry_after = {
            let mut state = node.state.lock().await;
            match outcome {
                Outcome::Success { list, purged } => {
                    state.apply_success(&action, list, purged);
                    None
                }
                Outcome::Skip => {
                    // payload no longer exists; the entry is stale
                    tracing::debug!(host = %host, ?action, "skipping stale reconciliation entry");
                    state.drop_entry(&action);
                    None
                }
                Outcome::Failed(e) => {
                    // probes have no queue entry to drop, so every probe
                    // failure backs off and retries
                    let probe = matches!(
                        action,
                        NextAction::ProbeCertificates | NextAction::ProbeContentHosting
                    );
                    if e.retriable() || probe {
                        let delay = state.bump_backoff(&opts);
                        tracing::warn!(host = %host, error = %e, ?delay, "M3 request failed; backing off");
                        Some(delay)
                    } else {
                        tracing::warn!(host = %host, error = %e, ?action, "M3 request rejected; dropping entry");
                        state.drop_entry(&action);
                        None
                    }
                }
            }
        };

        let done = { node.state.lock().await.completed_withdrawals() };
        for ps in done {
            core.confirm_withdrawal(&ps, &host).await;
        }

        if let Some(delay) = retry_after {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            break;
        }
    }
}

enum Outcome {
    Success {
        list: Option<Vec<String>>,
        purged: u32,
    },
    /// The entry's payload is gone from the store; drop it.
    Skip,
    Failed(M3Error),
}

async fn perform(client: &M3Client, core: &ProvisioningCore, action: &NextAction) -> Outcome {
    let ok = |_: ()| Outcome::Success {
        list: None,
        purged: 0,
    };
    match action {
        NextAction::ProbeCertificates => match client.list_certificates().await {
            Ok(list) => Outcome::Success {
                list: Some(list),
                purged: 0,
            },
            Err(e) => Outcome::Failed(e),
        },
        NextAction::ProbeContentHosting => {
            match client.list_content_hosting_configurations().await {
                Ok(list) => Outcome::Success {
                    list: Some(list),
                    purged: 0,
                },
                Err(e) => Outcome::Failed(e),
            }
        }
        NextAction::UploadCertificate {
            af_unique_id,
            exists,
        } => {
            let Some(pem) = core.certificate_pem_by_af_id(af_unique_id).await else {
                return Outcome::Skip;
            };
            match client.upsert_certificate(af_unique_id, pem, *exists).await {
                Ok(()) => ok(()),
                Err(e) => Outcome::Failed(e),
            }
        }
        NextAction::UploadContentHosting {
            provisioning_session_id,
            exists,
        } => {
            let Some(document) = core.rewritten_chc(provisioning_session_id).await else {
                return Outcome::Skip;
            };
            match client
                .upsert_content_hosting_configuration(provisioning_session_id, &document, *exists)
                .await
            {
                Ok(()) => ok(()),
                Err(e) => Outcome::Failed(e),
            }
        }
        NextAction::DeleteContentHosting {
            provisioning_session_id,
        } => match client
            .delete_content_hosting_configuration(provisioning_session_id)
            .await
        {
            Ok(()) => ok(()),
            Err(e) => Outcome::Failed(e),
        },
        NextAction::DeleteCertificate { af_unique_id } => {
            match client.delete_certificate(af_unique_id).await {
                Ok(()) => ok(()),
                Err(e) => Outcome::Failed(e),
            }
        }
        NextAction::Purge(job) => match client
            .purge_content_hosting_cache(&job.provisioning_session_id, job.pattern.as_deref())
            .await
        {
            Ok(purged) => Outcome::Success { list: None, purged },
            Err(e) => Outcome::Failed(e),
        },
        NextAction::Idle => ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probed() -> AsState {
        let mut state = AsState::default();
        state.current_certificates = Some(Vec::new());
        state.current_content_hosting = Some(Vec::new());
        state
    }

    #[test]
    fn probes_run_before_anything_else() {
        let mut state = AsState::default();
        state.upload_certificates.push_back("ps:c1".into());
        assert_eq!(state.decide(), NextAction::ProbeCertificates);

        state.current_certificates = Some(Vec::new());
        assert_eq!(state.decide(), NextAction::ProbeContentHosting);
    }

    #[test]
    fn uploads_run_before_deletes_and_purges() {
        let mut state = probed();
        state.purges.push_back(PurgeJob {
            provisioning_session_id: "ps".into(),
            pattern: None,
            tracker: PurgeTracker::new(1),
        });
        state.delete_certificates.push_back("ps:c0".into());
        state.delete_content_hosting.push_back("ps".into());
        state.upload_content_hosting.push_back("ps".into());
        state.upload_certificates.push_back("ps:c1".into());

        assert!(matches!(
            state.decide(),
            NextAction::UploadCertificate { .. }
        ));
        state.apply_success(
            &NextAction::UploadCertificate {
                af_unique_id: "ps:c1".into(),
                exists: false,
            },
            None,
            0,
        );
        assert!(matches!(
            state.decide(),
            NextAction::UploadContentHosting { .. }
        ));
        state.apply_success(
            &NextAction::UploadContentHosting {
                provisioning_session_id: "ps".into(),
                exists: false,
            },
            None,
            0,
        );
        assert!(matches!(
            state.decide(),
            NextAction::DeleteContentHosting { .. }
        ));
        state.apply_success(
            &NextAction::DeleteContentHosting {
                provisioning_session_id: "ps".into(),
            },
            None,
            0,
        );
        assert!(matches!(state.decide(), NextAction::DeleteCertificate { .. }));
        state.apply_success(
            &NextAction::DeleteCertificate {
                af_unique_id: "ps:c0".into(),
            },
            None,
            0,
        );
        assert!(matches!(state.decide(), NextAction::Purge(_)));
    }

    #[test]
    fn known_ids_upload_with_put() {
        let mut state = probed();
        state.current_certificates = Some(vec!["ps:c1".into()]);
        state.upload_certificates.push_back("ps:c1".into());
        assert_eq!(
            state.decide(),
            NextAction::UploadCertificate {
                af_unique_id: "ps:c1".into(),
                exists: true,
            }
        );
    }

    #[test]
    fn successful_upload_updates_cached_inventory() {
        let mut state = probed();
        state.upload_certificates.push_back("ps:c1".into());
        let action = state.decide();
        state.apply_success(&action, None, 0);
        assert!(state
            .current_certificates
            .as_ref()
            .unwrap()
            .contains(&"ps:c1".to_string()));
        assert!(state.upload_certificates.is_empty());
    }

    #[test]
    fn successful_delete_removes_from_inventory() {
        let mut state = probed();
        state.current_certificates = Some(vec!["ps:c1".into()]);
        state.delete_certificates.push_back("ps:c1".into());
        let action = state.decide();
        state.apply_success(&action, None, 0);
        assert!(state.current_certificates.as_ref().unwrap().is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let opts = ReconcilerOptions::default();
        let mut state = probed();
        assert_eq!(state.bump_backoff(&opts), Duration::from_secs(1));
        assert_eq!(state.bump_backoff(&opts), Duration::from_secs(2));
        assert_eq!(state.bump_backoff(&opts), Duration::from_secs(4));
        for _ in 0..10 {
            state.bump_backoff(&opts);
        }
        assert_eq!(state.bump_backoff(&opts), Duration::from_secs(60));
    }

    #[test]
    fn success_resets_backoff() {
        let opts = ReconcilerOptions::default();
        let mut state = probed();
        state.upload_certificates.push_back("ps:c1".into());
        state.bump_backoff(&opts);
        let action = state.decide();
        state.apply_success(&action, None, 0);
        assert!(state.backoff.is_none());
        assert_eq!(state.bump_backoff(&opts), Duration::from_secs(1));
    }

    #[test]
    fn dropped_purge_reports_failure() {
        let mut state = probed();
        let tracker = PurgeTracker::new(1);
        state.purges.push_back(PurgeJob {
            provisioning_session_id: "ps".into(),
            pattern: None,
            tracker: Arc::clone(&tracker),
        });
        let action = state.decide();
        state.drop_entry(&action);
        let outcome = futures_block_on(tracker.wait());
        assert_eq!(outcome.failures, 1);
    }

    #[test]
    fn withdrawal_completes_once_queues_are_empty() {
        let mut state = probed();
        state.withdrawing.insert("ps".into());
        state.delete_content_hosting.push_back("ps".into());
        state.delete_certificates.push_back("ps:c1".into());
        assert!(state.completed_withdrawals().is_empty());

        let action = state.decide();
        state.apply_success(&action, None, 0);
        assert!(state.completed_withdrawals().is_empty());

        let action = state.decide();
        state.apply_success(&action, None, 0);
        assert_eq!(state.completed_withdrawals(), vec!["ps".to_string()]);
        assert!(state.withdrawing.is_empty());
    }

    #[test]
    fn withdrawal_ignores_other_sessions_entries() {
        let mut state = probed();
        state.withdrawing.insert("ps".into());
        state.upload_content_hosting.push_back("other".into());
        state.upload_certificates.push_back("other:c1".into());
        assert_eq!(state.completed_withdrawals(), vec!["ps".to_string()]);
    }

    /// Minimal block_on for tracker assertions inside sync tests.
    fn futures_block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }
}
