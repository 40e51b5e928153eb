//! Reconciliation events.
//!
//! Provisioning mutations never talk to application servers directly:
//! they emit events on an unbounded channel, and the reconciliation
//! engine routes each event to the state nodes of the named hosts. All
//! references are by id so the store and the engine share no pointers.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;

/// One unit of work for the application-server reconciliation engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Push one certificate (by AF-unique id) to the named hosts.
    UploadCertificate {
        hosts: Vec<String>,
        af_unique_id: String,
    },
    /// Push the content hosting configuration of a session.
    UploadContentHosting {
        hosts: Vec<String>,
        provisioning_session_id: String,
    },
    /// Withdraw one certificate from the named hosts.
    DeleteCertificate {
        hosts: Vec<String>,
        af_unique_id: String,
    },
    /// Withdraw the content hosting configuration of a session.
    DeleteContentHosting {
        hosts: Vec<String>,
        provisioning_session_id: String,
    },
    /// Purge cached content for a session, optionally filtered by a
    /// regular expression. The tracker aggregates per-host completions
    /// so the originating M1 request can be answered.
    PurgeContentHostingCache {
        hosts: Vec<String>,
        provisioning_session_id: String,
        pattern: Option<String>,
        tracker: Arc<PurgeTracker>,
    },
    /// First phase of session deletion: withdraw every mirror of the
    /// session from the named hosts. Each host confirms back through the
    /// store once its queues hold nothing for this session.
    WithdrawSession {
        hosts: Vec<String>,
        provisioning_session_id: String,
        certificate_ids: Vec<String>,
    },
}

pub type SyncSender = mpsc::UnboundedSender<SyncEvent>;
pub type SyncReceiver = mpsc::UnboundedReceiver<SyncEvent>;

pub fn channel() -> (SyncSender, SyncReceiver) {
    mpsc::unbounded_channel()
}

// ── Purge aggregation ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub purged: u32,
    pub failures: u32,
}

/// Aggregates purge completions across the participating hosts.
///
/// The M1 handler that initiated the purge awaits [`PurgeTracker::wait`];
/// each application server node reports exactly once.
#[derive(Debug)]
pub struct PurgeTracker {
    remaining: AtomicUsize,
    purged: AtomicU32,
    failures: AtomicU32,
    notify: Notify,
}

impl PurgeTracker {
    pub fn new(parties: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(parties),
            purged: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            notify: Notify::new(),
        })
    }

    /// Records one host's result: the number of purged entries, or a
    /// failure.
    pub fn complete(&self, purged: Option<u32>) {
        match purged {
            Some(count) => {
                self.purged.fetch_add(count, Ordering::SeqCst);
            }
            None => {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Waits until every participating host has reported.
    pub async fn wait(&self) -> PurgeOutcome {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return PurgeOutcome {
                    purged: self.purged.load(Ordering::SeqCst),
                    failures: self.failures.load(Ordering::SeqCst),
                };
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracker_with_no_parties_resolves_immediately() {
        let tracker = PurgeTracker::new(0);
        let outcome = tracker.wait().await;
        assert_eq!(outcome, PurgeOutcome { purged: 0, failures: 0 });
    }

    #[tokio::test]
    async fn tracker_sums_purge_counts() {
        let tracker = PurgeTracker::new(2);
        let waiter = {
            let t = Arc::clone(&tracker);
            tokio::spawn(async move { t.wait().await })
        };
        tracker.complete(Some(3));
        tracker.complete(Some(4));
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.purged, 7);
        assert_eq!(outcome.failures, 0);
    }

    #[tokio::test]
    async fn tracker_counts_failures() {
        let tracker = PurgeTracker::new(2);
        tracker.complete(Some(1));
        tracker.complete(None);
        let outcome = tracker.wait().await;
        assert_eq!(outcome.purged, 1);
        assert_eq!(outcome.failures, 1);
    }

    #[tokio::test]
    async fn channel_delivers_events_in_order() {
        let (tx, mut rx) = channel();
        tx.send(SyncEvent::UploadCertificate {
            hosts: vec!["a".into()],
            af_unique_id: "ps:c1".into(),
        })
        .unwrap();
        tx.send(SyncEvent::UploadContentHosting {
            hosts: vec!["a".into()],
            provisioning_session_id: "ps".into(),
        })
        .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SyncEvent::UploadCertificate { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SyncEvent::UploadContentHosting { .. })
        ));
    }
}
