//! Authoritative tunneler allowlist and its broadcast hub.
//!
//! The controller owns the full set; connected connectors receive a snapshot
//! when their stream is accepted and single-entry deltas afterwards. Deltas
//! travel over a broadcast channel with a bounded per-subscriber mailbox: a
//! slow connector lags and reconciles from a fresh snapshot on reconnect
//! instead of back-pressuring the publisher.

use std::collections::BTreeMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::debug;

use crate::control::AllowlistEntry;

/// Mailbox depth per subscribed connector stream.
const DELTA_BUFFER: usize = 64;

#[derive(Debug)]
pub struct AllowlistHub {
    entries: RwLock<BTreeMap<String, String>>,
    tx: broadcast::Sender<AllowlistEntry>,
}

impl AllowlistHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DELTA_BUFFER);
        Self { entries: RwLock::new(BTreeMap::new()), tx }
    }

    /// Add an identity to the authoritative set and fan the delta out to
    /// every subscribed connector.
    pub fn publish(&self, entry: AllowlistEntry) {
        {
            let mut entries = self.entries.write().expect("allowlist lock poisoned");
            entries.insert(entry.tunneler_id.clone(), entry.spiffe_id.clone());
        }
        // No receivers is fine: connectors reconcile from snapshots.
        if self.tx.send(entry).is_err() {
            debug!("allowlist delta published with no connected subscribers");
        }
    }

    /// Full authoritative set.
    pub fn snapshot(&self) -> Vec<AllowlistEntry> {
        self.entries
            .read()
            .expect("allowlist lock poisoned")
            .iter()
            .map(|(tunneler_id, spiffe_id)| AllowlistEntry {
                tunneler_id: tunneler_id.clone(),
                spiffe_id: spiffe_id.clone(),
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AllowlistEntry> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("allowlist lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AllowlistHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> AllowlistEntry {
        AllowlistEntry {
            tunneler_id: id.to_string(),
            spiffe_id: format!("spiffe://mycorp.internal/tunneler/{}", id),
        }
    }

    #[test]
    fn snapshot_reflects_published_entries() {
        let hub = AllowlistHub::new();
        hub.publish(entry("t1"));
        hub.publish(entry("t2"));
        // Re-publishing the same id is an idempotent upsert.
        hub.publish(entry("t1"));

        let snapshot = hub.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&entry("t1")));
        assert!(snapshot.contains(&entry("t2")));
    }

    #[tokio::test]
    async fn subscribers_receive_deltas_after_snapshot() {
        let hub = AllowlistHub::new();
        hub.publish(entry("t1"));

        let mut rx = hub.subscribe();
        let snapshot = hub.snapshot();
        assert_eq!(snapshot, vec![entry("t1")]);

        hub.publish(entry("t2"));
        assert_eq!(rx.recv().await.unwrap(), entry("t2"));

        // Snapshot plus received deltas equals the authoritative set.
        let mut reconciled: Vec<AllowlistEntry> = snapshot;
        reconciled.push(entry("t2"));
        reconciled.sort_by(|a, b| a.tunneler_id.cmp(&b.tunneler_id));
        assert_eq!(reconciled, hub.snapshot());
    }
}
