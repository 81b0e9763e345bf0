//! Connector-local allowlist cache.
//!
//! Replicated from the controller: a full snapshot on (re)connect, additive
//! single-entry deltas afterwards. Consulted by the inbound authentication
//! policy before a tunneler stream reaches any handler.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::control::AllowlistEntry;
use crate::controller::auth::PeerAllowlist;
use crate::identity::SpiffeId;

#[derive(Debug, Default)]
pub struct LocalAllowlist {
    /// tunneler_id -> spiffe URI
    entries: RwLock<HashMap<String, String>>,
}

impl LocalAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile against a fresh authoritative snapshot.
    pub fn replace_snapshot(&self, entries: Vec<AllowlistEntry>) {
        let mut map = self.entries.write().expect("allowlist cache lock poisoned");
        map.clear();
        for entry in entries {
            map.insert(entry.tunneler_id, entry.spiffe_id);
        }
    }

    /// Apply one additive delta.
    pub fn insert(&self, entry: AllowlistEntry) {
        let mut map = self.entries.write().expect("allowlist cache lock poisoned");
        map.insert(entry.tunneler_id, entry.spiffe_id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("allowlist cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerAllowlist for LocalAllowlist {
    fn allows(&self, spiffe: &SpiffeId) -> bool {
        let uri = spiffe.uri();
        self.entries
            .read()
            .expect("allowlist cache lock poisoned")
            .values()
            .any(|allowed| allowed == &uri)
    }
}
