//! Presence registries.
//!
//! Two independent keyed tables, one per workload kind, updated on
//! enrollment and on every heartbeat. Records are retained after a workload
//! goes quiet; presence is derived from `last_seen` at query time.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::control::PresenceStatus;

/// A record is ONLINE iff its last heartbeat is younger than this.
pub const OFFLINE_AFTER_SECS: i64 = 30;

/// Classify a `last_seen` instant against the offline threshold.
pub fn presence_status(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> PresenceStatus {
    if now.signed_duration_since(last_seen) < chrono::Duration::seconds(OFFLINE_AFTER_SECS) {
        PresenceStatus::Online
    } else {
        PresenceStatus::Offline
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorRecord {
    pub id: String,
    pub private_ip: String,
    pub version: String,
    pub last_seen: DateTime<Utc>,
}

impl ConnectorRecord {
    pub fn status_at(&self, now: DateTime<Utc>) -> PresenceStatus {
        presence_status(self.last_seen, now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelerRecord {
    pub id: String,
    pub spiffe_id: String,
    pub connector_id: String,
    pub last_seen: DateTime<Utc>,
}

impl TunnelerRecord {
    pub fn status_at(&self, now: DateTime<Utc>) -> PresenceStatus {
        presence_status(self.last_seen, now)
    }
}

/// Connector presence table, keyed by connector id.
#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    records: RwLock<HashMap<String, ConnectorRecord>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: ConnectorRecord) {
        let mut records = self.records.write().expect("connector registry lock poisoned");
        records.insert(record.id.clone(), record);
    }

    pub fn record_heartbeat(&self, id: &str, private_ip: Option<&str>) {
        self.record_heartbeat_at(id, private_ip, Utc::now());
    }

    pub fn record_heartbeat_at(&self, id: &str, private_ip: Option<&str>, now: DateTime<Utc>) {
        let mut records = self.records.write().expect("connector registry lock poisoned");
        let record = records.entry(id.to_string()).or_insert_with(|| ConnectorRecord {
            id: id.to_string(),
            private_ip: String::new(),
            version: String::new(),
            last_seen: now,
        });
        record.last_seen = now;
        if let Some(ip) = private_ip {
            if !ip.is_empty() {
                record.private_ip = ip.to_string();
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<ConnectorRecord> {
        self.records.read().expect("connector registry lock poisoned").get(id).cloned()
    }

    /// Snapshot of all records, most recently seen first. The returned
    /// records are copies; mutating them does not touch the registry.
    pub fn list(&self) -> Vec<ConnectorRecord> {
        let mut records: Vec<ConnectorRecord> = self
            .records
            .read()
            .expect("connector registry lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        records
    }
}

/// Tunneler presence table, keyed by tunneler id.
#[derive(Debug, Default)]
pub struct TunnelerRegistry {
    records: RwLock<HashMap<String, TunnelerRecord>>,
}

impl TunnelerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: TunnelerRecord) {
        let mut records = self.records.write().expect("tunneler registry lock poisoned");
        records.insert(record.id.clone(), record);
    }

    pub fn record_heartbeat(&self, id: &str, spiffe_id: &str, connector_id: &str) {
        self.record_heartbeat_at(id, spiffe_id, connector_id, Utc::now());
    }

    pub fn record_heartbeat_at(
        &self,
        id: &str,
        spiffe_id: &str,
        connector_id: &str,
        now: DateTime<Utc>,
    ) {
        let mut records = self.records.write().expect("tunneler registry lock poisoned");
        let record = records.entry(id.to_string()).or_insert_with(|| TunnelerRecord {
            id: id.to_string(),
            spiffe_id: spiffe_id.to_string(),
            connector_id: connector_id.to_string(),
            last_seen: now,
        });
        record.last_seen = now;
        if !spiffe_id.is_empty() {
            record.spiffe_id = spiffe_id.to_string();
        }
        if !connector_id.is_empty() {
            record.connector_id = connector_id.to_string();
        }
    }

    pub fn get(&self, id: &str) -> Option<TunnelerRecord> {
        self.records.read().expect("tunneler registry lock poisoned").get(id).cloned()
    }

    pub fn list(&self) -> Vec<TunnelerRecord> {
        let mut records: Vec<TunnelerRecord> = self
            .records
            .read()
            .expect("tunneler registry lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn presence_threshold_is_strict() {
        let seen = at(0);
        assert_eq!(presence_status(seen, at(0)), PresenceStatus::Online);
        assert_eq!(presence_status(seen, at(29)), PresenceStatus::Online);
        assert_eq!(presence_status(seen, at(30)), PresenceStatus::Offline);
        assert_eq!(presence_status(seen, at(120)), PresenceStatus::Offline);
    }

    #[test]
    fn heartbeat_is_idempotent_on_identity_fields() {
        let registry = ConnectorRegistry::new();
        registry.upsert(ConnectorRecord {
            id: "c1".into(),
            private_ip: "10.0.0.5".into(),
            version: "1.0".into(),
            last_seen: at(0),
        });

        registry.record_heartbeat_at("c1", Some("10.0.0.5"), at(10));
        registry.record_heartbeat_at("c1", Some("10.0.0.5"), at(20));

        let record = registry.get("c1").unwrap();
        assert_eq!(record.private_ip, "10.0.0.5");
        assert_eq!(record.version, "1.0");
        assert_eq!(record.last_seen, at(20));
    }

    #[test]
    fn offline_records_are_retained_and_recover() {
        let registry = TunnelerRegistry::new();
        registry.record_heartbeat_at("t1", "spiffe://td/tunneler/t1", "c1", at(0));

        let record = registry.get("t1").unwrap();
        assert_eq!(record.status_at(at(60)), PresenceStatus::Offline);

        registry.record_heartbeat_at("t1", "spiffe://td/tunneler/t1", "c1", at(61));
        assert_eq!(registry.get("t1").unwrap().status_at(at(62)), PresenceStatus::Online);
    }

    #[test]
    fn list_is_sorted_by_last_seen_desc() {
        let registry = ConnectorRegistry::new();
        registry.record_heartbeat_at("old", None, at(0));
        registry.record_heartbeat_at("new", None, at(50));
        registry.record_heartbeat_at("mid", None, at(25));

        let ids: Vec<String> = registry.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn list_returns_defensive_copies() {
        let registry = ConnectorRegistry::new();
        registry.record_heartbeat_at("c1", Some("10.0.0.5"), at(0));

        let mut listed = registry.list();
        listed[0].private_ip = "mutated".into();
        assert_eq!(registry.get("c1").unwrap().private_ip, "10.0.0.5");
    }
}
