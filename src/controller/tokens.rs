//! Bootstrap token store.
//!
//! Tokens are 128-bit random values handed to operators out of band and
//! presented exactly once during enrollment. Only the SHA-256 digest is ever
//! stored. All mutations serialize on a single lock; when a persistence path
//! is configured the full set is rewritten atomically on every change and
//! reloaded on startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::errors::{AuthErrorType, Error, Result};

/// Token-consumption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumePolicy {
    /// A token authenticates exactly one enrollment.
    SingleUse,
    /// A token authenticates any number of enrollments until it expires.
    ReusableWithinTtl,
}

/// Stored per-token state. Keys of the store are the lowercase hex SHA-256
/// of the token value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_by_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TokenStore {
    records: Mutex<HashMap<String, TokenRecord>>,
    policy: ConsumePolicy,
    ttl: Duration,
    persist_path: Option<PathBuf>,
}

impl TokenStore {
    /// Create a store, loading any persisted records from `persist_path`.
    pub fn new(policy: ConsumePolicy, ttl: Duration, persist_path: Option<PathBuf>) -> Result<Self> {
        let records = match &persist_path {
            Some(path) if path.exists() => load_records(path)?,
            _ => HashMap::new(),
        };
        if !records.is_empty() {
            info!(tokens = records.len(), "loaded persisted enrollment tokens");
        }
        Ok(Self { records: Mutex::new(records), policy, ttl, persist_path })
    }

    /// Mint a fresh token. Returns the plaintext value (the only time it
    /// exists outside the caller) and its expiry.
    pub fn create(&self) -> Result<(String, DateTime<Utc>)> {
        self.create_at(Utc::now())
    }

    pub fn create_at(&self, now: DateTime<Utc>) -> Result<(String, DateTime<Utc>)> {
        let mut raw = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = hex::encode(raw);

        let expires_at = now
            + chrono::Duration::from_std(self.ttl)
                .map_err(|_| Error::config("token ttl out of range"))?;

        let mut records = self.lock();
        purge_expired(&mut records, now);
        records.insert(
            hash_token(&token),
            TokenRecord { expires_at, consumed: false, consumed_by_id: None, created_at: now },
        );
        self.persist(&records)?;

        Ok((token, expires_at))
    }

    /// Validate and consume a token for workload `id`.
    pub fn consume(&self, token: &str, id: &str) -> Result<()> {
        self.consume_at(token, id, Utc::now())
    }

    pub fn consume_at(&self, token: &str, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut records = self.lock();
        let hash = hash_token(token.trim());

        let record = records.get_mut(&hash).ok_or_else(|| {
            Error::auth("enrollment token is not recognized", AuthErrorType::InvalidToken)
        })?;

        if record.expires_at <= now {
            return Err(Error::auth("enrollment token has expired", AuthErrorType::ExpiredToken));
        }
        if record.consumed && self.policy == ConsumePolicy::SingleUse {
            return Err(Error::auth(
                "enrollment token has already been consumed",
                AuthErrorType::ConsumedToken,
            ));
        }

        record.consumed = true;
        record.consumed_by_id = Some(id.to_string());
        self.persist(&records)?;
        Ok(())
    }

    /// Number of live (unexpired) tokens.
    pub fn live_count(&self) -> usize {
        let now = Utc::now();
        self.lock().values().filter(|r| r.expires_at > now).count()
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> HashMap<String, TokenRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TokenRecord>> {
        self.records.lock().expect("token store lock poisoned")
    }

    /// Rewrite the full record set. Best-effort crash safety: serialize to a
    /// sibling temp file, then rename over the target.
    fn persist(&self, records: &HashMap<String, TokenRecord>) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        let payload = serde_json::to_vec_pretty(records)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, payload).map_err(|e| Error::Io {
            source: e,
            context: format!("failed to write token store '{}'", tmp.display()),
        })?;
        std::fs::rename(&tmp, path).map_err(|e| Error::Io {
            source: e,
            context: format!("failed to replace token store '{}'", path.display()),
        })?;
        Ok(())
    }
}

fn load_records(path: &Path) -> Result<HashMap<String, TokenRecord>> {
    let bytes = std::fs::read(path).map_err(|e| Error::Io {
        source: e,
        context: format!("failed to read token store '{}'", path.display()),
    })?;
    match serde_json::from_slice(&bytes) {
        Ok(records) => Ok(records),
        Err(e) => {
            // A corrupt store is recoverable: tokens are short-lived.
            warn!(path = %path.display(), error = %e, "token store unreadable, starting empty");
            Ok(HashMap::new())
        }
    }
}

fn purge_expired(records: &mut HashMap<String, TokenRecord>, now: DateTime<Utc>) {
    records.retain(|_, record| record.expires_at > now);
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TTL: Duration = Duration::from_secs(600);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store(policy: ConsumePolicy) -> TokenStore {
        TokenStore::new(policy, TTL, None).unwrap()
    }

    #[test]
    fn tokens_are_32_hex_chars_and_stored_hashed() {
        let store = store(ConsumePolicy::SingleUse);
        let (token, expires_at) = store.create_at(at(0)).unwrap();

        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(expires_at, at(600));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot.contains_key(&token), "plaintext token must not be a key");
        assert!(snapshot.contains_key(&hash_token(&token)));
    }

    #[test]
    fn single_use_token_rejects_second_consume() {
        let store = store(ConsumePolicy::SingleUse);
        let (token, _) = store.create_at(at(0)).unwrap();

        store.consume_at(&token, "c1", at(1)).unwrap();
        let err = store.consume_at(&token, "c2", at(2)).unwrap_err();
        assert!(matches!(err, Error::Auth { error_type: AuthErrorType::ConsumedToken, .. }));

        let record = store.snapshot().remove(&hash_token(&token)).unwrap();
        assert_eq!(record.consumed_by_id.as_deref(), Some("c1"));
    }

    #[test]
    fn reusable_token_allows_multiple_consumers_until_expiry() {
        let store = store(ConsumePolicy::ReusableWithinTtl);
        let (token, _) = store.create_at(at(0)).unwrap();

        store.consume_at(&token, "c1", at(1)).unwrap();
        store.consume_at(&token, "c2", at(2)).unwrap();

        let err = store.consume_at(&token, "c3", at(601)).unwrap_err();
        assert!(matches!(err, Error::Auth { error_type: AuthErrorType::ExpiredToken, .. }));
    }

    #[test]
    fn unknown_and_expired_tokens_are_rejected() {
        let store = store(ConsumePolicy::SingleUse);
        let err = store.consume_at("00000000000000000000000000000000", "c1", at(0)).unwrap_err();
        assert!(matches!(err, Error::Auth { error_type: AuthErrorType::InvalidToken, .. }));

        let (token, _) = store.create_at(at(0)).unwrap();
        let err = store.consume_at(&token, "c1", at(600)).unwrap_err();
        assert!(matches!(err, Error::Auth { error_type: AuthErrorType::ExpiredToken, .. }));
    }

    #[test]
    fn persistence_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = TokenStore::new(ConsumePolicy::SingleUse, TTL, Some(path.clone())).unwrap();
        let (token_a, _) = store.create_at(at(0)).unwrap();
        let (_token_b, _) = store.create_at(at(1)).unwrap();
        store.consume_at(&token_a, "c1", at(2)).unwrap();
        let before = store.snapshot();

        let reloaded = TokenStore::new(ConsumePolicy::SingleUse, TTL, Some(path)).unwrap();
        assert_eq!(reloaded.snapshot(), before);

        // Consumption state survives the reload.
        let err = reloaded.consume_at(&token_a, "c9", at(3)).unwrap_err();
        assert!(matches!(err, Error::Auth { error_type: AuthErrorType::ConsumedToken, .. }));
    }

    #[test]
    fn expired_tokens_are_purged_on_create() {
        let store = store(ConsumePolicy::SingleUse);
        let (_old, _) = store.create_at(at(0)).unwrap();
        let (_new, _) = store.create_at(at(700)).unwrap();
        assert_eq!(store.snapshot().len(), 1);
    }
}
